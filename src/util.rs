//! Small shared helpers: geodesy, value rendering, local time.

use chrono::{DateTime, Local, TimeZone};
use serde_json::Value;

/// Mean Earth radius in km (IUGG).
pub const EARTH_RADIUS_KM: f64 = 6371.0088;
pub const KM_TO_MI: f64 = 0.621371;

/// Great-circle distance in kilometres (haversine).
pub fn km_between(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Round to one decimal place.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Float text that keeps a trailing `.0` on whole numbers (`-122.0`, `37.5`).
///
/// Existing fingerprints were written this way, so it must stay stable.
pub fn float_text(v: f64) -> String {
    format!("{v:?}")
}

/// Plain-text rendering of a JSON value for templates and fingerprints.
/// Strings are unquoted, null is `None`, booleans are `True`/`False`.
pub fn value_text(v: &Value) -> String {
    match v {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => float_text(f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

pub fn local_str<Tz: TimeZone>(ts: &DateTime<Tz>) -> String {
    ts.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

pub fn now_local_str() -> String {
    local_str(&Local::now())
}

//! # Station payload decoder
//! Turns weather-station payloads into a [`CanonicalReading`].
//!
//! Input is either raw bytes (UDP broadcast, possibly with binary noise and
//! odd separators) or an already extracted field map (HTTP ingest).
//! Decoding never fails: anything unrecognized simply ends up absent.
//!
//! Fallback order for raw bytes:
//! 1. UTF-8, else Latin-1.
//! 2. Non printable characters → space.
//! 3. Candidate run: text after `?` → `k=v` run regex → first line.
//! 4. Query-string parse, else loose `k=v` token scan.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Raw decoded fields, ordered for stable output.
pub type Fields = BTreeMap<String, String>;

pub const MPH_TO_MPS: f64 = 0.44704;
pub const INHG_TO_HPA: f64 = 33.863_886_666_7;
pub const HPA_TO_INH2O: f64 = 0.295_299_830_714;
pub const IN_TO_MM: f64 = 25.4;

const COMPASS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

const PRESSURE_KEYS: [&str; 3] = ["baromin", "baromrelin", "baromabsin"];
const TIMESTAMP_KEYS: [&str; 3] = ["dateutc", "datetime", "time_utc"];
const BATTERY_KEYS: [&str; 5] = ["batt", "battery", "lowbatt", "wh65batt", "wh32batt"];
const DATE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

static QS_RUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9_]+=[^&\s]+(?:[&;,\s]+[A-Za-z0-9_]+=[^&\s]+)+)").expect("qs run regex")
});
static PAIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9_]+)\s*=\s*([^&;,\s]+)").expect("pair regex"));

/// Low-battery indicator. Vendors disagree on encoding, so only `0`/`1` are normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Battery {
    Flag(u8),
    Raw(String),
}

/// One normalized station sample. Imperial units are canonical; metric
/// companions are derived.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalReading {
    pub timestamp_utc: Option<String>,
    pub temperature_f: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<i64>,
    pub wind_mph: Option<f64>,
    pub wind_mps: Option<f64>,
    pub wind_gust_mph: Option<f64>,
    pub wind_gust_mps: Option<f64>,
    pub wind_dir_deg: Option<i64>,
    pub wind_dir: Option<String>,
    pub pressure_hpa: Option<f64>,
    pub pressure_in_h2o: Option<f64>,
    /// Rain values default to 0 rather than absent.
    pub rain_rate_in_hr: f64,
    pub rain_rate_mm_hr: f64,
    pub rain_daily_in: f64,
    pub rain_daily_mm: f64,
    pub solar_wm2: Option<f64>,
    pub uv_index: Option<f64>,
    pub pm2p5_ugm3: Option<f64>,
    pub pm10_ugm3: Option<f64>,
    pub indoor_temperature_f: Option<f64>,
    pub indoor_temperature_c: Option<f64>,
    pub indoor_humidity_pct: Option<i64>,
    pub battery: Option<Battery>,
    /// Fields as received, kept for audit.
    pub raw: Fields,
}

impl CanonicalReading {
    /// True when no measurement was recognized.
    pub fn is_blank(&self) -> bool {
        *self
            == CanonicalReading {
                raw: self.raw.clone(),
                ..CanonicalReading::default()
            }
    }
}

/// Decode raw bytes into a reading.
pub fn decode(raw: &[u8]) -> CanonicalReading {
    normalize_fields(&parse_fields(raw))
}

/// Extract a field map from raw bytes. Empty when nothing looks like `k=v`.
pub fn parse_fields(raw: &[u8]) -> Fields {
    let text = ascii_only(&safe_text(raw));

    if let Some(candidate) = extract_candidate(&text) {
        let parsed = parse_candidate(candidate);
        if !parsed.is_empty() {
            return parsed;
        }
    }

    PAIR_RE
        .captures_iter(&text)
        .map(|c| (c[1].to_string(), unquote_plus(&c[2])))
        .collect()
}

fn safe_text(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        // Latin-1: every byte maps to the code point of the same value.
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

fn ascii_only(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            ' '..='~' | '\r' | '\n' | '\t' => ch,
            _ => ' ',
        })
        .collect()
}

fn first_line(text: &str) -> &str {
    text.split(['\r', '\n']).next().unwrap_or("")
}

fn extract_candidate(text: &str) -> Option<&str> {
    after_question_mark(text)
        .or_else(|| QS_RUN_RE.find(text).map(|m| m.as_str()))
        .or_else(|| {
            let line = first_line(text);
            line.contains('=').then(|| line.trim())
        })
}

fn after_question_mark(text: &str) -> Option<&str> {
    let (_, rest) = text.split_once('?')?;
    let frag = first_line(rest).trim();
    frag.contains('=').then_some(frag)
}

fn parse_candidate(candidate: &str) -> Fields {
    let mut norm = candidate.replace([';', ','], "&");
    if norm.starts_with('/') {
        if let Some(q) = url_query(&norm).filter(|q| !q.is_empty()) {
            norm = q.to_string();
        }
    }
    // values go through a second `+`/`%xx` pass after the query split, so
    // `%2B1` ends up as " 1" rather than "+1"
    parse_query(&norm)
        .into_iter()
        .map(|(k, v)| (k, unquote_plus(&v)))
        .collect()
}

/// Query part of a path-with-query, without any fragment.
pub(crate) fn url_query(s: &str) -> Option<&str> {
    let (_, q) = s.split_once('?')?;
    Some(q.split('#').next().unwrap_or(""))
}

/// Parse `a=1&b=2`, decoding `%xx` and `+`. Pairs without `=` keep an empty
/// value; the last occurrence of a key wins.
pub(crate) fn parse_query(s: &str) -> Fields {
    form_urlencoded::parse(s.as_bytes())
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub(crate) fn unquote_plus(v: &str) -> String {
    let wrapped = format!("v={v}");
    form_urlencoded::parse(wrapped.as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

// -------- coercion helpers --------

fn is_sentinel(s: &str) -> bool {
    s.is_empty()
        || ["na", "nan", "null", "none"]
            .iter()
            .any(|t| s.eq_ignore_ascii_case(t))
}

/// Lenient float: blanks, `NA`/`NaN`/`null`/`None` and garbage are absent.
pub fn safe_float(v: Option<&str>) -> Option<f64> {
    let s = v?.trim();
    if is_sentinel(s) {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Lenient integer; fractional input is truncated.
pub fn safe_int(v: Option<&str>) -> Option<i64> {
    safe_float(v).map(|f| f.trunc() as i64)
}

fn get<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields.get(key).map(String::as_str)
}

/// First alias with a non-empty value.
fn first_nonblank<'a>(fields: &'a Fields, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| get(fields, k))
        .find(|v| !v.is_empty())
}

/// First alias that parses as a number.
fn first_number(fields: &Fields, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| safe_float(get(fields, k)))
}

fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// 16-point compass for a bearing in degrees; N spans 348.75..11.25.
pub fn compass_point(degrees: f64) -> &'static str {
    let adjusted = (degrees + 11.25).rem_euclid(360.0);
    let idx = (adjusted / 22.5).floor() as usize;
    COMPASS[idx.min(COMPASS.len() - 1)]
}

/// Parse one of the known station date formats (UTC), then epoch seconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            let secs = s.parse::<f64>().ok().filter(|f| f.is_finite())?;
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        })
}

fn battery(fields: &Fields) -> Option<Battery> {
    let raw = BATTERY_KEYS.iter().find_map(|k| get(fields, k))?;
    Some(match raw.trim() {
        "0" => Battery::Flag(0),
        "1" => Battery::Flag(1),
        _ => Battery::Raw(raw.to_string()),
    })
}

/// Normalize an extracted field map. Pure; the same input always yields the
/// same reading.
pub fn normalize_fields(fields: &Fields) -> CanonicalReading {
    let tf = safe_float(get(fields, "tempf"));
    let tc = safe_float(get(fields, "tempc"));

    let itf = safe_float(first_nonblank(fields, &["indoortempf", "tempinf"]));
    let itc = safe_float(first_nonblank(fields, &["indoortempc", "tempinc"]));

    let wind = safe_float(get(fields, "windspeedmph"));
    let gust = safe_float(get(fields, "windgustmph"));
    let wind_dir_deg = safe_int(get(fields, "winddir"));

    let pressure_hpa = first_number(fields, &PRESSURE_KEYS).map(|inhg| inhg * INHG_TO_HPA);

    let rain_rate = safe_float(get(fields, "rainratein"));
    let rain_daily = first_number(fields, &["dailyrainin", "eventrainin"]);

    let timestamp_utc = TIMESTAMP_KEYS
        .iter()
        .find_map(|k| get(fields, k))
        .and_then(parse_timestamp)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true));

    CanonicalReading {
        timestamp_utc,
        temperature_f: tf.or(tc.map(c_to_f)),
        temperature_c: tc.or(tf.map(f_to_c)),
        humidity_pct: safe_int(get(fields, "humidity")),
        wind_mph: wind,
        wind_mps: wind.map(|v| v * MPH_TO_MPS),
        wind_gust_mph: gust,
        wind_gust_mps: gust.map(|v| v * MPH_TO_MPS),
        wind_dir_deg,
        wind_dir: wind_dir_deg.map(|d| compass_point(d as f64).to_string()),
        pressure_hpa,
        pressure_in_h2o: pressure_hpa.map(|h| h * HPA_TO_INH2O),
        rain_rate_in_hr: rain_rate.unwrap_or(0.0),
        rain_rate_mm_hr: rain_rate.map(|r| r * IN_TO_MM).unwrap_or(0.0),
        rain_daily_in: rain_daily.unwrap_or(0.0),
        rain_daily_mm: rain_daily.map(|r| r * IN_TO_MM).unwrap_or(0.0),
        solar_wm2: safe_float(get(fields, "solarradiation")),
        uv_index: safe_float(first_nonblank(fields, &["UV", "uv"])),
        pm2p5_ugm3: first_number(fields, &["pm2_5", "pm25", "pm25_ch1"]),
        pm10_ugm3: first_number(fields, &["pm10", "pm10_ch1"]),
        indoor_temperature_f: itf.or(itc.map(c_to_f)),
        indoor_temperature_c: itc.or(itf.map(f_to_c)),
        indoor_humidity_pct: safe_int(first_nonblank(fields, &["indoorhumidity", "humidityin"])),
        battery: battery(fields),
        raw: fields.clone(),
    }
}

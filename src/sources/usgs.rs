//! USGS earthquake GeoJSON feed, filtered by distance from the configured point.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{fetch::get_with_retry, forward_if_new, Poster, Source};
use crate::config::{Location, SourceConfig};
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::{into_item, Item};
use crate::util::{km_between, local_str, round1, value_text, KM_TO_MI};

pub const BUCKET: &str = "usgs";

#[derive(Debug, Clone, Deserialize)]
pub struct UsgsParams {
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default = "default_max_mi")]
    pub max_mi: f64,
}

fn default_feed_url() -> String {
    "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/all_day.geojson".to_string()
}

fn default_max_mi() -> f64 {
    100.0
}

pub struct Usgs {
    name: String,
    params: UsgsParams,
    location: Location,
    http: Client,
    poster: Poster,
}

impl Usgs {
    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Result<Self> {
        Ok(Self {
            name: cfg.display_name(),
            params: cfg.params_as()?,
            location: ctx.general.location()?,
            http: ctx.http.clone(),
            poster: Poster::from_config(cfg, ctx),
        })
    }
}

/// Quakes within `max_mi` of `origin`, with fingerprints.
pub fn quakes(doc: &Value, origin: Location, max_mi: f64) -> Vec<(String, Item)> {
    let Some(features) = doc.get("features").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for f in features {
        let props = &f["properties"];
        let coords = &f["geometry"]["coordinates"];
        let (Some(lon), Some(lat)) = (coords[0].as_f64(), coords[1].as_f64()) else {
            continue;
        };
        let dist_mi = km_between(origin.lat, origin.lon, lat, lon) * KM_TO_MI;
        if dist_mi > max_mi {
            continue;
        }
        debug!(id = %f["id"], "quake in range");

        // feed time is epoch milliseconds
        let millis = props["time"].as_f64().unwrap_or(0.0) as i64;
        let timestamp_local = Utc
            .timestamp_millis_opt(millis)
            .single()
            .map(|t| local_str(&t));

        let item = json!({
            "id": f["id"],
            "timestamp_local": timestamp_local,
            "mag": props["mag"],
            "place": props["place"],
            "url": props["url"],
            "lat": lat,
            "lon": lon,
            "depth_km": coords[2],
            "distance_mi_from_origin": round1(dist_mi),
        });
        let fp = fingerprint(BUCKET, &[value_text(&f["id"])]);
        out.push((fp, into_item(item)));
    }
    out
}

#[async_trait]
impl Source for Usgs {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        let doc: Value = get_with_retry(&self.http, &self.params.feed_url, &[], &[])
            .await?
            .json()
            .await
            .context("decoding USGS feed")?;

        let mut new_count = 0;
        for (fp, item) in quakes(&doc, self.location, self.params.max_mi) {
            if forward_if_new(seen, BUCKET, &fp, &self.poster, item).await {
                new_count += 1;
            }
        }
        if new_count > 0 {
            info!(source = %self.name, new_count, "new earthquake reports");
        } else {
            debug!(source = %self.name, "no new quakes");
        }
        Ok(new_count)
    }
}

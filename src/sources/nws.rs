//! National Weather Service active alerts for the configured point.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{fetch::get_with_retry, forward_if_new, Poster, Source};
use crate::config::{Location, SourceConfig};
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::{into_item, Item};
use crate::util::value_text;

pub const BUCKET: &str = "nws";

#[derive(Debug, Clone, Deserialize)]
pub struct NwsParams {
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    "https://api.weather.gov/alerts/active".to_string()
}

pub struct Nws {
    name: String,
    params: NwsParams,
    location: Location,
    http: Client,
    poster: Poster,
}

impl Nws {
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

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Alert items with their fingerprints, in feed order.
pub fn alerts(doc: &Value) -> Vec<(String, Item)> {
    let Some(features) = doc.get("features").and_then(Value::as_array) else {
        return Vec::new();
    };
    features
        .iter()
        .map(|f| {
            let p = &f["properties"];
            let item = json!({
                "id": f["id"],
                "event": p["event"],
                "severity": p["severity"],
                "urgency": p["urgency"],
                "certainty": p["certainty"],
                "headline": p["headline"],
                "effective": p["effective"],
                "expires": p["expires"],
                "areaDesc": p["areaDesc"],
                "cap": p["cap"],
                "senderName": p["senderName"],
            });
            let key = if is_blank(&f["id"]) { &p["headline"] } else { &f["id"] };
            let fp = fingerprint(BUCKET, &[value_text(key)]);
            (fp, into_item(item))
        })
        .collect()
}

#[async_trait]
impl Source for Nws {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        let point = format!("{},{}", self.location.lat, self.location.lon);
        let doc: Value = get_with_retry(
            &self.http,
            &self.params.api_url,
            &[("Accept", "application/geo+json, application/json")],
            &[("point", point)],
        )
        .await?
        .json()
        .await
        .context("decoding NWS alerts")?;

        let mut new_count = 0;
        for (fp, item) in alerts(&doc) {
            if forward_if_new(seen, BUCKET, &fp, &self.poster, item).await {
                new_count += 1;
            }
        }
        if new_count > 0 {
            info!(source = %self.name, new_count, "new NWS alerts");
        } else {
            debug!(source = %self.name, "no new NWS alerts");
        }
        Ok(new_count)
    }
}

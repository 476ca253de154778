//! Posts the PulsePoint / Broadcastify helper links once per agency.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{forward_if_new, Poster, Source};
use crate::config::SourceConfig;
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::into_item;

pub const BUCKET: &str = "pulsepoint";

#[derive(Debug, Clone, Deserialize)]
pub struct PulsePointParams {
    #[serde(default = "default_agency")]
    pub agency_id: String,
    #[serde(default)]
    pub respond_url: Option<String>,
    #[serde(default = "default_broadcastify")]
    pub broadcastify: String,
}

fn default_agency() -> String {
    "43070".to_string()
}

fn default_broadcastify() -> String {
    "https://www.broadcastify.com/listen/feed/34259".to_string()
}

pub struct PulsePoint {
    name: String,
    params: PulsePointParams,
    poster: Poster,
}

impl PulsePoint {
    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Result<Self> {
        Ok(Self {
            name: cfg.display_name(),
            params: cfg.params_as()?,
            poster: Poster::from_config(cfg, ctx),
        })
    }

    fn respond_url(&self) -> String {
        self.params.respond_url.clone().unwrap_or_else(|| {
            format!("https://web.pulsepoint.org/?agencies={}", self.params.agency_id)
        })
    }
}

#[async_trait]
impl Source for PulsePoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        let fp = fingerprint(BUCKET, &[self.params.agency_id.as_str()]);
        let item = json!({
            "agency_id": self.params.agency_id,
            "respond_url": self.respond_url(),
            "broadcastify": self.params.broadcastify,
        });
        if forward_if_new(seen, BUCKET, &fp, &self.poster, into_item(item)).await {
            info!(source = %self.name, "posted helper links");
            return Ok(1);
        }
        Ok(0)
    }
}

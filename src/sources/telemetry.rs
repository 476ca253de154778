//! Weather-station telemetry source. A listener (HTTP ingest or broadcast
//! capture) fills the queue between polls; each poll drains it and forwards
//! only the newest sample.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Poster, Source};
use crate::config::SourceConfig;
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::into_item;
use crate::telemetry::{start_listener, ListenerHandle, MessageQueue, TelemetryParams};

pub const BUCKET: &str = "weather";
const LISTENER_KEYS: [&str; 6] = ["mode", "http", "udp", "queue_capacity", "pretty", "skip_blank"];

pub struct Telemetry {
    name: String,
    queue: MessageQueue,
    poster: Poster,
    pretty: bool,
    skip_blank: bool,
    listener: Option<ListenerHandle>,
    listener_down_reported: bool,
}

/// Listener settings live under `params`, or at the top level of the
/// source entry in older configs.
fn telemetry_params(cfg: &SourceConfig) -> Result<TelemetryParams> {
    let params_empty = match &cfg.params {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    };
    let legacy: Map<String, Value> = cfg
        .extra
        .iter()
        .filter(|(k, _)| LISTENER_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if params_empty && !legacy.is_empty() {
        return serde_json::from_value(Value::Object(legacy))
            .with_context(|| format!("invalid listener settings for source {}", cfg.display_name()));
    }
    cfg.params_as()
}

impl Telemetry {
    /// Start the configured listener and wire it to a fresh queue.
    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Result<Self> {
        let params = telemetry_params(cfg)?;
        let queue = MessageQueue::bounded(params.queue_capacity);
        let handle = start_listener(&params, queue.clone()).context("starting telemetry listener")?;
        let mut src = Self::with_queue(cfg.display_name(), queue, Poster::from_config(cfg, ctx));
        src.pretty = params.pretty;
        src.skip_blank = params.skip_blank;
        src.listener = Some(handle);
        Ok(src)
    }

    /// A source over an existing queue with no listener of its own.
    pub fn with_queue(name: impl Into<String>, queue: MessageQueue, poster: Poster) -> Self {
        Self {
            name: name.into(),
            queue,
            poster,
            pretty: false,
            skip_blank: true,
            listener: None,
            listener_down_reported: false,
        }
    }

    pub fn with_skip_blank(mut self, skip: bool) -> Self {
        self.skip_blank = skip;
        self
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn check_listener(&mut self) {
        let down = self.listener.as_ref().is_some_and(ListenerHandle::is_finished);
        if down && !self.listener_down_reported {
            warn!(source = %self.name, "telemetry listener has stopped; no new samples will arrive");
            self.listener_down_reported = true;
        }
    }
}

#[async_trait]
impl Source for Telemetry {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    /// Returns the number of drained messages, delivered or not.
    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        self.check_listener();

        let drained = self.queue.drain();
        let count = drained.len();
        let Some(latest) = drained.last() else {
            return Ok(0);
        };
        if count > 1 {
            debug!(source = %self.name, skipped = count - 1, "older samples superseded");
        }

        let reading = latest.decode();
        if self.skip_blank && reading.is_blank() {
            debug!(source = %self.name, kind = latest.kind(), "latest sample has no recognizable fields");
            return Ok(count);
        }

        if let Some(ts) = reading.timestamp_utc.as_deref() {
            let fp = fingerprint(BUCKET, &[self.name.as_str(), ts]);
            if seen.is_seen(BUCKET, &fp) {
                debug!(source = %self.name, %ts, "sample already forwarded");
                return Ok(count);
            }
            seen.mark_seen(BUCKET, &fp);
        }

        let mut item = into_item(serde_json::to_value(&reading).context("serializing reading")?);
        item.insert("_transport".to_string(), latest.transport_json());

        let rendered = if self.pretty {
            serde_json::to_string_pretty(&item)
        } else {
            serde_json::to_string(&item)
        };
        debug!(source = %self.name, reading = %rendered.unwrap_or_default(), "decoded sample");

        if self.poster.post_item(item).await {
            info!(source = %self.name, messages = count, "forwarded latest telemetry sample");
        }
        Ok(count)
    }
}

//! Feed sources. Each kind is its own type behind the [`Source`] trait;
//! [`build_source`] maps a configured [`SourceKind`] to a constructor.

pub mod caltrans;
pub mod fetch;
pub mod nws;
pub mod pao;
pub mod pulsepoint;
pub mod telemetry;
pub mod usgs;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::warn;

use crate::config::{SourceConfig, SourceKind};
use crate::context::AppContext;
use crate::dedup::SeenStore;
use crate::notify::{Item, Notifier, NotifierOverride, NotifyPayload};

#[async_trait]
pub trait Source: Send {
    fn name(&self) -> &str;

    /// Seen-store namespace for this source's fingerprints.
    fn bucket(&self) -> &'static str;

    /// Fetch, dedup and forward. Returns how many items were handled.
    async fn poll(&mut self, now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize>;
}

/// Forwards a source's output to the notifier with its override/template.
#[derive(Clone)]
pub struct Poster {
    name: String,
    notifier: Arc<dyn Notifier>,
    over: Option<NotifierOverride>,
    template: Option<String>,
}

impl Poster {
    pub fn new(
        name: impl Into<String>,
        notifier: Arc<dyn Notifier>,
        over: Option<NotifierOverride>,
        template: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            notifier,
            over,
            template,
        }
    }

    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Self {
        Self::new(
            cfg.display_name(),
            ctx.notifier.clone(),
            cfg.notifier.clone(),
            cfg.template.clone(),
        )
    }

    /// Send one item titled with the source name. Send failures are logged,
    /// never returned, so one bad delivery does not abort the poll.
    pub async fn post_item(&self, item: Item) -> bool {
        self.deliver(&self.name, NotifyPayload::single(item)).await
    }

    /// Send a batch titled `"<name>: <count> new"`.
    pub async fn post(&self, payload: NotifyPayload) -> bool {
        let title = format!("{}: {} new", self.name, payload.count);
        self.deliver(&title, payload).await
    }

    async fn deliver(&self, title: &str, payload: NotifyPayload) -> bool {
        let n = payload.count as u64;
        match self
            .notifier
            .send(title, &payload, self.over.as_ref(), self.template.as_deref())
            .await
        {
            Ok(()) => {
                counter!("feed_items_posted_total", "source" => self.name.clone()).increment(n);
                true
            }
            Err(e) => {
                warn!(source = %self.name, error = ?e, "notify failed");
                false
            }
        }
    }
}

/// Mark-and-post helper shared by the feed sources: returns `true` when the
/// fingerprint was new.
pub(crate) async fn forward_if_new(
    seen: &mut SeenStore,
    bucket: &str,
    fp: &str,
    poster: &Poster,
    item: Item,
) -> bool {
    if seen.is_seen(bucket, fp) {
        return false;
    }
    seen.mark_seen(bucket, fp);
    poster.post_item(item).await;
    true
}

fn boxed<S: Source + 'static>(s: S) -> Box<dyn Source> {
    Box::new(s)
}

pub fn build_source(cfg: &SourceConfig, ctx: &AppContext) -> Result<Box<dyn Source>> {
    let built = match cfg.kind {
        SourceKind::Nws => nws::Nws::from_config(cfg, ctx).map(boxed),
        SourceKind::Usgs => usgs::Usgs::from_config(cfg, ctx).map(boxed),
        SourceKind::Caltrans => caltrans::Caltrans::from_config(cfg, ctx).map(boxed),
        SourceKind::Pulsepoint => pulsepoint::PulsePoint::from_config(cfg, ctx).map(boxed),
        SourceKind::Pao => pao::Pao::from_config(cfg, ctx).map(boxed),
        SourceKind::Telemetry => telemetry::Telemetry::from_config(cfg, ctx).map(boxed),
    };
    built.with_context(|| format!("building source {} ({})", cfg.display_name(), cfg.kind))
}

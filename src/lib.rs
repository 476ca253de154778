// src/lib.rs
// Library surface shared by the binaries and integration tests.

pub mod config;
pub mod context;
pub mod dedup;
pub mod metrics;
pub mod notify;
pub mod scheduler;
pub mod sources;
pub mod telemetry;
pub mod util;

pub use crate::context::AppContext;
pub use crate::dedup::{fingerprint, SeenStore};
pub use crate::scheduler::{ScheduledSource, Scheduler};
pub use crate::telemetry::decode::{decode, normalize_fields, CanonicalReading};

use tracing::{info, warn};

use crate::config::Config;
use crate::sources::build_source;

/// Build every enabled source in configuration order. A source that fails
/// to construct is logged and left out; the rest still run.
pub fn load_sources(cfg: &Config, ctx: &AppContext) -> Vec<ScheduledSource> {
    let mut out = Vec::new();
    for s in cfg.enabled_sources() {
        match build_source(s, ctx) {
            Ok(src) => {
                info!(source = %s.display_name(), kind = %s.kind, poll_seconds = s.poll_interval().as_secs(), "loaded source");
                out.push(ScheduledSource::new(src, s.poll_interval()));
            }
            Err(e) => warn!(source = %s.display_name(), error = ?e, "source disabled"),
        }
    }
    out
}

/// Wire config into a ready-to-run scheduler.
pub fn build_scheduler(cfg: &Config, ctx: &AppContext) -> Scheduler {
    let store = SeenStore::open(&cfg.general.seen_store_path, cfg.general.seen_ttl_days);
    let sources = load_sources(cfg, ctx);
    if sources.is_empty() {
        warn!("no enabled sources configured");
    }
    Scheduler::from_general(&cfg.general, sources, store)
}

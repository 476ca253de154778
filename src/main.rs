//! newsfeeds: polls feeds and station telemetry, forwards new items to chat.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use newsfeeds::config::{self, Config};
use newsfeeds::metrics::Metrics;
use newsfeeds::notify::LogNotifier;
use newsfeeds::{build_scheduler, AppContext};

const LOG_FORMAT_ENV: &str = "NEWSFEEDS_LOG_FORMAT";

#[derive(Parser)]
#[command(name = "newsfeeds")]
#[command(about = "Poll alert/news feeds and station telemetry, forward new items", long_about = None)]
struct Cli {
    /// Config file (JSON, or TOML by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single cycle, then exit
    #[arg(long)]
    once: bool,

    /// Log composed messages instead of sending them
    #[arg(long)]
    dry_run: bool,
}

/// `RUST_LOG` wins over the configured level; JSON output on request.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let path = config::resolve_path(cli.config);
    let cfg = Config::load(&path)?;
    init_tracing(&cfg.general.log_level.to_ascii_lowercase());
    info!(config = %path.display(), "configuration loaded");

    let _metrics_task = match cfg.general.metrics_addr.clone() {
        Some(addr) => match Metrics::init() {
            Ok(m) => Some(m.serve(addr)),
            Err(e) => {
                warn!(error = ?e, "metrics disabled");
                None
            }
        },
        None => None,
    };

    let mut ctx = AppContext::from_general(cfg.general.clone()).context("building app context")?;
    if cli.dry_run {
        ctx.notifier = Arc::new(LogNotifier::new(cfg.general.notifier.style));
    }

    let mut scheduler = build_scheduler(&cfg, &ctx);
    if cli.once {
        scheduler.store_mut().purge_old();
        let report = scheduler.run_cycle(Utc::now()).await;
        info!(polled = report.polled.len(), failed = report.failed.len(), items = report.items, "single cycle done");
        return Ok(());
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    let store = scheduler.run_until(shutdown).await;
    info!(entries = store.len(), "stopped");
    Ok(())
}

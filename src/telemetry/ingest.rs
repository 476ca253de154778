//! Embedded HTTP endpoint for stations configured to "push" readings
//! (custom server upload). Every GET/POST is answered `200 OK` whether or not
//! anything was extracted; the fields go onto the telemetry queue.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::decode::{parse_query, unquote_plus, Fields};
use super::{IngestMeta, MessageQueue, RawMessage};

const BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log every request at info level and attach request tracing.
    #[serde(default)]
    pub verbose: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    46000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: false,
        }
    }
}

#[derive(Clone)]
struct IngestState {
    queue: MessageQueue,
    verbose: bool,
}

/// Field extraction: query string, else a trailing `k=v` path segment;
/// form/plain POST bodies are merged over either.
pub fn extract_fields(path_and_query: &str, is_post: bool, content_type: &str, body: &[u8]) -> Fields {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q.split('#').next().unwrap_or("")),
        None => (path_and_query, ""),
    };

    let mut fields = parse_query(query);
    if fields.is_empty() {
        let tail = path.rsplit('/').next().unwrap_or("");
        if tail.contains('=') {
            let candidate = unquote_plus(tail).replace([';', ','], "&");
            fields = parse_query(&candidate);
        }
    }

    if is_post {
        let ctype = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if matches!(
            ctype.as_str(),
            "application/x-www-form-urlencoded" | "text/plain"
        ) {
            fields.extend(parse_query(&String::from_utf8_lossy(body)));
        }
    }
    fields
}

pub fn router(queue: MessageQueue, verbose: bool) -> Router {
    let app = Router::new()
        .fallback(report)
        .with_state(IngestState { queue, verbose });
    if verbose {
        app.layer(TraceLayer::new_for_http())
    } else {
        app
    }
}

async fn report(State(state): State<IngestState>, req: Request) -> (StatusCode, &'static str) {
    let (parts, body) = req.into_parts();
    let is_post = parts.method == Method::POST;
    if !is_post && parts.method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "");
    }

    let body = if is_post {
        axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .unwrap_or_default()
    } else {
        Bytes::new()
    };
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    let fields = extract_fields(&path, is_post, content_type, &body);
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    if state.verbose {
        info!(peer = ?peer, method = %parts.method, %path, fields = fields.len(), "ingest request");
    } else {
        debug!(peer = ?peer, method = %parts.method, fields = fields.len(), "ingest request");
    }

    state.queue.push(RawMessage::Ingest {
        fields,
        meta: IngestMeta {
            peer,
            path,
            method: parts.method.to_string(),
            headers,
            received_at: Utc::now(),
        },
    });
    (StatusCode::OK, "OK")
}

/// Bind and serve until the process exits.
pub async fn serve(cfg: IngestConfig, queue: MessageQueue) -> Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding ingest listener on {addr}"))?;
    info!(%addr, "ingest listening");
    axum::serve(
        listener,
        router(queue, cfg.verbose).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("ingest server")
}

/// Run the accept loop as a background task, independent of the scheduler.
pub fn spawn(cfg: IngestConfig, queue: MessageQueue) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(cfg, queue).await {
            error!(error = ?e, "ingest listener stopped");
        }
    })
}

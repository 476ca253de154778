//! Station telemetry ingestion: listeners push raw messages onto a bounded
//! queue, the telemetry source drains it on each scheduler poll and decodes.

pub mod capture;
pub mod decode;
pub mod ingest;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use capture::{CaptureConfig, CaptureListener, ListenerError};
use ingest::IngestConfig;

pub use decode::{CanonicalReading, Fields};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Where a captured datagram came from and went to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureMeta {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub received_at: DateTime<Utc>,
}

/// Request metadata for an HTTP-ingested sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestMeta {
    pub peer: Option<String>,
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// One unit of listener output, consumed exactly once by a telemetry poll.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    Capture { payload: Vec<u8>, meta: CaptureMeta },
    Ingest { fields: Fields, meta: IngestMeta },
}

impl RawMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RawMessage::Capture { .. } => "capture",
            RawMessage::Ingest { .. } => "ingest",
        }
    }

    /// Decode into a reading; capture payloads go through the byte parser.
    pub fn decode(&self) -> CanonicalReading {
        match self {
            RawMessage::Capture { payload, .. } => decode::decode(payload),
            RawMessage::Ingest { fields, .. } => decode::normalize_fields(fields),
        }
    }

    /// Transport metadata as JSON, for attaching to the forwarded item.
    pub fn transport_json(&self) -> serde_json::Value {
        let v = match self {
            RawMessage::Capture { meta, .. } => serde_json::to_value(meta),
            RawMessage::Ingest { meta, .. } => serde_json::to_value(meta),
        };
        v.unwrap_or(serde_json::Value::Null)
    }
}

/// Listener mode for a telemetry source; only one runs per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    #[default]
    Http,
    Udp,
}

/// Listener settings of one telemetry source.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryParams {
    #[serde(default)]
    pub mode: ListenerMode,
    #[serde(default)]
    pub http: IngestConfig,
    #[serde(default)]
    pub udp: CaptureConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pretty-print readings in the log line emitted per delivery.
    #[serde(default)]
    pub pretty: bool,
    /// Drop samples that decode to nothing instead of forwarding an empty
    /// reading. Turn off to forward every newest sample.
    #[serde(default = "default_skip_blank")]
    pub skip_blank: bool,
}

fn default_skip_blank() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for TelemetryParams {
    fn default() -> Self {
        Self {
            mode: ListenerMode::Http,
            http: IngestConfig::default(),
            udp: CaptureConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pretty: false,
            skip_blank: true,
        }
    }
}

/// Keeps a running listener alive for as long as its source exists.
#[derive(Debug)]
pub enum ListenerHandle {
    Capture(std::thread::JoinHandle<()>),
    Ingest(tokio::task::JoinHandle<()>),
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        match self {
            ListenerHandle::Capture(h) => h.is_finished(),
            ListenerHandle::Ingest(h) => h.is_finished(),
        }
    }
}

/// Start the listener selected by `params.mode`, feeding `queue`.
///
/// The ingest listener is a tokio task, so this must run inside a runtime.
pub fn start_listener(
    params: &TelemetryParams,
    queue: MessageQueue,
) -> Result<ListenerHandle, ListenerError> {
    match params.mode {
        ListenerMode::Http => {
            info!(host = %params.http.host, port = params.http.port, "starting telemetry ingest listener");
            Ok(ListenerHandle::Ingest(ingest::spawn(
                params.http.clone(),
                queue,
            )))
        }
        ListenerMode::Udp => {
            info!(
                iface = params.udp.iface.as_deref().unwrap_or("(auto)"),
                port = params.udp.port,
                "starting telemetry capture listener"
            );
            let listener = CaptureListener::new(
                params.udp.clone(),
                Box::new(move |payload, meta| queue.push(RawMessage::Capture { payload, meta })),
            );
            listener.spawn().map(ListenerHandle::Capture)
        }
    }
}

/// Bounded single-consumer queue shared between one listener and its source.
///
/// When full, the oldest message is discarded to make room, so the
/// scheduler always sees the freshest samples.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    tx: Sender<RawMessage>,
    rx: Receiver<RawMessage>,
    dropped: Arc<AtomicU64>,
}

impl MessageQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking push with drop-oldest on overflow.
    pub fn push(&self, msg: RawMessage) {
        counter!("telemetry_messages_total", "kind" => msg.kind()).increment(1);
        let mut msg = msg;
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        counter!("telemetry_queue_dropped_total").increment(1);
                        if n == 1 || n % 100 == 0 {
                            warn!(dropped = n, "telemetry queue full; dropping oldest");
                        }
                    }
                    msg = back;
                }
                // Both ends live in `self`, so this cannot happen while we exist.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Non-blocking pop; `None` when empty.
    pub fn try_pop(&self) -> Option<RawMessage> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<RawMessage> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(tag: &str) -> RawMessage {
        let mut fields = Fields::new();
        fields.insert("tag".into(), tag.into());
        RawMessage::Ingest {
            fields,
            meta: IngestMeta {
                peer: None,
                path: "/".into(),
                method: "GET".into(),
                headers: BTreeMap::new(),
                received_at: Utc::now(),
            },
        }
    }

    fn tag(m: &RawMessage) -> String {
        match m {
            RawMessage::Ingest { fields, .. } => fields["tag"].clone(),
            RawMessage::Capture { .. } => unreachable!(),
        }
    }

    #[test]
    fn empty_queue_pops_none() {
        let q = MessageQueue::bounded(4);
        assert!(q.try_pop().is_none());
        assert!(q.drain().is_empty());
    }

    #[test]
    fn drain_preserves_order() {
        let q = MessageQueue::bounded(4);
        for t in ["a", "b", "c"] {
            q.push(ingest(t));
        }
        let got: Vec<_> = q.drain().iter().map(tag).collect();
        assert_eq!(got, ["a", "b", "c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = MessageQueue::bounded(2);
        for t in ["a", "b", "c", "d"] {
            q.push(ingest(t));
        }
        assert_eq!(q.dropped(), 2);
        let got: Vec<_> = q.drain().iter().map(tag).collect();
        assert_eq!(got, ["c", "d"]);
    }

    #[test]
    fn params_default_to_http() {
        let p: TelemetryParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.mode, ListenerMode::Http);
        assert_eq!(p.http.port, 46000);
        assert_eq!(p.udp.port, capture::DEFAULT_CAPTURE_PORT);
        assert_eq!(p.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(p.skip_blank);

        let p: TelemetryParams =
            serde_json::from_str(r#"{"mode":"udp","udp":{"port":5000,"iface":"eth0"}}"#).unwrap();
        assert_eq!(p.mode, ListenerMode::Udp);
        assert_eq!(p.udp.port, 5000);
        assert_eq!(p.udp.iface.as_deref(), Some("eth0"));
    }

    #[test]
    fn push_from_other_thread() {
        let q = MessageQueue::bounded(16);
        let producer = q.clone();
        std::thread::spawn(move || {
            for i in 0..10 {
                producer.push(ingest(&i.to_string()));
            }
        })
        .join()
        .unwrap();
        assert_eq!(q.len(), 10);
    }
}

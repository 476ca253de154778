pub mod render;
pub mod webhook;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

pub use render::{compose_text, render_fields, render_template, TOP_FIELDS};
pub use webhook::WebhookNotifier;

/// One forwarded item: a flat-ish JSON object.
pub type Item = Map<String, Value>;

/// Unwrap a JSON object into an [`Item`]; anything else becomes `{"value": v}`.
pub fn into_item(v: Value) -> Item {
    match v {
        Value::Object(m) => m,
        other => {
            let mut m = Item::new();
            m.insert("value".to_string(), other);
            m
        }
    }
}

/// Items handed to a notifier in one send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyPayload {
    pub items: Vec<Item>,
    pub count: usize,
}

impl NotifyPayload {
    pub fn single(item: Item) -> Self {
        Self {
            items: vec![item],
            count: 1,
        }
    }

    pub fn batch(items: Vec<Item>) -> Self {
        let count = items.len();
        Self { items, count }
    }
}

/// Where a send goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// `{"text": ...}` JSON POST to an incoming-webhook URL.
    #[default]
    Webhook,
    /// Write the composed text to the log only.
    Log,
    /// Session-authenticated chat API; not supported here.
    Mattermost,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Markdown,
    /// Bullet list of fields, priority keys first.
    Fields,
}

/// `general.notifier` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierConfig {
    #[serde(rename = "type", default)]
    pub destination: Destination,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub style: Style,
}

/// Per-source replacement of destination type and/or URL.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotifierOverride {
    #[serde(rename = "type", default)]
    pub destination: Option<Destination>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        title: &str,
        payload: &NotifyPayload,
        over: Option<&NotifierOverride>,
        template: Option<&str>,
    ) -> Result<()>;
}

/// Dry-run sink: composes the text and logs it.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    style: Style,
}

impl LogNotifier {
    pub fn new(style: Style) -> Self {
        Self { style }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        title: &str,
        payload: &NotifyPayload,
        _over: Option<&NotifierOverride>,
        template: Option<&str>,
    ) -> Result<()> {
        let text = compose_text(self.style, title, &payload.items, template);
        info!(%title, count = payload.count, "notify: {text}");
        Ok(())
    }
}

/// Build the process-wide notifier from `general.notifier`.
pub fn from_config(cfg: &NotifierConfig, client: reqwest::Client) -> Arc<dyn Notifier> {
    match cfg.destination {
        Destination::Log => Arc::new(LogNotifier::new(cfg.style)),
        _ => Arc::new(WebhookNotifier::new(cfg.clone(), client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_markdown_webhook() {
        let c: NotifierConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c.destination, Destination::Webhook);
        assert_eq!(c.style, Style::Markdown);
        assert!(c.webhook_url.is_empty());
    }

    #[test]
    fn unknown_destination_is_unsupported() {
        let o: NotifierOverride = serde_json::from_str(r#"{"type":"carrier-pigeon"}"#).unwrap();
        assert_eq!(o.destination, Some(Destination::Unsupported));
        let o: NotifierOverride =
            serde_json::from_str(r#"{"type":"mattermost","webhook_url":"http://x"}"#).unwrap();
        assert_eq!(o.destination, Some(Destination::Mattermost));
        assert_eq!(o.webhook_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn batch_counts_items() {
        let p = NotifyPayload::batch(vec![Item::new(), Item::new()]);
        assert_eq!(p.count, 2);
        assert_eq!(NotifyPayload::single(Item::new()).count, 1);
    }
}

use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{compose_text, Destination, Notifier, NotifierConfig, NotifierOverride, NotifyPayload};

/// Delay before each attempt; the first attempt goes out immediately.
pub const POST_BACKOFF: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_millis(1000),
    Duration::from_millis(2500),
];

#[derive(Clone)]
pub struct WebhookNotifier {
    cfg: NotifierConfig,
    client: Client,
    timeout: Duration,
    backoff: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(cfg: NotifierConfig, client: Client) -> Self {
        Self {
            cfg,
            client,
            timeout: Duration::from_secs(30),
            backoff: POST_BACKOFF.to_vec(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post_text(&self, url: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({ "text": text });
        let mut last_err = None;
        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            let res = self
                .client
                .post(url)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .and_then(|rsp| rsp.error_for_status());
            match res {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(attempt = attempt + 1, error = %e, "webhook post failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(anyhow!("POST failed: {url} :: {e}")),
            None => Err(anyhow!("POST failed: {url} :: no attempts configured")),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        title: &str,
        payload: &NotifyPayload,
        over: Option<&NotifierOverride>,
        template: Option<&str>,
    ) -> Result<()> {
        let destination = over
            .and_then(|o| o.destination)
            .unwrap_or(self.cfg.destination);
        let text = || compose_text(self.cfg.style, title, &payload.items, template);

        match destination {
            Destination::Webhook => {
                let url = over
                    .and_then(|o| o.webhook_url.as_deref())
                    .filter(|u| !u.is_empty())
                    .unwrap_or(&self.cfg.webhook_url);
                if url.is_empty() {
                    debug!(%title, "no webhook_url configured; skipping send");
                    return Ok(());
                }
                self.post_text(url, &text()).await
            }
            Destination::Log => {
                info!(%title, count = payload.count, "notify: {}", text());
                Ok(())
            }
            Destination::Mattermost | Destination::Unsupported => {
                warn!(%title, ?destination, "unsupported notifier destination; skipping send");
                Ok(())
            }
        }
    }
}

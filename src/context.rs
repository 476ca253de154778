use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::GeneralConfig;
use crate::notify::{self, Notifier};

/// Process-wide collaborators, built once at startup and handed to every
/// source.
#[derive(Clone)]
pub struct AppContext {
    pub general: GeneralConfig,
    pub notifier: Arc<dyn Notifier>,
    pub http: reqwest::Client,
}

impl AppContext {
    pub fn new(general: GeneralConfig, notifier: Arc<dyn Notifier>, http: reqwest::Client) -> Self {
        Self {
            general,
            notifier,
            http,
        }
    }

    /// HTTP client with the configured User-Agent, notifier per `general.notifier`.
    pub fn from_general(general: GeneralConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(general.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        let notifier = notify::from_config(&general.notifier, http.clone());
        Ok(Self::new(general, notifier, http))
    }
}

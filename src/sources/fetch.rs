use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::{Client, Response};
use tracing::debug;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const FETCH_BACKOFF: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// GET with retry: up to three attempts, non-2xx counts as a failure.
pub async fn get_with_retry(
    client: &Client,
    url: &str,
    headers: &[(&str, &str)],
    query: &[(&str, String)],
) -> Result<Response> {
    get_with_backoff(client, url, headers, query, &FETCH_BACKOFF).await
}

pub async fn get_with_backoff(
    client: &Client,
    url: &str,
    headers: &[(&str, &str)],
    query: &[(&str, String)],
    backoff: &[Duration],
) -> Result<Response> {
    let mut last_err = None;
    for (attempt, delay) in backoff.iter().enumerate() {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        let mut req = client.get(url).timeout(FETCH_TIMEOUT);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        match req.send().await.and_then(|r| r.error_for_status()) {
            Ok(rsp) => return Ok(rsp),
            Err(e) => {
                debug!(%url, attempt = attempt + 1, error = %e, "GET failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => anyhow!("GET failed: {url} :: {e}"),
        None => anyhow!("GET failed: {url} :: no attempts configured"),
    })
}

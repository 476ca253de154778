//! Palo Alto Online news page: story links whose anchor wraps a headline.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{fetch::get_with_retry, forward_if_new, Poster, Source};
use crate::config::SourceConfig;
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::into_item;

pub const BUCKET: &str = "pao";

#[derive(Debug, Clone, Deserialize)]
pub struct PaoParams {
    #[serde(default = "default_news_url")]
    pub news_url: String,
    /// Most new stories forwarded per poll.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_news_url() -> String {
    "https://www.paloaltoonline.com/news/".to_string()
}

fn default_max_items() -> usize {
    15
}

pub struct Pao {
    name: String,
    params: PaoParams,
    http: Client,
    poster: Poster,
}

impl Pao {
    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Result<Self> {
        Ok(Self {
            name: cfg.display_name(),
            params: cfg.params_as()?,
            http: ctx.http.clone(),
            poster: Poster::from_config(cfg, ctx),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub title: String,
    pub link: String,
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow!("bad selector {s:?}: {e}"))
}

/// Site root used for relative links: everything before `/news`.
fn origin_of(page_url: &str) -> &str {
    page_url
        .split("/news")
        .next()
        .unwrap_or(page_url)
        .trim_end_matches('/')
}

/// Anchors with an `href` and an `h2`/`h3` inside, in page order. Relative
/// links are joined to the site origin; other schemes are skipped.
pub fn stories(html: &str, page_url: &str) -> Result<Vec<Story>> {
    let anchors = selector("a[href]")?;
    let headings = selector("h2, h3")?;
    let origin = origin_of(page_url);
    let doc = Html::parse_document(html);

    let mut out = Vec::new();
    for a in doc.select(&anchors) {
        let Some(h) = a.select(&headings).next() else {
            continue;
        };
        let title: String = h.text().map(str::trim).collect();
        let href = a.value().attr("href").unwrap_or_default();
        if title.is_empty() || href.is_empty() {
            continue;
        }
        let link = if href.starts_with('/') {
            format!("{origin}{href}")
        } else if href.starts_with("http") {
            href.to_string()
        } else {
            continue;
        };
        out.push(Story { title, link });
    }
    Ok(out)
}

#[async_trait]
impl Source for Pao {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        let body = get_with_retry(&self.http, &self.params.news_url, &[("Accept", "text/html")], &[])
            .await?
            .text()
            .await
            .context("reading news page")?;
        // parsed document is not Send; keep it out of the await points below
        let found = stories(&body, &self.params.news_url)?;

        let mut new_count = 0;
        for story in found {
            if new_count >= self.params.max_items {
                break;
            }
            let fp = fingerprint(BUCKET, &[story.title.as_str(), story.link.as_str()]);
            let item = json!({ "title": story.title, "link": story.link });
            if forward_if_new(seen, BUCKET, &fp, &self.poster, into_item(item)).await {
                new_count += 1;
            }
        }
        if new_count > 0 {
            info!(source = %self.name, new_count, "new local stories");
        } else {
            debug!(source = %self.name, "no new local stories");
        }
        Ok(new_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
      <nav><a href="/about">About us</a></nav>
      <div class="story"><a href="/news/2024/05/01/council-vote"><h3>  Council approves budget </h3></a></div>
      <a href="https://elsewhere.example/x"><h2>Wire story</h2></a>
      <a href="mailto:tips@example.org"><h2>Send a tip</h2></a>
      <a href="/news/empty"><h2>   </h2></a>
    </body></html>"#;

    #[test]
    fn headline_anchors_become_stories() {
        let got = stories(PAGE, "https://www.paloaltoonline.com/news/").unwrap();
        assert_eq!(
            got,
            vec![
                Story {
                    title: "Council approves budget".into(),
                    link: "https://www.paloaltoonline.com/news/2024/05/01/council-vote".into(),
                },
                Story {
                    title: "Wire story".into(),
                    link: "https://elsewhere.example/x".into(),
                },
            ]
        );
    }

    #[test]
    fn origin_drops_news_path() {
        assert_eq!(origin_of("https://www.paloaltoonline.com/news/"), "https://www.paloaltoonline.com");
        assert_eq!(origin_of("http://127.0.0.1:8080/"), "http://127.0.0.1:8080");
    }
}

//! Polymarket CLOB event source.
//!
//! Candidate listing comes from the paged `sampling-markets` endpoint; the
//! per-event refresh loop re-fetches `markets/{condition_id}`. Binary market
//! outcomes arrive as two tokens with winner flags once resolved.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::models::{EventStatus, Resolution};
use crate::providers::{convert_status, CandidatePage, EventSource, SourceEvent};

const PROVIDER_NAME: &str = "polymarket";

/// CLOB cursor sentinel for "no further pages".
const END_CURSOR: &str = "LTE=";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct PolymarketSource {
    client: Client,
    base_url: String,
}

impl PolymarketSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("SettleBot/1.0 (Event Reconciliation)")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Execute request with exponential backoff retry
    async fn execute_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self.client.get(url).query(query);

            match timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!("Rate limited on attempt {}, backing off", attempt + 1);
                        sleep(Duration::from_millis(backoff * 10)).await;
                    } else if status.is_server_error() {
                        warn!(
                            "Server error {} on attempt {}, backing off {}ms",
                            status,
                            attempt + 1,
                            backoff
                        );
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        bail!("API error {}: {}", status, text);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Request failed (attempt {}): {}", attempt + 1, e);
                }
                Err(_) => {
                    warn!("Request timeout (attempt {})", attempt + 1);
                }
            }

            if attempt < MAX_RETRIES - 1 {
                debug!("Retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("Max retries exceeded for {}", url)
    }
}

#[async_trait]
impl EventSource for PolymarketSource {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn list_candidates(
        &self,
        min_start: Option<i64>,
        cursor: Option<&str>,
    ) -> Result<CandidatePage> {
        let url = format!("{}/sampling-markets", self.base_url);
        let mut query = Vec::new();
        if let Some(c) = cursor {
            query.push(("next_cursor", c.to_string()));
        }

        let response = self.execute_with_retry(&url, &query).await?;
        let page: SamplingMarketsPage = response
            .json()
            .await
            .context("Failed to parse sampling-markets response")?;

        let mut events = Vec::new();
        for market in page.data {
            if market.condition_id.is_empty() {
                warn!(
                    slug = market.market_slug.as_deref().unwrap_or(""),
                    "market does not have a condition id, skip"
                );
                continue;
            }
            let Some(event) = market.to_source_event() else {
                continue;
            };
            let Some(starts_at) = event.starts_at else {
                debug!(id = %event.id, "market has no start time, skipping");
                continue;
            };
            if let Some(min_start) = min_start {
                if starts_at.timestamp() <= min_start {
                    continue;
                }
            }
            if event.answer.is_some() {
                debug!(id = %event.id, "market already resolved in listing, skipping");
                continue;
            }
            events.push(event);
        }

        let next_cursor = match page.next_cursor {
            Some(c) if !c.is_empty() && c != END_CURSOR => Some(c),
            _ => None,
        };

        debug!(
            candidates = events.len(),
            has_more = next_cursor.is_some(),
            "fetched sampling-markets page"
        );

        Ok(CandidatePage { events, next_cursor })
    }

    async fn fetch_event(&self, event_id: &str) -> Result<Option<SourceEvent>> {
        let url = format!("{}/markets/{}", self.base_url, event_id);
        let response = self.execute_with_retry(&url, &[]).await?;

        let market: ClobMarket = response
            .json()
            .await
            .context("Failed to parse market response")?;

        if market.condition_id.is_empty() {
            warn!(event_id, "could not fetch event by id");
            return Ok(None);
        }
        Ok(market.to_source_event())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SamplingMarketsPage {
    #[serde(default)]
    data: Vec<ClobMarket>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClobMarket {
    #[serde(default)]
    condition_id: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    market_slug: Option<String>,
    /// Present on some lifecycle endpoints; the closed flag is the fallback.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    game_start_time: Option<String>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default)]
    tokens: Vec<ClobToken>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClobToken {
    #[serde(default)]
    token_id: String,
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    winner: Option<bool>,
}

impl ClobMarket {
    fn to_source_event(&self) -> Option<SourceEvent> {
        if self.condition_id.is_empty() {
            return None;
        }

        let description = self
            .question
            .clone()
            .or_else(|| self.market_slug.clone())
            .unwrap_or_default();

        let status = match self.status.as_deref() {
            Some(s) if !s.is_empty() => convert_status(s),
            _ => match self.closed {
                Some(true) => EventStatus::Settled,
                Some(false) => EventStatus::Pending,
                None => EventStatus::Unknown,
            },
        };

        let metadata = json!({
            "market_slug": self.market_slug,
            "active": self.active,
            "outcomes": self.tokens.iter().map(|t| t.outcome.clone()).collect::<Vec<_>>(),
            "token_ids": self.tokens.iter().map(|t| t.token_id.clone()).collect::<Vec<_>>(),
        });

        Some(SourceEvent {
            id: self.condition_id.clone(),
            description,
            status,
            starts_at: parse_timestamp(self.game_start_time.as_deref()),
            resolve_date: parse_timestamp(self.end_date_iso.as_deref()),
            answer: self.winner_resolution(),
            metadata,
        })
    }

    /// First token winning means the market resolved Yes, second token No.
    /// Neither flagged yet: no answer.
    fn winner_resolution(&self) -> Option<Resolution> {
        if self.tokens.first()?.winner == Some(true) {
            return Some(Resolution::Yes);
        }
        if self.tokens.get(1)?.winner == Some(true) {
            return Some(Resolution::No);
        }
        None
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            debug!(raw, error = %e, "unparseable upstream timestamp");
            None
        }
    }
}

//! Market event sources.
//!
//! The registry and reconciliation loop depend only on the `EventSource`
//! capability, never on a concrete provider. A source must be able to list
//! candidate events in pages and re-fetch a single event by id; everything
//! else about its API is its own concern.

pub mod polymarket;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{EventDraft, EventStatus, Resolution};

pub use polymarket::PolymarketSource;

/// One upstream event record, already mapped onto core vocabulary.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub id: String,
    pub description: String,
    pub status: EventStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub resolve_date: Option<DateTime<Utc>>,
    pub answer: Option<Resolution>,
    pub metadata: serde_json::Value,
}

impl SourceEvent {
    pub fn into_draft(self) -> EventDraft {
        EventDraft {
            id: self.id,
            description: self.description,
            starts_at: self.starts_at,
            status: self.status,
            resolve_date: self.resolve_date,
            answer: self.answer,
            metadata: self.metadata,
        }
    }
}

/// One page of candidates plus the cursor to carry into the next call.
/// `next_cursor == None` means the listing is exhausted.
#[derive(Debug, Clone, Default)]
pub struct CandidatePage {
    pub events: Vec<SourceEvent>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Stable provider namespace for event keys.
    fn name(&self) -> &str;

    /// Lists candidate events not yet started as of `min_start`, one page at
    /// a time. Pass back the returned cursor to advance.
    async fn list_candidates(
        &self,
        min_start: Option<i64>,
        cursor: Option<&str>,
    ) -> Result<CandidatePage>;

    /// Re-fetches a single event by id. `Ok(None)` when the upstream has no
    /// such event (or returned an unusable record).
    async fn fetch_event(&self, event_id: &str) -> Result<Option<SourceEvent>>;
}

/// Maps the small upstream status vocabulary onto event lifecycle states.
/// Unrecognized strings map to `Pending`, the conservative choice: a pending
/// event keeps getting refreshed until the upstream makes sense.
pub fn convert_status(upstream: &str) -> EventStatus {
    match upstream {
        "Created" => EventStatus::Pending,
        "Resolved" => EventStatus::Settled,
        "Canceled" => EventStatus::Discarded,
        "Paused" => EventStatus::Pending,
        _ => EventStatus::Pending,
    }
}

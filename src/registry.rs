//! Event registry: the process-wide map of known market events.
//!
//! One logical owner for all event lifecycle state. Reconciliation writes
//! into it, the settlement coordinator listens to it via the change hook.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{event_key, Event, EventDraft, EventKey, EventStatus, Resolution};

pub type ChangeHook = Box<dyn Fn(Event) + Send + Sync>;

/// Serializable view of the full registry, for checkpointing.
pub type RegistrySnapshot = HashMap<EventKey, Event>;

#[derive(Default)]
pub struct EventRegistry {
    events: RwLock<HashMap<EventKey, Event>>,
    hook: RwLock<Option<ChangeHook>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or updates an event. Returns true only when this was a fresh
    /// insert. A polling pass can call this for every candidate without
    /// tracking which ones it has already seen.
    pub fn register(&self, provider_name: &str, draft: EventDraft) -> bool {
        let key = event_key(provider_name, &draft.id);
        {
            let mut events = self.events.write();
            if !events.contains_key(&key) {
                let (status, answer) = normalize(draft.status, draft.answer);
                let event = Event {
                    provider_name: provider_name.to_string(),
                    id: draft.id,
                    description: draft.description,
                    starts_at: draft.starts_at,
                    resolve_date: draft.resolve_date,
                    answer,
                    status,
                    last_updated_at: Utc::now(),
                    metadata: draft.metadata,
                };
                debug!(key = %key, status = event.status.as_str(), "registered event");
                events.insert(key, event);
                return true;
            }
        }
        self.update(provider_name, draft);
        false
    }

    /// Overwrites the mutable fields of an existing event and fires the
    /// change hook with the new snapshot. Fails (false) when the event is
    /// unknown or already terminal.
    pub fn update(&self, provider_name: &str, draft: EventDraft) -> bool {
        let key = event_key(provider_name, &draft.id);
        let snapshot = {
            let mut events = self.events.write();
            let Some(existing) = events.get_mut(&key) else {
                warn!(key = %key, "no event found in registry, update dropped");
                return false;
            };
            if existing.status.is_terminal() {
                debug!(
                    key = %key,
                    status = existing.status.as_str(),
                    "update against terminal event ignored"
                );
                return false;
            }

            let (status, answer) = normalize(draft.status, draft.answer);
            existing.description = draft.description;
            existing.starts_at = draft.starts_at;
            existing.resolve_date = draft.resolve_date;
            existing.answer = answer;
            existing.status = status;
            existing.metadata = draft.metadata;
            existing.last_updated_at = Utc::now();
            existing.clone()
        };

        // Hook runs on the caller's task, outside the map lock. At most once
        // per update; whatever the hook does with the snapshot is its business.
        if let Some(hook) = self.hook.read().as_ref() {
            hook(snapshot);
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<Event> {
        self.events.read().get(key).cloned()
    }

    /// Installs the process-wide change hook, replacing any previous one.
    pub fn on_change<F>(&self, hook: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Box::new(hook));
    }

    /// Events still awaiting resolution, cloned out for the refresh loop.
    pub fn pending_events(&self) -> Vec<Event> {
        self.events
            .read()
            .values()
            .filter(|e| e.status == EventStatus::Pending)
            .cloned()
            .collect()
    }

    /// Removes an event outright. Used after settlement scoring has consumed
    /// it; there is no other structural removal path.
    pub fn evict(&self, key: &str) -> bool {
        self.events.write().remove(key).is_some()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.events.read().clone()
    }

    /// Replaces the whole map, e.g. when restoring a checkpoint at startup.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        *self.events.write() = snapshot;
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

/// Repairs drafts so `answer` is present exactly when settled. A settled
/// draft with no reported outcome keeps the settled status but records an
/// unknown resolution, which scoring treats as a data inconsistency.
fn normalize(
    status: EventStatus,
    answer: Option<Resolution>,
) -> (EventStatus, Option<Resolution>) {
    match status {
        EventStatus::Settled => (status, Some(answer.unwrap_or(Resolution::Unknown))),
        _ => (status, None),
    }
}

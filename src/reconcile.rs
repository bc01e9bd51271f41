//! Reconciliation between the upstream event source and the registry.
//!
//! Two long-lived tasks per source: a bulk poll that walks the paged
//! candidate listing and upserts everything it sees, and a refresh loop that
//! re-fetches each still-pending event by id. A failed round is abandoned
//! and retried on the next cycle; a failure on one event never aborts the
//! rest of the pass.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::providers::EventSource;
use crate::registry::EventRegistry;

/// Pages walked per bulk poll before the round is cut short.
const MAX_PAGES_PER_POLL: u32 = 20;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub pages: u32,
    pub seen: usize,
    pub fresh: usize,
}

pub struct ReconciliationLoop {
    source: Arc<dyn EventSource>,
    registry: Arc<EventRegistry>,
    settings: ReconcileSettings,
}

impl ReconciliationLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: Arc<EventRegistry>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            registry,
            settings,
        }
    }

    /// Walks the candidate listing once, carrying the pagination cursor, and
    /// upserts every candidate into the registry.
    pub async fn poll_once(&self) -> Result<PollStats> {
        let min_start = Utc::now().timestamp();
        let mut stats = PollStats::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .source
                .list_candidates(Some(min_start), cursor.as_deref())
                .await?;

            stats.pages += 1;
            for event in page.events {
                stats.seen += 1;
                if self.registry.register(self.source.name(), event.into_draft()) {
                    stats.fresh += 1;
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            if stats.pages >= MAX_PAGES_PER_POLL {
                warn!(
                    pages = stats.pages,
                    "bulk poll page cap reached, remainder deferred to next cycle"
                );
                break;
            }
        }

        Ok(stats)
    }

    /// Re-fetches every event of this source still pending in the registry
    /// and applies the fresh status/answer. Per-event failures are skipped.
    pub async fn refresh_pending_once(&self) -> usize {
        let pending: Vec<_> = self
            .registry
            .pending_events()
            .into_iter()
            .filter(|e| e.provider_name == self.source.name())
            .collect();
        debug!(pending = pending.len(), source = self.source.name(), "refreshing events");

        let mut updated = 0;
        for event in pending {
            match self.source.fetch_event(&event.id).await {
                Ok(Some(fresh)) => {
                    if self.registry.update(self.source.name(), fresh.into_draft()) {
                        updated += 1;
                    }
                }
                Ok(None) => {
                    warn!(id = %event.id, "pending event missing upstream, skip");
                }
                Err(e) => {
                    warn!(id = %event.id, "refresh failed: {e:#}, skip");
                }
            }
        }
        updated
    }

    /// Bulk poll on a fixed cadence until shutdown flips.
    pub async fn run_bulk_poll(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(stats) => info!(
                            source = self.source.name(),
                            pages = stats.pages,
                            seen = stats.seen,
                            fresh = stats.fresh,
                            "bulk poll complete"
                        ),
                        Err(e) => warn!(
                            source = self.source.name(),
                            "bulk poll failed: {e:#}, retrying next cycle"
                        ),
                    }
                }
                _ = shutdown.changed() => {
                    info!(source = self.source.name(), "bulk poll loop stopping");
                    break;
                }
            }
        }
    }

    /// Pending-event refresh on its own cadence until shutdown flips.
    pub async fn run_pending_refresh(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let updated = self.refresh_pending_once().await;
                    if updated > 0 {
                        info!(source = self.source.name(), updated, "refresh pass applied updates");
                    }
                }
                _ = shutdown.changed() => {
                    info!(source = self.source.name(), "refresh loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, Resolution};
    use crate::providers::{CandidatePage, SourceEvent};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn source_event(id: &str, status: EventStatus, answer: Option<Resolution>) -> SourceEvent {
        SourceEvent {
            id: id.to_string(),
            description: format!("event {}", id),
            status,
            starts_at: None,
            resolve_date: None,
            answer,
            metadata: serde_json::Value::Null,
        }
    }

    /// Scripted source: a fixed sequence of pages plus a by-id map.
    struct MockSource {
        pages: Vec<CandidatePage>,
        singles: Mutex<HashMap<String, Option<SourceEvent>>>,
        fail_single_ids: Vec<String>,
    }

    #[async_trait]
    impl EventSource for MockSource {
        fn name(&self) -> &str {
            "mock"
        }

        async fn list_candidates(
            &self,
            _min_start: Option<i64>,
            cursor: Option<&str>,
        ) -> Result<CandidatePage> {
            let index = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            self.pages
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("no such page"))
        }

        async fn fetch_event(&self, event_id: &str) -> Result<Option<SourceEvent>> {
            if self.fail_single_ids.iter().any(|id| id == event_id) {
                return Err(anyhow!("upstream 500"));
            }
            Ok(self
                .singles
                .lock()
                .get(event_id)
                .cloned()
                .unwrap_or(None))
        }
    }

    #[tokio::test]
    async fn bulk_poll_walks_pages_and_registers() {
        let pages = vec![
            CandidatePage {
                events: vec![
                    source_event("a", EventStatus::Pending, None),
                    source_event("b", EventStatus::Pending, None),
                ],
                next_cursor: Some("1".to_string()),
            },
            CandidatePage {
                events: vec![source_event("c", EventStatus::Pending, None)],
                next_cursor: None,
            },
        ];
        let source = Arc::new(MockSource {
            pages,
            singles: Mutex::new(HashMap::new()),
            fail_single_ids: vec![],
        });
        let registry = Arc::new(EventRegistry::new());
        let reconcile =
            ReconciliationLoop::new(source, registry.clone(), ReconcileSettings::default());

        let stats = reconcile.poll_once().await.unwrap();
        assert_eq!(stats, PollStats { pages: 2, seen: 3, fresh: 3 });
        assert_eq!(registry.len(), 3);

        // Second poll re-registers the same events: seen but nothing fresh.
        let stats = reconcile.poll_once().await.unwrap();
        assert_eq!(stats.fresh, 0);
        assert_eq!(stats.seen, 3);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn refresh_applies_updates_and_isolates_failures() {
        let source = Arc::new(MockSource {
            pages: vec![CandidatePage {
                events: vec![
                    source_event("a", EventStatus::Pending, None),
                    source_event("b", EventStatus::Pending, None),
                    source_event("c", EventStatus::Pending, None),
                ],
                next_cursor: None,
            }],
            singles: Mutex::new(HashMap::from([
                (
                    "a".to_string(),
                    Some(source_event("a", EventStatus::Settled, Some(Resolution::Yes))),
                ),
                ("c".to_string(), None),
            ])),
            fail_single_ids: vec!["b".to_string()],
        });
        let registry = Arc::new(EventRegistry::new());
        let reconcile =
            ReconciliationLoop::new(source, registry.clone(), ReconcileSettings::default());
        reconcile.poll_once().await.unwrap();

        // "b" errors and "c" vanished upstream, but "a" still settles.
        let updated = reconcile.refresh_pending_once().await;
        assert_eq!(updated, 1);
        let a = registry.get("mock-a").unwrap();
        assert_eq!(a.status, EventStatus::Settled);
        assert_eq!(a.answer, Some(Resolution::Yes));
        assert_eq!(registry.get("mock-b").unwrap().status, EventStatus::Pending);

        // Settled events drop out of the refresh set.
        let pending: Vec<_> = registry.pending_events();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let source = Arc::new(MockSource {
            pages: vec![CandidatePage::default()],
            singles: Mutex::new(HashMap::new()),
            fail_single_ids: vec![],
        });
        let registry = Arc::new(EventRegistry::new());
        let reconcile = Arc::new(ReconciliationLoop::new(
            source,
            registry,
            ReconcileSettings {
                poll_interval: Duration::from_secs(3600),
                refresh_interval: Duration::from_secs(3600),
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = {
            let reconcile = reconcile.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { reconcile.run_bulk_poll(shutdown).await })
        };
        let refresher = {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { reconcile.run_pending_refresh(shutdown).await })
        };

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .expect("poll loop did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), refresher)
            .await
            .expect("refresh loop did not stop")
            .unwrap();
    }
}

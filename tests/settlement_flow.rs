//! End-to-end settlement flow against a scripted event source.
//!
//! Covers the full path: bulk poll registers a pending market, participants
//! submit revised forecasts over time, the refresh loop settles the market,
//! and the coordinator turns accepted answers into rewards, including a
//! participant whose last-moment revision is too fresh to count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use settlebot_backend::commitment::CommitmentStore;
use settlebot_backend::ledger::SubmissionLedger;
use settlebot_backend::models::{AbsentPolicy, EventStatus, Resolution};
use settlebot_backend::providers::{CandidatePage, EventSource, SourceEvent};
use settlebot_backend::reconcile::{ReconcileSettings, ReconciliationLoop};
use settlebot_backend::registry::EventRegistry;
use settlebot_backend::scoring::QuadraticScorer;
use settlebot_backend::settlement::{SettlementCoordinator, SettlementReport};

const MARKET_ID: &str = "0xmarket";
const CUTOFF_SECS: i64 = 10;

/// Upstream with one market whose resolution state can be flipped mid-test.
struct ScriptedSource {
    resolved: Mutex<Option<Resolution>>,
}

impl ScriptedSource {
    fn market(&self) -> SourceEvent {
        let resolved = *self.resolved.lock();
        SourceEvent {
            id: MARKET_ID.to_string(),
            description: "Will the incumbent win?".to_string(),
            status: if resolved.is_some() {
                EventStatus::Settled
            } else {
                EventStatus::Pending
            },
            starts_at: Some(Utc::now() + chrono::Duration::hours(1)),
            resolve_date: None,
            answer: resolved,
            metadata: serde_json::json!({"slug": "will-the-incumbent-win"}),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_candidates(
        &self,
        _min_start: Option<i64>,
        _cursor: Option<&str>,
    ) -> Result<CandidatePage> {
        // Listing only ever carries unresolved candidates, like a live feed.
        let events = if self.resolved.lock().is_none() {
            vec![self.market()]
        } else {
            vec![]
        };
        Ok(CandidatePage {
            events,
            next_cursor: None,
        })
    }

    async fn fetch_event(&self, event_id: &str) -> Result<Option<SourceEvent>> {
        if event_id == MARKET_ID {
            Ok(Some(self.market()))
        } else {
            Ok(None)
        }
    }
}

#[tokio::test]
async fn full_settlement_round() {
    let source = Arc::new(ScriptedSource {
        resolved: Mutex::new(None),
    });
    let registry = Arc::new(EventRegistry::new());
    let ledger = Arc::new(SubmissionLedger::new(CUTOFF_SECS));
    let reconcile = ReconciliationLoop::new(
        source.clone(),
        registry.clone(),
        ReconcileSettings::default(),
    );

    // Bulk poll discovers the market as pending.
    let stats = reconcile.poll_once().await.unwrap();
    assert_eq!(stats.fresh, 1);
    let key = format!("scripted-{}", MARKET_ID);
    assert_eq!(registry.get(&key).unwrap().status, EventStatus::Pending);

    // Three participants answered well in advance; participant 3 also tries
    // to snipe a sure-thing revision moments before settlement, and
    // participant 4 only ever snipes.
    let now = Utc::now().timestamp();
    ledger.insert(1, &key, now - 100, 0.2);
    ledger.insert(2, &key, now - 100, 0.5);
    ledger.insert(3, &key, now - 100, 0.9);
    ledger.insert(3, &key, now - 1, 1.0);
    ledger.insert(4, &key, now - 1, 1.0);

    // Settlement listens before the refresh loop can observe resolution.
    let events_rx = SettlementCoordinator::subscribe(&registry);
    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<SettlementReport>();
    let coordinator = Arc::new(
        SettlementCoordinator::new(
            registry.clone(),
            ledger.clone(),
            Arc::new(CommitmentStore::new(2)),
            Box::new(QuadraticScorer {
                absent: AbsentPolicy::Zero,
            }),
            vec![1, 2, 3, 4],
            report_tx,
        )
        .with_rng_seed(5),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settler = tokio::spawn(async move { coordinator.run(events_rx, shutdown_rx).await });

    // Upstream resolves Yes; the per-event refresh pass picks it up.
    *source.resolved.lock() = Some(Resolution::Yes);
    let updated = reconcile.refresh_pending_once().await;
    assert_eq!(updated, 1);

    let report = tokio::time::timeout(Duration::from_secs(5), report_rx.recv())
        .await
        .expect("settlement never reported")
        .expect("report channel closed");

    assert_eq!(report.event_key, key);
    assert_eq!(report.ground_truth, Resolution::Yes);
    assert_eq!(report.rewards.len(), 4);
    assert!((report.rewards[&1] - 0.04).abs() < 1e-12);
    assert!((report.rewards[&2] - 0.25).abs() < 1e-12);
    // The aged 0.9 counts; the last-moment 1.0 does not.
    assert!((report.rewards[&3] - 0.81).abs() < 1e-12);
    // Nothing but a fresh snipe on record: treated as absent.
    assert_eq!(report.rewards[&4], 0.0);

    // The round consumed everything for this market.
    assert!(registry.get(&key).is_none());
    assert!(ledger.is_empty());

    // A later poll re-lists nothing (resolved markets leave the feed), and a
    // re-settlement of the same key can't resurrect old history.
    let stats = reconcile.poll_once().await.unwrap();
    assert_eq!(stats.seen, 0);

    shutdown_tx.send(true).unwrap();
    settler.await.unwrap();
}

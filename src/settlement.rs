//! Settlement: turning a settled event plus the submission ledger into a
//! reward vector.
//!
//! The coordinator listens to registry changes through the change hook. The
//! hook body only forwards the snapshot into a channel, so a slow settlement
//! pass never stalls reconciliation; the actual scoring happens on the
//! coordinator's own task.

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::commitment::CommitmentStore;
use crate::ledger::SubmissionLedger;
use crate::models::{Event, EventStatus, ParticipantId, Resolution};
use crate::registry::EventRegistry;
use crate::scoring::{GroundTruth, RmseScorer, ScoringRule, SubmittedAnswer};

/// Per-event settlement output, consumed by whatever payout mechanism sits
/// outside this core.
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub event_key: String,
    pub provider_name: String,
    pub event_id: String,
    pub ground_truth: Resolution,
    pub rewards: HashMap<ParticipantId, f64>,
    pub settled_at: chrono::DateTime<Utc>,
}

pub struct SettlementCoordinator {
    registry: Arc<EventRegistry>,
    ledger: Arc<SubmissionLedger>,
    commitments: Arc<CommitmentStore>,
    scorer: Box<dyn ScoringRule>,
    vector_scorer: RmseScorer,
    /// Participants scored on every event, whether or not they submitted.
    roster: Vec<ParticipantId>,
    rng: Mutex<StdRng>,
    report_tx: mpsc::UnboundedSender<SettlementReport>,
}

impl SettlementCoordinator {
    pub fn new(
        registry: Arc<EventRegistry>,
        ledger: Arc<SubmissionLedger>,
        commitments: Arc<CommitmentStore>,
        scorer: Box<dyn ScoringRule>,
        roster: Vec<ParticipantId>,
        report_tx: mpsc::UnboundedSender<SettlementReport>,
    ) -> Self {
        Self {
            registry,
            ledger,
            commitments,
            scorer,
            vector_scorer: RmseScorer::default(),
            roster,
            rng: Mutex::new(StdRng::from_entropy()),
            report_tx,
        }
    }

    /// Deterministic absent-floor draws, for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Installs the registry hook and returns the channel the hook feeds.
    /// The hook only enqueues; call `run` with the receiver to process.
    pub fn subscribe(registry: &EventRegistry) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.on_change(move |event| {
            let _ = tx.send(event);
        });
        rx
    }

    /// Consumes event snapshots until the channel closes or shutdown flips.
    pub async fn run(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = events_rx.recv() => {
                    let Some(event) = maybe else { break };
                    self.handle_event(event);
                }
                _ = shutdown.changed() => {
                    info!("settlement coordinator stopping");
                    break;
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        match event.status {
            EventStatus::Settled => {
                if let Some(report) = self.settle_event(&event) {
                    info!(
                        event_key = %report.event_key,
                        participants = report.rewards.len(),
                        ground_truth = ?report.ground_truth,
                        "event settled"
                    );
                    let _ = self.report_tx.send(report);
                }
            }
            EventStatus::Discarded => {
                // Nothing to score, ever. Drop the history and the entry.
                let key = event.key();
                self.ledger.drop_event(&key);
                self.registry.evict(&key);
            }
            _ => {}
        }
    }

    /// Scores one settled event: reads every participant's final answer as
    /// of now (destructively), applies the scoring rule, evicts the event.
    ///
    /// Calling this for a non-settled event is a caller bug.
    pub fn settle_event(&self, event: &Event) -> Option<SettlementReport> {
        debug_assert!(
            event.status == EventStatus::Settled,
            "settle_event on non-settled event"
        );
        if event.status != EventStatus::Settled {
            error!(key = %event.key(), status = event.status.as_str(),
                "settlement requested for non-settled event, refusing");
            return None;
        }

        let key = event.key();
        let ground_truth = event.answer.unwrap_or(Resolution::Unknown);
        if ground_truth == Resolution::Unknown {
            warn!(key = %key, "settled event has unknown resolution");
        }

        let as_of = Utc::now().timestamp();
        let truth = GroundTruth::Binary(ground_truth);

        // Roster plus anyone with history; late joiners still get scored.
        let mut participants: BTreeSet<ParticipantId> = self.roster.iter().copied().collect();
        participants.extend(self.ledger.participants(&key));

        let mut rewards = HashMap::with_capacity(participants.len());
        let mut rng = self.rng.lock();
        for participant in participants {
            let answer = self
                .ledger
                .get_final(participant, &key, as_of)
                .map(SubmittedAnswer::Probability);
            let reward = self.scorer.score(answer.as_ref(), &truth, &mut *rng);
            rewards.insert(participant, reward);
        }
        drop(rng);

        // Single-use: the event and any leftover history are gone after this.
        self.ledger.drop_event(&key);
        self.registry.evict(&key);

        Some(SettlementReport {
            event_key: key,
            provider_name: event.provider_name.clone(),
            event_id: event.id.clone(),
            ground_truth,
            rewards,
            settled_at: Utc::now(),
        })
    }

    /// Scores revealed answer vectors against a numeric ground truth. Each
    /// reveal is checked against its participant's outstanding commitment
    /// first; an unverified reveal pays zero no matter how close it is.
    pub fn score_reveals(
        &self,
        reveals: &HashMap<ParticipantId, Vec<f64>>,
        ground_truth: &[f64],
        current_round: u64,
    ) -> HashMap<ParticipantId, f64> {
        let truth = GroundTruth::Vector(ground_truth.to_vec());
        let mut rng = self.rng.lock();
        let mut rewards = HashMap::with_capacity(reveals.len());
        for (&participant, values) in reveals {
            let verified = self
                .commitments
                .take_verified(participant, values, current_round);
            let answer = SubmittedAnswer::Vector {
                values: values.clone(),
                verified,
            };
            let reward = self.vector_scorer.score(Some(&answer), &truth, &mut *rng);
            rewards.insert(participant, reward);
        }
        rewards
    }
}

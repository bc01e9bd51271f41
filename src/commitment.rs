//! Commit-reveal integrity check for numeric-vector answers.
//!
//! A participant first submits the hash of its answer vector, then reveals
//! the vector itself in a later round. The verifier recomputes the hash from
//! the reveal with the identical encoding, so any tampering between commit
//! and reveal is detected. A reveal that fails verification is not an error,
//! just a missing answer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use crate::models::ParticipantId;

/// SHA-256 digest over the fixed-width encoding of an answer vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    digest: [u8; 32],
}

impl Commitment {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Transport form.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.digest)
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s.trim()).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self { digest })
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.digest))
    }
}

/// Hashes an answer vector. Each value is encoded as a little-endian f32 and
/// the encodings are concatenated before hashing; commit and reveal sides
/// must agree on this byte layout exactly.
pub fn compute_commitment(values: &[f64]) -> Commitment {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update((*v as f32).to_le_bytes());
    }
    Commitment {
        digest: hasher.finalize().into(),
    }
}

/// Recomputes the commitment from `values` and compares. Any mismatch,
/// including a different vector length, rejects.
pub fn verify(values: &[f64], claimed: &Commitment) -> bool {
    compute_commitment(values) == *claimed
}

struct StoredCommit {
    commitment: Commitment,
    round: u64,
}

/// Tracks outstanding commitments per participant across query rounds.
///
/// A commitment with no reveal within `max_age_rounds` expires; a reveal with
/// no live commitment is ineligible. Both outcomes feed the zero-reward
/// branch of scoring rather than surfacing as errors.
pub struct CommitmentStore {
    max_age_rounds: u64,
    inner: Mutex<HashMap<ParticipantId, StoredCommit>>,
}

impl CommitmentStore {
    pub fn new(max_age_rounds: u64) -> Self {
        Self {
            max_age_rounds,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records a commitment for the given round, replacing any earlier one.
    pub fn commit(&self, participant: ParticipantId, commitment: Commitment, round: u64) {
        self.inner
            .lock()
            .insert(participant, StoredCommit { commitment, round });
    }

    /// Checks a revealed vector against the participant's outstanding
    /// commitment and consumes it. False when there is no commitment, the
    /// commitment is older than `max_age_rounds`, or the hash differs.
    pub fn take_verified(
        &self,
        participant: ParticipantId,
        values: &[f64],
        current_round: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(stored) = inner.remove(&participant) else {
            debug!(participant, "reveal with no outstanding commitment");
            return false;
        };
        if current_round.saturating_sub(stored.round) > self.max_age_rounds {
            debug!(
                participant,
                committed_round = stored.round,
                current_round,
                "commitment expired before reveal"
            );
            return false;
        }
        verify(values, &stored.commitment)
    }

    /// Drops commitments that are too old to ever verify. Called once per
    /// query round.
    pub fn sweep_expired(&self, current_round: u64) {
        let max_age = self.max_age_rounds;
        self.inner
            .lock()
            .retain(|_, stored| current_round.saturating_sub(stored.round) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

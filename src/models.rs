use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked market event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Settled,
    Discarded,
    /// Upstream payload could not be mapped onto a known state.
    Unknown,
}

impl EventStatus {
    /// Settled and Discarded events accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Settled | EventStatus::Discarded)
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Settled => "settled",
            EventStatus::Discarded => "discarded",
            EventStatus::Unknown => "unknown",
        }
    }
}

/// Ground truth for a binary market. Participants submit P(Yes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Yes,
    No,
    /// Settled upstream but no winning outcome reported.
    Unknown,
}

pub type ParticipantId = u64;

/// Composite registry key, unique across providers.
pub type EventKey = String;

pub fn event_key(provider_name: &str, event_id: &str) -> EventKey {
    format!("{}-{}", provider_name, event_id)
}

/// A market event tracked through its lifecycle.
///
/// Identity (`provider_name`, `id`) is immutable after creation. `answer`
/// is present exactly when `status == Settled`; the registry write path
/// enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub provider_name: String,
    pub id: String,
    pub description: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub resolve_date: Option<DateTime<Utc>>,
    pub answer: Option<Resolution>,
    pub status: EventStatus,
    pub last_updated_at: DateTime<Utc>,
    /// Provider-specific payload, stored and forwarded but never interpreted.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn key(&self) -> EventKey {
        event_key(&self.provider_name, &self.id)
    }
}

/// Mutable fields of an event, as delivered by a provider sync.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub id: String,
    pub description: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub resolve_date: Option<DateTime<Utc>>,
    pub answer: Option<Resolution>,
    pub metadata: serde_json::Value,
}

/// One timestamped answer from a participant. Never mutated once stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Submission {
    pub submitted_at: i64,
    pub value: f64,
}

/// Reward policy when a participant has no eligible answer at settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentPolicy {
    /// Hard zero.
    Zero,
    /// Small random floor in [0, 0.1) so all-absent rankings don't tie exactly.
    RandomFloor,
}

impl AbsentPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "zero" => Some(AbsentPolicy::Zero),
            "random_floor" | "floor" => Some(AbsentPolicy::RandomFloor),
            _ => None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub state_path: String,
    pub submission_cutoff_secs: i64,
    pub poll_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub absent_policy: AbsentPolicy,
    pub participant_ids: Vec<ParticipantId>,
    pub commit_max_age_rounds: u64,
    pub polymarket_api_base: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let state_path = std::env::var("STATE_PATH")
            .unwrap_or_else(|_| "./settlebot_state.json".to_string());

        let submission_cutoff_secs = std::env::var("SUBMISSION_CUTOFF_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let poll_interval_secs = std::env::var("POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let refresh_interval_secs = std::env::var("REFRESH_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let checkpoint_interval_secs = std::env::var("CHECKPOINT_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        // Deliberately an explicit choice: both behaviors exist in the wild
        // and silently picking one skews all-absent rankings.
        let absent_policy = std::env::var("ABSENT_SCORE_POLICY")
            .ok()
            .and_then(|v| AbsentPolicy::parse(&v))
            .unwrap_or(AbsentPolicy::RandomFloor);

        let participant_ids = std::env::var("PARTICIPANT_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<ParticipantId>().ok())
            .collect();

        let commit_max_age_rounds = std::env::var("COMMIT_MAX_AGE_ROUNDS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let polymarket_api_base = std::env::var("POLYMARKET_API_BASE")
            .unwrap_or_else(|_| "https://clob.polymarket.com".to_string());

        Ok(Self {
            state_path,
            submission_cutoff_secs,
            poll_interval_secs,
            refresh_interval_secs,
            checkpoint_interval_secs,
            absent_policy,
            participant_ids,
            commit_max_age_rounds,
            polymarket_api_base,
        })
    }
}

//! Operation and ScheduledMessage — the persisted data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One phased campaign run against a single target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID.
    pub id: String,
    /// Entity the campaign runs against (group, channel, user).
    pub target_id: String,
    /// Who started the campaign.
    pub initiator_id: String,
    /// Current phase, `0..max_phase`.
    pub phase: u32,
    /// Number of phases, fixed at creation.
    pub max_phase: u32,
    pub status: OperationStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// When each reached phase started. Backdated to the elapsed deadline on catch-up.
    #[serde(default)]
    pub phase_start_times: BTreeMap<u32, DateTime<Utc>>,
    /// Candidate recipients, in the order supplied (deduplicated).
    #[serde(default)]
    pub participant_ids: Vec<String>,
    /// Participants ranked by influence score, computed once at creation.
    #[serde(default)]
    pub priority_list: Vec<String>,
    /// Caller-supplied context, never interpreted.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Operation {
    pub fn new(
        target_id: &str,
        initiator_id: &str,
        max_phase: u32,
        participant_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut phase_start_times = BTreeMap::new();
        phase_start_times.insert(0, now);
        Self {
            id: format!("op-{}", uuid::Uuid::new_v4()),
            target_id: target_id.to_string(),
            initiator_id: initiator_id.to_string(),
            phase: 0,
            max_phase,
            status: OperationStatus::Active,
            start_time: now,
            end_time: None,
            phase_start_times,
            participant_ids: dedup_preserving_order(participant_ids),
            priority_list: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == OperationStatus::Active
    }

    /// Index of the last phase.
    pub fn final_phase(&self) -> u32 {
        self.max_phase.saturating_sub(1)
    }

    pub fn is_final_phase(&self) -> bool {
        self.phase >= self.final_phase()
    }

    /// Start of the current phase. Falls back to `start_time` for records
    /// written without an entry for the current phase.
    pub fn current_phase_start(&self) -> DateTime<Utc> {
        self.phase_start_times
            .get(&self.phase)
            .copied()
            .unwrap_or(self.start_time)
    }

    /// Display-only progress in percent.
    pub fn progress(&self) -> f64 {
        if self.max_phase <= 1 {
            return 100.0;
        }
        f64::from(self.phase) / f64::from(self.final_phase()) * 100.0
    }

    pub fn status_view(&self) -> OperationStatusView {
        OperationStatusView {
            operation_id: self.id.clone(),
            target_id: self.target_id.clone(),
            phase: self.phase,
            status: self.status,
            progress: self.progress(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Active,
    Completed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Active => "active",
            OperationStatus::Completed => "completed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Active)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a message reaches its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Posted to the target entity itself (group-wide).
    Broadcast,
    /// Sent to one participant.
    Direct,
}

/// Delivery status of a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Ready,
    /// Terminal state of a confirmed message. Never stored: confirmation
    /// deletes the record, so store lookups return nothing instead.
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Ready => "ready",
            MessageStatus::Delivered => "delivered",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned payload delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub operation_id: String,
    /// Recipient: the target entity or one participant.
    pub target_id: String,
    pub channel: Channel,
    /// Opaque payload, handed to the sender unchanged.
    pub payload: String,
    pub scheduled_at: DateTime<Utc>,
    /// Phase the message was planned for. Never updated.
    pub phase: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn pending(
        operation_id: &str,
        target_id: &str,
        channel: Channel,
        payload: &str,
        scheduled_at: DateTime<Utc>,
        phase: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            operation_id: operation_id.to_string(),
            target_id: target_id.to_string(),
            channel,
            payload: payload.to_string(),
            scheduled_at,
            phase,
            status: MessageStatus::Pending,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_at
    }

    pub fn to_ready(&self) -> ReadyMessage {
        ReadyMessage {
            message_id: self.id.clone(),
            operation_id: self.operation_id.clone(),
            target_id: self.target_id.clone(),
            channel: self.channel,
            payload: self.payload.clone(),
            phase: self.phase,
            scheduled_at: self.scheduled_at,
        }
    }
}

/// Activity metrics for one candidate recipient. Missing fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetrics {
    #[serde(default)]
    pub message_count: f64,
    #[serde(default)]
    pub response_rate: f64,
    #[serde(default)]
    pub mention_count: f64,
    #[serde(default)]
    pub recency: f64,
}

/// A ready message as handed to the external sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub message_id: String,
    pub operation_id: String,
    pub target_id: String,
    pub channel: Channel,
    pub payload: String,
    pub phase: u32,
    pub scheduled_at: DateTime<Utc>,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatusView {
    pub operation_id: String,
    pub target_id: String,
    pub phase: u32,
    pub status: OperationStatus,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Active and archived operations of one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetOperations {
    pub active: Vec<Operation>,
    pub historical: Vec<Operation>,
}

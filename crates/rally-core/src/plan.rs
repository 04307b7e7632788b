//! Phase delivery plans — what gets sent, to whom, and when, on phase entry.

use serde::{Deserialize, Serialize};

use crate::types::Channel;

/// Delivery plan for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Phase this plan applies to.
    pub phase: u32,
    /// Overrides the engine-wide phase duration for this phase.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Steps, expanded in order.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// One `(recipients, offset)` entry of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub recipients: Recipients,
    /// Opaque payload delivered to every recipient of the step.
    pub payload: String,
    /// Delay after phase start for the first recipient.
    #[serde(default)]
    pub base_offset_ms: u64,
    /// Added per recipient index: `base_offset + index * stagger`.
    #[serde(default)]
    pub stagger_ms: u64,
    /// Defaults to broadcast for the target and direct for participants.
    #[serde(default)]
    pub channel: Option<Channel>,
}

impl PlanStep {
    pub fn new(recipients: Recipients, payload: &str) -> Self {
        Self {
            recipients,
            payload: payload.to_string(),
            base_offset_ms: 0,
            stagger_ms: 0,
            channel: None,
        }
    }

    pub fn at(mut self, base_offset_ms: u64) -> Self {
        self.base_offset_ms = base_offset_ms;
        self
    }

    pub fn stagger(mut self, stagger_ms: u64) -> Self {
        self.stagger_ms = stagger_ms;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel.unwrap_or(match self.recipients {
            Recipients::Target => Channel::Broadcast,
            Recipients::Top { .. } | Recipients::All => Channel::Direct,
        })
    }
}

/// Recipient category selected by a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipients {
    /// The operation's target entity itself.
    Target,
    /// The first `k` entries of the priority list.
    Top { k: usize },
    /// Every participant, in priority order.
    All,
}

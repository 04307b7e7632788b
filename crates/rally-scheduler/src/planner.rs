//! Message planner — expands a phase plan into concrete scheduled messages.
//!
//! `scheduled_at = phase_start + base_offset + index * stagger`, where `index`
//! is the recipient's position within its step.

use chrono::{DateTime, Utc};

use rally_core::error::{RallyError, Result};
use rally_core::plan::{PhasePlan, PlanStep, Recipients};
use rally_core::types::{Operation, ScheduledMessage};

use crate::phases;

/// Recipients a step selects, in delivery order.
pub fn resolve_recipients(op: &Operation, recipients: Recipients) -> Vec<String> {
    let ranked = if op.priority_list.is_empty() {
        &op.participant_ids
    } else {
        &op.priority_list
    };
    match recipients {
        Recipients::Target => vec![op.target_id.clone()],
        Recipients::Top { k } => ranked.iter().take(k).cloned().collect(),
        Recipients::All => ranked.clone(),
    }
}

fn offset_ms(step: &PlanStep, index: usize) -> Result<u64> {
    u64::try_from(index)
        .ok()
        .and_then(|i| step.stagger_ms.checked_mul(i))
        .and_then(|stagger| step.base_offset_ms.checked_add(stagger))
        .ok_or_else(|| RallyError::Config(format!("step offset overflows at recipient {index}")))
}

/// Build the pending messages for `phase`, starting at `phase_start`.
/// A missing plan yields no messages; an offset past the representable
/// time range is a `Config` error.
pub fn plan_phase(
    op: &Operation,
    phase: u32,
    phase_start: DateTime<Utc>,
    plan: Option<&PhasePlan>,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledMessage>> {
    let Some(plan) = plan else {
        return Ok(Vec::new());
    };
    let mut messages = Vec::new();
    for step in &plan.steps {
        let channel = step.channel();
        for (index, recipient) in resolve_recipients(op, step.recipients).iter().enumerate() {
            let scheduled_at =
                phases::offset_by(phase_start, offset_ms(step, index)?, "step offset")?;
            messages.push(ScheduledMessage::pending(
                &op.id,
                recipient,
                channel,
                &step.payload,
                scheduled_at,
                phase,
                now,
            ));
        }
    }
    tracing::debug!(
        "🗓️ Planned {} message(s) for {} phase {}",
        messages.len(),
        op.id,
        phase
    );
    Ok(messages)
}

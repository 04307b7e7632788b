//! Phase state machine rules. Pure functions over an `Operation` copy;
//! the engine applies them inside a store read-modify-write.

use chrono::{DateTime, Duration, Utc};

use rally_core::error::{RallyError, Result};
use rally_core::types::{Operation, OperationStatus};

/// Reject advances on terminal operations and on the final phase.
pub fn check_advance(op: &Operation) -> Result<()> {
    if !op.is_active() {
        return Err(RallyError::InvalidState(format!(
            "operation {} is {}",
            op.id, op.status
        )));
    }
    if op.is_final_phase() {
        return Err(RallyError::InvalidState(format!(
            "operation {} is already at final phase {}",
            op.id, op.phase
        )));
    }
    Ok(())
}

/// Move to the next phase, recording when it started.
pub fn apply_advance(op: &mut Operation, phase_start: DateTime<Utc>) -> u32 {
    op.phase += 1;
    op.phase_start_times.insert(op.phase, phase_start);
    op.phase
}

/// `ms` as a signed duration, `None` when it does not fit.
pub fn millis(ms: u64) -> Option<Duration> {
    i64::try_from(ms).ok().and_then(Duration::try_milliseconds)
}

/// `at + ms`, or `Config` when the result leaves the representable range.
pub fn offset_by(at: DateTime<Utc>, ms: u64, what: &str) -> Result<DateTime<Utc>> {
    millis(ms)
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| RallyError::Config(format!("{what} of {ms}ms is out of range")))
}

/// Whether an advance arriving at `now` duplicates the one that entered the
/// current phase. Phase 0 is entered by initiation, never by an advance.
pub fn is_duplicate_advance(op: &Operation, now: DateTime<Utc>, debounce_ms: u64) -> bool {
    if op.phase == 0 || debounce_ms == 0 {
        return false;
    }
    let window = millis(debounce_ms).unwrap_or(Duration::MAX);
    let since = now - op.current_phase_start();
    since >= Duration::zero() && since < window
}

/// When the current phase's duration runs out.
pub fn phase_deadline(op: &Operation, duration_ms: u64) -> Result<DateTime<Utc>> {
    offset_by(op.current_phase_start(), duration_ms, "phase duration")
}

/// Terminal copy of `op`.
pub fn terminated(op: &Operation, status: OperationStatus, now: DateTime<Utc>) -> Operation {
    let mut done = op.clone();
    done.status = status;
    done.end_time = Some(now);
    done
}

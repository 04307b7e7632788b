//! Campaign engine — the public operations on top of the store.
//!
//! Every mutation of one operation runs under that operation's lock and goes
//! through a store read-modify-write, so duplicate triggers (a manual advance
//! racing the sweep, two sweeps after a restart) serialize and re-validate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use rally_core::clock::{ClockFn, system_clock};
use rally_core::config::RallyConfig;
use rally_core::error::{RallyError, Result};
use rally_core::types::{
    ActivityMetrics, MessageStatus, Operation, OperationStatus, OperationStatusView, ReadyMessage,
    TargetOperations,
};

use crate::phases;
use crate::planner;
use crate::scorer;
use crate::store::{Commit, DeleteOutcome, OperationStore};

/// Keyed mutex table serializing work per operation (and per target on initiate).
#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OperationLocks {
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, key: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a fire attempt on one scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Flipped pending → ready.
    Readied,
    /// Owning operation is gone or terminal; message deleted.
    Dropped,
    /// Not due yet.
    NotDue,
    /// Missing or no longer pending.
    Skipped,
}

/// The campaign engine — owns phase transitions and message readiness.
pub struct CampaignEngine {
    store: Arc<dyn OperationStore>,
    config: RallyConfig,
    clock: ClockFn,
    pub(crate) locks: OperationLocks,
}

impl CampaignEngine {
    /// Create an engine on the wall clock.
    pub fn new(store: Arc<dyn OperationStore>, config: RallyConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(store: Arc<dyn OperationStore>, config: RallyConfig, clock: ClockFn) -> Self {
        Self {
            store,
            config,
            clock,
            locks: OperationLocks::default(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn config(&self) -> &RallyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// Start a campaign against `target_id`. Returns the new operation id.
    pub fn initiate(
        &self,
        target_id: &str,
        initiator_id: &str,
        participant_ids: Vec<String>,
        initial_metrics: &HashMap<String, ActivityMetrics>,
    ) -> Result<String> {
        self.initiate_with_metadata(
            target_id,
            initiator_id,
            participant_ids,
            initial_metrics,
            HashMap::new(),
        )
    }

    pub fn initiate_with_metadata(
        &self,
        target_id: &str,
        initiator_id: &str,
        participant_ids: Vec<String>,
        initial_metrics: &HashMap<String, ActivityMetrics>,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        if target_id.trim().is_empty() {
            return Err(RallyError::InvalidState("target_id must not be empty".into()));
        }
        let key = format!("target:{target_id}");
        let lock = self.locks.get(&key);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = self.create_for_target(target_id, initiator_id, participant_ids, initial_metrics, metadata);
        drop(guard);
        // the store's active-target index still rejects a racing second create
        self.locks.forget(&key);
        result
    }

    fn create_for_target(
        &self,
        target_id: &str,
        initiator_id: &str,
        participant_ids: Vec<String>,
        initial_metrics: &HashMap<String, ActivityMetrics>,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        if let Some(existing) = self.store.list_active_by_target(target_id)?.first() {
            return Err(RallyError::Conflict(format!(
                "target {target_id} already has active operation {}",
                existing.id
            )));
        }

        let now = self.now();
        let mut op = Operation::new(
            target_id,
            initiator_id,
            self.config.engine.max_phase,
            participant_ids,
            now,
        );
        op.priority_list = scorer::priority_list(&op.participant_ids, initial_metrics);
        op.metadata = metadata;

        let messages = planner::plan_phase(&op, 0, now, self.config.plan_for(0), now)?;
        self.store.create_operation(&op, &messages)?;

        tracing::info!(
            "🚩 Operation {} started on {} by {} ({} participants, {} message(s) planned)",
            op.id,
            op.target_id,
            op.initiator_id,
            op.participant_ids.len(),
            messages.len()
        );
        Ok(op.id)
    }

    /// Advance to the next phase and plan it.
    ///
    /// An advance arriving within `advance_debounce_ms` of the current phase's
    /// start is treated as a duplicate of the advance that entered it and
    /// returns the operation unchanged. This holds for the final phase too:
    /// only an advance outside the window gets `InvalidState` there.
    pub fn advance_phase(&self, operation_id: &str) -> Result<Operation> {
        let lock = self.locks.get(operation_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.now();
        let debounce_ms = self.config.engine.advance_debounce_ms;

        let result = self.store.update_operation(operation_id, &mut |op| {
            if op.is_active() && phases::is_duplicate_advance(op, now, debounce_ms) {
                tracing::debug!("🔁 Duplicate advance ignored for {} (phase {})", op.id, op.phase);
                return Ok(Commit::Skip);
            }
            phases::check_advance(op)?;
            self.stage_advance(op, now, now)
        });
        self.log_advance(operation_id, result)
    }

    /// Advance only if the operation is still at `from_phase`; otherwise the
    /// call is a no-op returning the current operation.
    pub fn advance_phase_from(&self, operation_id: &str, from_phase: u32) -> Result<Operation> {
        self.advance_from_at(operation_id, from_phase, self.now())
    }

    /// Token-guarded advance with an explicit start time for the new phase.
    pub(crate) fn advance_from_at(
        &self,
        operation_id: &str,
        from_phase: u32,
        phase_start: DateTime<Utc>,
    ) -> Result<Operation> {
        let lock = self.locks.get(operation_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.now();

        let result = self.store.update_operation(operation_id, &mut |op| {
            if op.is_active() && op.phase != from_phase {
                return Ok(Commit::Skip);
            }
            phases::check_advance(op)?;
            self.stage_advance(op, phase_start, now)
        });
        self.log_advance(operation_id, result)
    }

    fn stage_advance(&self, op: &mut Operation, phase_start: DateTime<Utc>, now: DateTime<Utc>) -> Result<Commit> {
        let phase = phases::apply_advance(op, phase_start);
        let messages = planner::plan_phase(op, phase, phase_start, self.config.plan_for(phase), now)?;
        Ok(Commit::Save { messages })
    }

    fn log_advance(&self, operation_id: &str, result: Result<Operation>) -> Result<Operation> {
        match result {
            Ok(op) => {
                tracing::info!("⏭️ Operation {} at phase {}/{}", op.id, op.phase, op.final_phase());
                Ok(op)
            }
            // archived operations are terminal, not unknown
            Err(RallyError::NotFound(_)) => {
                self.locks.forget(operation_id);
                match self.store.get_history(operation_id)? {
                    Some(op) => Err(RallyError::InvalidState(format!(
                        "operation {} is {}",
                        op.id, op.status
                    ))),
                    None => Err(RallyError::NotFound(format!("operation {operation_id}"))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Complete the active operation of `target_id`. `false` if there is none.
    pub fn mark_complete(&self, target_id: &str) -> Result<bool> {
        let Some(op) = self.store.list_active_by_target(target_id)?.into_iter().next() else {
            return Ok(false);
        };
        self.terminate(&op.id, OperationStatus::Completed)
    }

    /// Cancel an operation. `false` if it is unknown or already terminal.
    pub fn cancel(&self, operation_id: &str) -> Result<bool> {
        self.terminate(operation_id, OperationStatus::Cancelled)
    }

    pub(crate) fn terminate(&self, operation_id: &str, status: OperationStatus) -> Result<bool> {
        let lock = self.locks.get(operation_id);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let op = match self.store.get_operation(operation_id)? {
            Some(op) if op.is_active() => op,
            _ => {
                drop(guard);
                self.locks.forget(operation_id);
                return Ok(false);
            }
        };
        let done = phases::terminated(&op, status, self.now());
        let purged = match self.store.archive_operation(&done) {
            Ok(n) => n,
            Err(RallyError::NotFound(_)) | Err(RallyError::InvalidState(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        drop(guard);
        self.locks.forget(operation_id);

        tracing::info!(
            "🏁 Operation {} on {} {} at phase {} ({} message(s) purged)",
            done.id,
            done.target_id,
            status,
            done.phase,
            purged
        );
        Ok(true)
    }

    /// Messages ready for the external sender, oldest due first.
    pub fn get_ready_messages(&self) -> Result<Vec<ReadyMessage>> {
        Ok(self
            .store
            .list_messages_by_status(MessageStatus::Ready)?
            .iter()
            .map(|m| m.to_ready())
            .collect())
    }

    /// Confirm delivery of a ready message, removing it.
    /// `false` for unknown ids, `InvalidState` if the message is not ready.
    pub fn confirm_delivered(&self, message_id: &str) -> Result<bool> {
        match self
            .store
            .delete_message_in_status(message_id, MessageStatus::Ready)?
        {
            DeleteOutcome::Deleted => {
                tracing::debug!("📬 Message {} delivered", message_id);
                Ok(true)
            }
            DeleteOutcome::Missing => Ok(false),
            DeleteOutcome::WrongStatus(status) => Err(RallyError::InvalidState(format!(
                "message {message_id} is {status}, not ready"
            ))),
        }
    }

    /// Active or archived operation by id.
    pub fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        if let Some(op) = self.store.get_operation(operation_id)? {
            return Ok(op);
        }
        self.store
            .get_history(operation_id)?
            .ok_or_else(|| RallyError::NotFound(format!("operation {operation_id}")))
    }

    pub fn get_status(&self, operation_id: &str) -> Result<OperationStatusView> {
        Ok(self.get_operation(operation_id)?.status_view())
    }

    pub fn list_for_target(&self, target_id: &str) -> Result<TargetOperations> {
        Ok(TargetOperations {
            active: self.store.list_active_by_target(target_id)?,
            historical: self.store.list_history_by_target(target_id)?,
        })
    }

    /// Re-validate one message against the store and flip it to ready if due.
    pub fn fire_message(&self, message_id: &str) -> Result<FireOutcome> {
        self.fire_message_at(message_id, self.now())
    }

    pub(crate) fn fire_message_at(&self, message_id: &str, now: DateTime<Utc>) -> Result<FireOutcome> {
        let Some(msg) = self.store.get_message(message_id)? else {
            return Ok(FireOutcome::Skipped);
        };
        if msg.status != MessageStatus::Pending {
            return Ok(FireOutcome::Skipped);
        }

        let lock = self.locks.get(&msg.operation_id);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let owner_active = self
            .store
            .get_operation(&msg.operation_id)?
            .is_some_and(|op| op.is_active());
        if !owner_active {
            self.store.delete_message(message_id)?;
            drop(guard);
            self.locks.forget(&msg.operation_id);
            tracing::debug!("🗑️ Dropped message {} of inactive {}", message_id, msg.operation_id);
            return Ok(FireOutcome::Dropped);
        }
        if !msg.is_due(now) {
            return Ok(FireOutcome::NotDue);
        }

        let updated = self.store.update_message(message_id, &mut |m| {
            if m.status != MessageStatus::Pending {
                return Ok(false);
            }
            m.status = MessageStatus::Ready;
            Ok(true)
        })?;
        match updated {
            Some(m) if m.status == MessageStatus::Ready => {
                tracing::debug!("📨 Message {} ready for {} (phase {})", m.id, m.target_id, m.phase);
                Ok(FireOutcome::Readied)
            }
            Some(_) => Ok(FireOutcome::Skipped),
            None => Ok(FireOutcome::Dropped),
        }
    }
}

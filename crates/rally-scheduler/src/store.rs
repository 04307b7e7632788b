//! Operation store — keyed storage for operations, history and scheduled messages.
//!
//! Every write is read-modify-write on a copy: mutators never touch shared
//! state, and nothing becomes visible until the backend accepts the write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rally_core::error::{RallyError, Result};
use rally_core::types::{MessageStatus, Operation, OperationStatus, ScheduledMessage};

/// What an operation mutator wants written.
#[derive(Debug)]
pub enum Commit {
    /// Leave the stored record as it was.
    Skip,
    /// Write the mutated operation and insert `messages` in the same transaction.
    Save { messages: Vec<ScheduledMessage> },
}

impl Commit {
    pub fn save() -> Self {
        Commit::Save {
            messages: Vec::new(),
        }
    }
}

pub type OperationMutator<'a> = dyn FnMut(&mut Operation) -> Result<Commit> + 'a;
/// Returns `true` when the mutated message should be written.
pub type MessageMutator<'a> = dyn FnMut(&mut ScheduledMessage) -> Result<bool> + 'a;

/// Result of a status-guarded delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
    WrongStatus(MessageStatus),
}

/// Durable keyed storage. Each method is atomic.
pub trait OperationStore: Send + Sync {
    /// Insert a new active operation with its initial messages.
    /// Fails with `Conflict` if the target already has an active operation.
    fn create_operation(&self, op: &Operation, messages: &[ScheduledMessage]) -> Result<()>;

    fn get_operation(&self, id: &str) -> Result<Option<Operation>>;

    fn list_active(&self) -> Result<Vec<Operation>>;

    fn list_active_by_target(&self, target_id: &str) -> Result<Vec<Operation>>;

    /// Apply `mutator` to a copy of the operation and persist the result.
    /// Returns the stored operation after the call (unchanged on `Commit::Skip`).
    fn update_operation(&self, id: &str, mutator: &mut OperationMutator<'_>) -> Result<Operation>;

    /// Move a terminal operation to history and purge its messages.
    /// Returns the number of purged messages.
    fn archive_operation(&self, op: &Operation) -> Result<usize>;

    fn remove_operation(&self, id: &str) -> Result<bool>;

    fn get_history(&self, id: &str) -> Result<Option<Operation>>;

    fn list_history_by_target(&self, target_id: &str) -> Result<Vec<Operation>>;

    fn insert_messages(&self, messages: &[ScheduledMessage]) -> Result<()>;

    fn get_message(&self, id: &str) -> Result<Option<ScheduledMessage>>;

    /// Apply `mutator` to a copy of the message. `None` if the message does not exist.
    fn update_message(
        &self,
        id: &str,
        mutator: &mut MessageMutator<'_>,
    ) -> Result<Option<ScheduledMessage>>;

    fn delete_message(&self, id: &str) -> Result<bool>;

    /// Delete the message only if it currently has `status`.
    fn delete_message_in_status(&self, id: &str, status: MessageStatus) -> Result<DeleteOutcome>;

    /// Messages with `status`, ordered by due time.
    fn list_messages_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>>;

    fn list_messages_for_operation(&self, operation_id: &str) -> Result<Vec<ScheduledMessage>>;
}

fn ensure_terminal(op: &Operation) -> Result<()> {
    if op.status == OperationStatus::Active {
        return Err(RallyError::InvalidState(format!(
            "operation {} must be completed or cancelled before archiving",
            op.id
        )));
    }
    Ok(())
}

pub(crate) fn sort_messages(messages: &mut [ScheduledMessage]) {
    messages.sort_by(|a, b| {
        a.scheduled_at
            .cmp(&b.scheduled_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Default)]
struct MemoryState {
    operations: HashMap<String, Operation>,
    history: Vec<Operation>,
    messages: HashMap<String, ScheduledMessage>,
}

/// In-process store. One mutex guards all three collections.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| RallyError::Persistence("memory store lock poisoned".into()))
    }
}

impl OperationStore for MemoryStore {
    fn create_operation(&self, op: &Operation, messages: &[ScheduledMessage]) -> Result<()> {
        let mut state = self.lock()?;
        if state
            .operations
            .values()
            .any(|o| o.target_id == op.target_id && o.is_active())
        {
            return Err(RallyError::Conflict(format!(
                "target {} already has an active operation",
                op.target_id
            )));
        }
        if state.operations.contains_key(&op.id) {
            return Err(RallyError::Conflict(format!("operation {} already exists", op.id)));
        }
        state.operations.insert(op.id.clone(), op.clone());
        for msg in messages {
            state.messages.insert(msg.id.clone(), msg.clone());
        }
        Ok(())
    }

    fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        Ok(self.lock()?.operations.get(id).cloned())
    }

    fn list_active(&self) -> Result<Vec<Operation>> {
        let state = self.lock()?;
        let mut ops: Vec<Operation> = state
            .operations
            .values()
            .filter(|o| o.is_active())
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(ops)
    }

    fn list_active_by_target(&self, target_id: &str) -> Result<Vec<Operation>> {
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|o| o.target_id == target_id)
            .collect())
    }

    fn update_operation(&self, id: &str, mutator: &mut OperationMutator<'_>) -> Result<Operation> {
        let mut state = self.lock()?;
        let current = state
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| RallyError::NotFound(format!("operation {id}")))?;
        let mut next = current.clone();
        match mutator(&mut next)? {
            Commit::Skip => Ok(current),
            Commit::Save { messages } => {
                for msg in messages {
                    state.messages.insert(msg.id.clone(), msg);
                }
                state.operations.insert(id.to_string(), next.clone());
                Ok(next)
            }
        }
    }

    fn archive_operation(&self, op: &Operation) -> Result<usize> {
        ensure_terminal(op)?;
        let mut state = self.lock()?;
        match state.operations.get(&op.id) {
            None => return Err(RallyError::NotFound(format!("operation {}", op.id))),
            Some(current) if !current.is_active() => {
                return Err(RallyError::InvalidState(format!(
                    "operation {} is already {}",
                    op.id, current.status
                )));
            }
            Some(_) => {}
        }
        state.operations.remove(&op.id);
        state.history.push(op.clone());
        let before = state.messages.len();
        state.messages.retain(|_, m| m.operation_id != op.id);
        Ok(before - state.messages.len())
    }

    fn remove_operation(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.operations.remove(id).is_some())
    }

    fn get_history(&self, id: &str) -> Result<Option<Operation>> {
        Ok(self.lock()?.history.iter().rev().find(|o| o.id == id).cloned())
    }

    fn list_history_by_target(&self, target_id: &str) -> Result<Vec<Operation>> {
        Ok(self
            .lock()?
            .history
            .iter()
            .filter(|o| o.target_id == target_id)
            .cloned()
            .collect())
    }

    fn insert_messages(&self, messages: &[ScheduledMessage]) -> Result<()> {
        let mut state = self.lock()?;
        for msg in messages {
            state.messages.insert(msg.id.clone(), msg.clone());
        }
        Ok(())
    }

    fn get_message(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        Ok(self.lock()?.messages.get(id).cloned())
    }

    fn update_message(
        &self,
        id: &str,
        mutator: &mut MessageMutator<'_>,
    ) -> Result<Option<ScheduledMessage>> {
        let mut state = self.lock()?;
        let Some(current) = state.messages.get(id).cloned() else {
            return Ok(None);
        };
        let mut next = current.clone();
        if mutator(&mut next)? {
            state.messages.insert(id.to_string(), next.clone());
            Ok(Some(next))
        } else {
            Ok(Some(current))
        }
    }

    fn delete_message(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.messages.remove(id).is_some())
    }

    fn delete_message_in_status(&self, id: &str, status: MessageStatus) -> Result<DeleteOutcome> {
        let mut state = self.lock()?;
        match state.messages.get(id).map(|m| m.status) {
            None => Ok(DeleteOutcome::Missing),
            Some(found) if found != status => Ok(DeleteOutcome::WrongStatus(found)),
            Some(_) => {
                state.messages.remove(id);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    fn list_messages_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>> {
        let state = self.lock()?;
        let mut messages: Vec<ScheduledMessage> = state
            .messages
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn list_messages_for_operation(&self, operation_id: &str) -> Result<Vec<ScheduledMessage>> {
        let state = self.lock()?;
        let mut messages: Vec<ScheduledMessage> = state
            .messages
            .values()
            .filter(|m| m.operation_id == operation_id)
            .cloned()
            .collect();
        sort_messages(&mut messages);
        Ok(messages)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rally_core::types::Channel;

    pub(crate) fn message_for(op: &Operation, offset_ms: i64) -> ScheduledMessage {
        ScheduledMessage::pending(
            &op.id,
            &op.target_id,
            Channel::Broadcast,
            "payload",
            op.start_time + Duration::milliseconds(offset_ms),
            op.phase,
            op.start_time,
        )
    }

    /// Contract checks shared by every backend.
    pub(crate) fn exercise_store(store: &dyn OperationStore) {
        let now = Utc::now();
        let op = Operation::new("G1", "U1", 3, vec!["A".into()], now);
        let msg = message_for(&op, 100);
        store.create_operation(&op, std::slice::from_ref(&msg)).unwrap();

        // one active operation per target
        let dup = Operation::new("G1", "U2", 3, vec![], now);
        assert!(matches!(
            store.create_operation(&dup, &[]),
            Err(RallyError::Conflict(_))
        ));
        assert_eq!(store.list_active_by_target("G1").unwrap().len(), 1);
        assert!(store.list_active_by_target("G2").unwrap().is_empty());

        // mutator errors leave the record untouched
        let err = store.update_operation(&op.id, &mut |o| {
            o.phase = 2;
            Err(RallyError::InvalidState("nope".into()))
        });
        assert!(err.is_err());
        assert_eq!(store.get_operation(&op.id).unwrap().unwrap().phase, 0);

        // skip writes nothing
        let same = store
            .update_operation(&op.id, &mut |o| {
                o.phase = 2;
                Ok(Commit::Skip)
            })
            .unwrap();
        assert_eq!(same.phase, 0);

        // save writes the operation and the staged messages together
        let staged = message_for(&op, 500);
        let staged_id = staged.id.clone();
        let mut staged = Some(staged);
        let updated = store
            .update_operation(&op.id, &mut |o| {
                o.phase = 1;
                Ok(Commit::Save {
                    messages: staged.take().into_iter().collect(),
                })
            })
            .unwrap();
        assert_eq!(updated.phase, 1);
        assert_eq!(store.get_operation(&op.id).unwrap().unwrap().phase, 1);
        assert!(store.get_message(&staged_id).unwrap().is_some());
        assert_eq!(store.list_messages_for_operation(&op.id).unwrap().len(), 2);

        assert!(matches!(
            store.update_operation("op-missing", &mut |_| Ok(Commit::save())),
            Err(RallyError::NotFound(_))
        ));

        // message status transitions
        let flipped = store
            .update_message(&msg.id, &mut |m| {
                m.status = MessageStatus::Ready;
                Ok(true)
            })
            .unwrap()
            .unwrap();
        assert_eq!(flipped.status, MessageStatus::Ready);
        assert_eq!(store.list_messages_by_status(MessageStatus::Ready).unwrap().len(), 1);
        assert!(store.update_message("msg-missing", &mut |_| Ok(true)).unwrap().is_none());

        assert_eq!(
            store.delete_message_in_status(&staged_id, MessageStatus::Ready).unwrap(),
            DeleteOutcome::WrongStatus(MessageStatus::Pending)
        );
        assert_eq!(
            store.delete_message_in_status(&msg.id, MessageStatus::Ready).unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete_message_in_status(&msg.id, MessageStatus::Ready).unwrap(),
            DeleteOutcome::Missing
        );

        // archive: terminal only, purges messages, appends history
        assert!(matches!(
            store.archive_operation(&updated),
            Err(RallyError::InvalidState(_))
        ));
        let mut done = updated.clone();
        done.status = OperationStatus::Completed;
        done.end_time = Some(now);
        assert_eq!(store.archive_operation(&done).unwrap(), 1);
        assert!(store.get_operation(&op.id).unwrap().is_none());
        assert!(store.list_messages_for_operation(&op.id).unwrap().is_empty());
        assert_eq!(store.get_history(&op.id).unwrap().unwrap().status, OperationStatus::Completed);
        assert_eq!(store.list_history_by_target("G1").unwrap().len(), 1);
        assert!(matches!(
            store.archive_operation(&done),
            Err(RallyError::NotFound(_))
        ));

        // target is free again
        let next = Operation::new("G1", "U1", 3, vec![], now);
        store.create_operation(&next, &[]).unwrap();
        assert!(store.remove_operation(&next.id).unwrap());
        assert!(!store.remove_operation(&next.id).unwrap());
    }

    #[test]
    fn test_memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn test_messages_ordered_by_due_time() {
        let store = MemoryStore::new();
        let op = Operation::new("G1", "U1", 2, vec![], Utc::now());
        let late = message_for(&op, 900);
        let early = message_for(&op, 100);
        store.create_operation(&op, &[late.clone(), early.clone()]).unwrap();
        let pending = store.list_messages_by_status(MessageStatus::Pending).unwrap();
        assert_eq!(pending[0].id, early.id);
        assert_eq!(pending[1].id, late.id);
    }
}

//! Resumption manager — reconciles persisted state against the clock.
//!
//! `resume()` runs once at startup, `sweep()` on every tick of the sweeper.
//! Both do the same thing: catch overdue operations up phase by phase, then
//! flip due pending messages to ready. Absolute deadlines in the store are
//! authoritative, so a restart loses nothing but latency.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use rally_core::error::Result;
use rally_core::types::{MessageStatus, Operation, OperationStatus};

use crate::engine::{CampaignEngine, FireOutcome};
use crate::phases;

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub advanced: usize,
    pub completed: usize,
    pub fired: usize,
    pub dropped: usize,
    pub waiting_operations: usize,
    pub waiting_messages: usize,
    pub errors: usize,
    /// Earliest future deadline seen, if any.
    pub next_due: Option<DateTime<Utc>>,
}

impl SweepReport {
    fn wait_until(&mut self, at: DateTime<Utc>) {
        self.next_due = Some(match self.next_due {
            Some(current) if current <= at => current,
            _ => at,
        });
    }

    pub fn is_idle(&self) -> bool {
        self.advanced == 0 && self.completed == 0 && self.fired == 0 && self.dropped == 0
    }
}

impl CampaignEngine {
    /// Startup reconciliation.
    pub fn resume(&self) -> SweepReport {
        let report = self.sweep();
        tracing::info!(
            "♻️ Resumed: {} advanced, {} completed, {} fired, {} dropped, {} op(s) and {} message(s) waiting, {} error(s)",
            report.advanced,
            report.completed,
            report.fired,
            report.dropped,
            report.waiting_operations,
            report.waiting_messages,
            report.errors
        );
        report
    }

    /// One reconciliation pass. Failures are logged and counted per
    /// operation or message; the pass itself never fails.
    pub fn sweep(&self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();

        match self.store().list_active() {
            Ok(ops) => {
                for op in ops {
                    if let Err(e) = self.catch_up(op, now, &mut report) {
                        tracing::warn!("⚠️ Sweep failed on operation: {e}");
                        report.errors += 1;
                    }
                }
            }
            Err(e) => {
                tracing::error!("❌ Sweep could not list operations: {e}");
                report.errors += 1;
            }
        }

        match self.store().list_messages_by_status(MessageStatus::Pending) {
            Ok(pending) => {
                for msg in pending {
                    match self.fire_message_at(&msg.id, now) {
                        Ok(FireOutcome::Readied) => report.fired += 1,
                        Ok(FireOutcome::Dropped) => report.dropped += 1,
                        Ok(FireOutcome::NotDue) => {
                            report.waiting_messages += 1;
                            report.wait_until(msg.scheduled_at);
                        }
                        Ok(FireOutcome::Skipped) => {}
                        Err(e) => {
                            tracing::warn!("⚠️ Firing {} failed: {e}", msg.id);
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("❌ Sweep could not list pending messages: {e}");
                report.errors += 1;
            }
        }

        if !report.is_idle() {
            tracing::debug!("🧹 Sweep: {:?}", report);
        }
        report
    }

    /// Advance `op` through every phase whose deadline has passed, each new
    /// phase starting at the previous deadline.
    fn catch_up(&self, mut op: Operation, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for _ in 0..op.max_phase {
            if !op.is_active() {
                return Ok(());
            }
            let deadline = phases::phase_deadline(&op, self.config().phase_duration_ms(op.phase))?;
            if now < deadline {
                report.waiting_operations += 1;
                report.wait_until(deadline);
                return Ok(());
            }
            if op.is_final_phase() {
                if self.config().engine.auto_complete
                    && self.terminate(&op.id, OperationStatus::Completed)?
                {
                    report.completed += 1;
                }
                return Ok(());
            }

            let from = op.phase;
            op = self.advance_from_at(&op.id, from, deadline)?;
            if op.phase == from {
                return Ok(());
            }
            report.advanced += 1;
            tracing::debug!("⏩ Caught {} up to phase {}", op.id, op.phase);
        }
        Ok(())
    }
}

/// Run `sweep()` every `interval` until `shutdown` flips to true.
pub async fn spawn_sweeper(
    engine: Arc<CampaignEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("⏰ Sweeper started (every {}ms)", interval.as_millis());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = engine.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || engine.sweep()).await {
                    tracing::error!("❌ Sweep task panicked: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("⏰ Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{FlakyStore, config, engine_with};
    use crate::persistence::SqliteStore;
    use crate::store::OperationStore;
    use rally_core::clock::ManualClock;
    use rally_core::plan::{PhasePlan, PlanStep, Recipients};
    use std::collections::HashMap;

    fn participants() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into()]
    }

    #[test]
    fn test_catch_up_two_phases_in_one_pass() {
        let (engine, clock, _store) = engine_with(config(3, 1000));
        let id = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();
        let start = engine.get_operation(&id).unwrap().start_time;

        clock.advance_ms(2500);
        let report = engine.resume();
        assert_eq!(report.advanced, 2);
        assert_eq!(report.errors, 0);

        let op = engine.get_operation(&id).unwrap();
        assert_eq!(op.phase, 2);
        assert_eq!(op.phase_start_times[&1], start + chrono::Duration::milliseconds(1000));
        assert_eq!(op.phase_start_times[&2], start + chrono::Duration::milliseconds(2000));

        // final phase: nothing more to do, and a second pass is a no-op
        let again = engine.sweep();
        assert_eq!(again.advanced, 0);
        assert_eq!(engine.get_operation(&id).unwrap().phase, 2);
    }

    #[test]
    fn test_waiting_operation_reports_deadline() {
        let (engine, clock, _store) = engine_with(config(3, 1000));
        let id = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();
        let start = engine.get_operation(&id).unwrap().start_time;

        clock.advance_ms(400);
        let report = engine.sweep();
        assert_eq!(report.advanced, 0);
        assert_eq!(report.waiting_operations, 1);
        assert_eq!(report.next_due, Some(start + chrono::Duration::milliseconds(1000)));
    }

    #[test]
    fn test_per_phase_duration_override() {
        let mut cfg = config(3, 1000);
        cfg.phases.push(PhasePlan {
            phase: 0,
            duration_ms: Some(5000),
            steps: vec![],
        });
        let (engine, clock, _store) = engine_with(cfg);
        let id = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();

        clock.advance_ms(2500);
        assert_eq!(engine.sweep().advanced, 0);
        clock.advance_ms(3000);
        assert_eq!(engine.sweep().advanced, 1);
        assert_eq!(engine.get_operation(&id).unwrap().phase, 1);
    }

    #[test]
    fn test_auto_complete_after_final_phase() {
        let mut cfg = config(2, 1000);
        cfg.engine.auto_complete = true;
        let (engine, clock, _store) = engine_with(cfg);
        let id = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();

        clock.advance_ms(1500);
        let report = engine.sweep();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.completed, 0);

        clock.advance_ms(600);
        assert_eq!(engine.sweep().completed, 1);
        assert_eq!(engine.get_status(&id).unwrap().status, OperationStatus::Completed);
        assert!(engine.list_for_target("G1").unwrap().active.is_empty());
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut cfg = config(2, 1000);
        cfg.phases.push(PhasePlan {
            phase: 0,
            duration_ms: None,
            steps: vec![PlanStep::new(Recipients::Top { k: 1 }, "join us").at(200)],
        });
        let (engine, clock, store) = engine_with(cfg);
        let id = engine
            .initiate("G1", "U1", participants(), &HashMap::new())
            .unwrap();

        clock.advance_ms(1200);
        let report = engine.resume();
        assert_eq!(report.fired, 1);

        assert_eq!(engine.get_operation(&id).unwrap().phase, 1);
        let ready = engine.get_ready_messages().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].target_id, "A");
        assert_eq!(store.list_messages_by_status(MessageStatus::Pending).unwrap().len(), 0);

        assert!(engine.confirm_delivered(&ready[0].message_id).unwrap());
        assert!(engine.get_ready_messages().unwrap().is_empty());
    }

    #[test]
    fn test_messages_of_caught_up_phase_fire_in_same_pass() {
        let mut cfg = config(3, 1000);
        cfg.phases.push(PhasePlan {
            phase: 1,
            duration_ms: None,
            steps: vec![PlanStep::new(Recipients::Target, "phase one").at(100)],
        });
        let (engine, clock, _store) = engine_with(cfg);
        engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();

        clock.advance_ms(1500);
        let report = engine.sweep();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(engine.get_ready_messages().unwrap()[0].payload, "phase one");
    }

    #[test]
    fn test_restart_resumes_from_sqlite() {
        let dir = std::env::temp_dir().join(format!("rally-resume-{}", unique_suffix()));
        std::fs::create_dir_all(&dir).unwrap();
        let db = dir.join("rally.db");

        let mut cfg = config(3, 1000);
        cfg.phases.push(PhasePlan {
            phase: 0,
            duration_ms: None,
            steps: vec![PlanStep::new(Recipients::All, "hello").at(200).stagger(5000)],
        });
        let clock = ManualClock::new(Utc::now());

        let id = {
            let store = Arc::new(SqliteStore::open(&db).unwrap());
            let engine = CampaignEngine::with_clock(store, cfg.clone(), clock.as_clock());
            engine
                .initiate("G1", "U1", participants(), &HashMap::new())
                .unwrap()
        };

        // process is gone; time passes
        clock.advance_ms(2500);
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let engine = CampaignEngine::with_clock(store, cfg, clock.as_clock());
        let report = engine.resume();

        assert_eq!(report.advanced, 2);
        assert_eq!(report.fired, 1);
        assert_eq!(report.waiting_messages, 2);
        assert_eq!(engine.get_operation(&id).unwrap().phase, 2);
        assert_eq!(engine.get_ready_messages().unwrap().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_one_failing_operation_does_not_stall_the_rest() {
        let store = Arc::new(FlakyStore::new());
        let clock = ManualClock::new(Utc::now());
        let engine = CampaignEngine::with_clock(store.clone(), config(3, 1000), clock.as_clock());
        let broken = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();
        let healthy = engine.initiate("G2", "U1", vec![], &HashMap::new()).unwrap();
        store.fail_operation(&broken);

        clock.advance_ms(1500);
        let report = engine.sweep();
        assert_eq!(report.errors, 1);
        assert_eq!(report.advanced, 1);
        assert_eq!(engine.get_operation(&healthy).unwrap().phase, 1);
        assert_eq!(engine.get_operation(&broken).unwrap().phase, 0);
    }

    #[test]
    fn test_out_of_range_duration_is_counted_not_fatal() {
        for duration_ms in [100_000_000_000_000_000, u64::MAX] {
            let (engine, clock, _store) = engine_with(config(3, duration_ms));
            let id = engine.initiate("G1", "U1", vec![], &HashMap::new()).unwrap();

            clock.advance_ms(5000);
            let report = engine.sweep();
            assert_eq!(report.errors, 1);
            assert_eq!(report.advanced, 0);
            assert_eq!(engine.get_operation(&id).unwrap().phase, 0);
        }
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (engine, _clock, _store) = engine_with(config(3, 1000));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(spawn_sweeper(
            Arc::new(engine),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    fn unique_suffix() -> String {
        format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }
}

pub mod spec;
pub mod tasks;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::TaskDurations;
use crate::error::{AppError, Result};
use crate::state::task_board::{TaskBoard, TaskSnapshot, TaskStatus};
use crate::types::RunSummary;

use self::spec::{resolve_order, TaskKind, TaskSpec};
use self::tasks::{BlockSignal, ScheduledTask};

struct Entry {
    spec: TaskSpec,
    task: Arc<dyn ScheduledTask>,
    status: TaskStatus,
    last_run_at: Option<Instant>,
    last_result: Option<bool>,
    snapshot: TaskSnapshot,
}

impl Entry {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.spec.interval,
        }
    }
}

/// Cooperative ticker over a resolved task graph. Each tick runs the due
/// tasks one after another in dependency order.
pub struct TaskScheduler {
    entries: Vec<Entry>,
    signal: Arc<BlockSignal>,
    board: Arc<TaskBoard>,
    durations: Arc<TaskDurations>,
    health: Arc<HealthState>,
    timeout: Duration,
    has_block_consumer: bool,
}

impl TaskScheduler {
    /// Fails with `Configuration` on unknown dependencies, cycles or duplicate names.
    pub fn new(
        specs: Vec<TaskSpec>,
        signal: Arc<BlockSignal>,
        board: Arc<TaskBoard>,
        durations: Arc<TaskDurations>,
        health: Arc<HealthState>,
        timeout: Duration,
        mut build: impl FnMut(&TaskSpec) -> Arc<dyn ScheduledTask>,
    ) -> Result<Self> {
        let ordered = resolve_order(specs)?;
        let mut entries = Vec::with_capacity(ordered.len());
        for (order, spec) in ordered.into_iter().enumerate() {
            let task = build(&spec);
            if task.kind() != spec.kind {
                return Err(AppError::Configuration(format!(
                    "task '{}' declared as {} but built as {}",
                    spec.name,
                    spec.kind,
                    task.kind()
                )));
            }
            let snapshot = TaskSnapshot {
                order,
                name: spec.name.clone(),
                kind: spec.kind,
                interval_secs: spec.interval.as_secs(),
                depends_on: spec.depends_on.clone(),
                status: TaskStatus::Idle,
                last_run_at: None,
                last_result: None,
                last_error: None,
                last_duration_ms: None,
                runs: 0,
                failures: 0,
            };
            board.publish(snapshot.clone());
            info!(
                task = %spec.name,
                kind = %spec.kind,
                interval_secs = spec.interval.as_secs(),
                depends_on = spec.depends_on.as_deref().unwrap_or("-"),
                "task scheduled"
            );
            entries.push(Entry {
                spec,
                task,
                status: TaskStatus::Idle,
                last_run_at: None,
                last_result: None,
                snapshot,
            });
        }
        let has_block_consumer = entries.iter().any(|e| e.task.consumes_new_blocks());

        Ok(Self {
            entries,
            signal,
            board,
            durations,
            health,
            timeout,
            has_block_consumer,
        })
    }

    fn result_of(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.spec.name == name)
            .and_then(|e| e.last_result)
    }

    /// One pass over every task. Interval due-ness is fixed at the start of
    /// the tick; the dependency gate is checked right before each run.
    pub async fn tick(&mut self, now: Instant) -> RunSummary {
        let mut summary = RunSummary::default();
        let due: Vec<bool> = self.entries.iter().map(|e| e.is_due(now)).collect();

        for i in 0..self.entries.len() {
            if !due[i] {
                continue;
            }
            if self.entries[i].status == TaskStatus::Running {
                debug!(task = %self.entries[i].spec.name, "still running, due signal dropped");
                continue;
            }
            self.entries[i].status = TaskStatus::Due;

            if let Some(dep) = self.entries[i].spec.depends_on.clone() {
                if self.result_of(&dep) != Some(true) {
                    debug!(task = %self.entries[i].spec.name, dependency = %dep, "dependency not satisfied");
                    self.entries[i].status = TaskStatus::Idle;
                    continue;
                }
            }

            let outcome = self.execute(i, now).await;
            match outcome {
                Ok(_) => summary.record_success(),
                Err(e) => summary.record_failure(self.entries[i].spec.name.clone(), e),
            }
        }

        self.health.record_tick(unix_now(), summary.failed == 0);
        self.health.set_chain_tip(self.signal.last_tip());
        if let Ok(Some(height)) = self.signal.cursor().await {
            self.health.set_cursor_height(height);
        }
        summary
    }

    async fn execute(&mut self, i: usize, now: Instant) -> Result<bool> {
        let has_block_consumer = self.has_block_consumer;
        let entry = &mut self.entries[i];
        let name = entry.spec.name.clone();

        entry.status = TaskStatus::Running;
        entry.last_run_at = Some(now);
        self.board.set_status(&name, TaskStatus::Running);
        info!(task = %name, kind = %entry.spec.kind, "task starting");

        let started = Instant::now();
        let mut outcome = match tokio::time::timeout(self.timeout, entry.task.run()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::TaskTimeout(name.clone())),
        };
        let elapsed = started.elapsed();
        self.durations.record(&name, elapsed);

        // Cursor commits: after the consumer of new blocks succeeds, or right
        // away when nothing consumes them.
        if let Ok(result) = outcome {
            let commit = if entry.task.consumes_new_blocks() {
                true
            } else {
                entry.spec.kind == TaskKind::CheckBlocks && result && !has_block_consumer
            };
            if commit {
                if let Err(e) = self.signal.commit().await {
                    outcome = Err(e);
                }
            }
        }

        entry.last_result = Some(matches!(outcome, Ok(true)));
        entry.status = match &outcome {
            Ok(_) => TaskStatus::Succeeded,
            Err(_) => TaskStatus::Failed,
        };

        let snap = &mut entry.snapshot;
        snap.status = entry.status;
        snap.last_run_at = Some(unix_now() as i64);
        snap.last_result = entry.last_result;
        snap.last_duration_ms = Some(elapsed.as_millis() as u64);
        snap.runs += 1;
        match &outcome {
            Ok(result) => {
                snap.last_error = None;
                info!(task = %name, result, duration_ms = elapsed.as_millis() as u64, "task succeeded");
            }
            Err(e) => {
                snap.failures += 1;
                snap.last_error = Some(e.to_string());
                error!(task = %name, error = %e, duration_ms = elapsed.as_millis() as u64, "task failed");
            }
        }
        self.board.publish(snap.clone());
        entry.status = TaskStatus::Idle;
        outcome
    }

    /// Ticks forever. Ticks missed while a slow task runs are skipped, not queued.
    pub async fn run(mut self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let summary = self.tick(Instant::now()).await;
            if summary.is_partial() {
                warn!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    failures = ?summary.failures,
                    "tick finished with failures"
                );
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

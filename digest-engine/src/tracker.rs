use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    EngineError, Result, RunOutcome, StageCounts, StageName, StageStatus, TaskRun,
};

/// Events pushed to interested observers (the UI collaborator subscribes to
/// these instead of polling).
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    RunStarted { task_id: Uuid, run_id: Uuid },
    RunFinished { task_id: Uuid, run_id: Uuid, outcome: RunOutcome },
    StageUpdated { run_id: Uuid, stage: StageName, status: StageStatus },
    /// A trigger was suppressed, e.g. "already running" or "suspended:
    /// invalid cadence". Suppressions are reported, never silently dropped.
    RunSkipped { task_id: Uuid, reason: String },
    RecipientUnsubscribed { address: String, task_id: Option<Uuid> },
}

struct TrackerInner {
    runs: HashMap<Uuid, TaskRun>,
    /// Insertion order for bounded history eviction.
    order: VecDeque<Uuid>,
    /// Per-task exclusive marker: task id -> run id currently in progress.
    in_progress: HashMap<Uuid, Uuid>,
    capacity: usize,
}

/// Append-only record of every task run and its stages.
///
/// All transitions are monotonic; a terminal run is never mutated again, so
/// concurrent readers always observe a coherent record. The in-progress map
/// doubles as the scheduler's at-most-one-run-per-task guard: `try_begin_run`
/// checks and claims it under a single write lock.
pub struct StatusTracker {
    inner: RwLock<TrackerInner>,
    events: broadcast::Sender<TrackerEvent>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: RwLock::new(TrackerInner {
                runs: HashMap::new(),
                order: VecDeque::new(),
                in_progress: HashMap::new(),
                capacity,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TrackerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Claim the exclusive run slot for a task and create a `Pending` run.
    /// Returns `None` (and reports a skip) when a run is already in
    /// progress.
    pub async fn try_begin_run(&self, task_id: Uuid, task_name: &str) -> Option<Uuid> {
        let run_id = {
            let mut inner = self.inner.write().await;
            if inner.in_progress.contains_key(&task_id) {
                drop(inner);
                self.record_skip(task_id, "skipped: already running").await;
                return None;
            }

            let run_id = Uuid::new_v4();
            let run = TaskRun::new(run_id, task_id, task_name.to_string(), Utc::now());
            inner.runs.insert(run_id, run);
            inner.order.push_back(run_id);
            inner.in_progress.insert(task_id, run_id);
            Self::evict(&mut inner);
            run_id
        };

        debug!("run {} created for task {}", run_id, task_id);
        self.emit(TrackerEvent::RunStarted { task_id, run_id });
        Some(run_id)
    }

    fn evict(inner: &mut TrackerInner) {
        while inner.order.len() > inner.capacity {
            let Some(oldest) = inner.order.front().copied() else {
                break;
            };
            let evictable = inner
                .runs
                .get(&oldest)
                .map(|r| r.outcome.is_terminal())
                .unwrap_or(true);
            if !evictable {
                break;
            }
            inner.order.pop_front();
            inner.runs.remove(&oldest);
        }
    }

    /// Report a suppressed trigger.
    pub async fn record_skip(&self, task_id: Uuid, reason: &str) {
        info!("task {}: {}", task_id, reason);
        self.emit(TrackerEvent::RunSkipped {
            task_id,
            reason: reason.to_string(),
        });
    }

    pub async fn mark_running(&self, run_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| EngineError::General(format!("unknown run {}", run_id)))?;
        advance_run(run, RunOutcome::Running)
    }

    /// Transition a run to a terminal outcome and release the task's
    /// exclusive slot. Returns a snapshot of the finished record for
    /// persistence.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        error: Option<String>,
    ) -> Result<TaskRun> {
        let (task_id, snapshot) = {
            let mut inner = self.inner.write().await;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| EngineError::General(format!("unknown run {}", run_id)))?;
            if !outcome.is_terminal() {
                return Err(EngineError::General(format!(
                    "finish_run called with non-terminal outcome {}",
                    outcome
                )));
            }
            advance_run(run, outcome)?;
            run.ended_at = Some(Utc::now());
            run.error = error;
            let snapshot = run.clone();
            let task_id = run.task_id;
            inner.in_progress.remove(&task_id);
            (task_id, snapshot)
        };

        info!("run {} for task {} finished: {}", run_id, task_id, outcome);
        self.emit(TrackerEvent::RunFinished {
            task_id,
            run_id,
            outcome,
        });
        Ok(snapshot)
    }

    pub async fn stage_running(&self, run_id: Uuid, stage: StageName) -> Result<()> {
        self.update_stage(run_id, stage, StageStatus::Running, None, None, Vec::new())
            .await
    }

    pub async fn stage_completed(
        &self,
        run_id: Uuid,
        stage: StageName,
        counts: StageCounts,
        detail: Vec<String>,
    ) -> Result<()> {
        self.update_stage(run_id, stage, StageStatus::Completed, None, Some(counts), detail)
            .await
    }

    pub async fn stage_failed(&self, run_id: Uuid, stage: StageName, error: &str) -> Result<()> {
        self.update_stage(
            run_id,
            stage,
            StageStatus::Failed,
            Some(error.to_string()),
            None,
            Vec::new(),
        )
        .await
    }

    pub async fn stage_skipped(&self, run_id: Uuid, stage: StageName, reason: &str) -> Result<()> {
        self.update_stage(
            run_id,
            stage,
            StageStatus::Skipped,
            Some(reason.to_string()),
            None,
            Vec::new(),
        )
        .await
    }

    async fn update_stage(
        &self,
        run_id: Uuid,
        stage: StageName,
        status: StageStatus,
        error: Option<String>,
        counts: Option<StageCounts>,
        detail: Vec<String>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| EngineError::General(format!("unknown run {}", run_id)))?;
            if run.outcome.is_terminal() {
                return Err(EngineError::General(format!(
                    "run {} is terminal, stage records are immutable",
                    run_id
                )));
            }
            let record = run.stage_mut(stage);
            if !record.status.can_advance_to(status) {
                return Err(EngineError::General(format!(
                    "stage {} cannot move {:?} -> {:?}",
                    stage, record.status, status
                )));
            }
            let now = Utc::now();
            match status {
                StageStatus::Running => record.started_at = Some(now),
                _ => record.ended_at = Some(now),
            }
            record.status = status;
            if let Some(counts) = counts {
                record.counts = counts;
            }
            if error.is_some() {
                record.error = error;
            }
            if !detail.is_empty() {
                record.detail = detail;
            }
        }
        self.emit(TrackerEvent::StageUpdated {
            run_id,
            stage,
            status,
        });
        Ok(())
    }

    /// Advisory cancellation: marks the run; the pipeline checks the flag
    /// between stages. Returns false if the run is already terminal.
    pub async fn request_cancel(&self, run_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        match inner.runs.get_mut(&run_id) {
            Some(run) if !run.outcome.is_terminal() => {
                run.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub async fn cancel_requested(&self, run_id: Uuid) -> bool {
        let inner = self.inner.read().await;
        inner
            .runs
            .get(&run_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    /// Watcher visibility: surfaces processed unsubscribe requests.
    pub async fn record_unsubscribe(&self, address: &str, task_id: Option<Uuid>) {
        info!("recipient {} unsubscribed (task: {:?})", address, task_id);
        self.emit(TrackerEvent::RecipientUnsubscribed {
            address: address.to_string(),
            task_id,
        });
    }

    // Read-only query surface.

    pub async fn run(&self, run_id: Uuid) -> Option<TaskRun> {
        self.inner.read().await.runs.get(&run_id).cloned()
    }

    pub async fn latest_run(&self, task_id: Uuid) -> Option<TaskRun> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.runs.get(id))
            .find(|run| run.task_id == task_id)
            .cloned()
    }

    pub async fn history(&self, task_id: Uuid, limit: usize) -> Vec<TaskRun> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.runs.get(id))
            .filter(|run| run.task_id == task_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn in_progress(&self) -> Vec<(Uuid, Uuid)> {
        let inner = self.inner.read().await;
        inner.in_progress.iter().map(|(t, r)| (*t, *r)).collect()
    }

    pub async fn is_in_progress(&self, task_id: Uuid) -> bool {
        self.inner.read().await.in_progress.contains_key(&task_id)
    }

    /// Reload terminal run records (e.g. from the store) at startup.
    pub async fn preload(&self, runs: Vec<TaskRun>) {
        let mut inner = self.inner.write().await;
        // Oldest first so eviction order stays correct.
        let mut sorted = runs;
        sorted.sort_by_key(|r| r.started_at);
        for run in sorted.into_iter().filter(|r| r.outcome.is_terminal()) {
            if inner.runs.contains_key(&run.run_id) {
                continue;
            }
            inner.order.push_back(run.run_id);
            inner.runs.insert(run.run_id, run);
        }
        Self::evict(&mut inner);
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn advance_run(run: &mut TaskRun, next: RunOutcome) -> Result<()> {
    if !run.outcome.can_advance_to(next) {
        return Err(EngineError::General(format!(
            "run {} cannot move {} -> {}",
            run.run_id, run.outcome, next
        )));
    }
    run.outcome = next;
    Ok(())
}

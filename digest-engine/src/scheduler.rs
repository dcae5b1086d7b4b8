use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use interfaces::{ConfigStore, Task};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cadence::Cadence;
use crate::pipeline::{execute_run, PipelineDeps};
use crate::types::{EngineError, Result};

struct ScheduledTask {
    task: Task,
    cadence: Cadence,
    /// Start time of the most recent run; next-run times are computed from
    /// it, so a failed run does not retry in a tight loop.
    last_run_started: Option<DateTime<Utc>>,
    /// Set when the definition failed validation. Automatic triggers stay
    /// off until the task is re-registered with a corrected definition.
    suspended: Option<String>,
}

/// Owns the set of registered tasks, computes next-run times, and launches
/// one worker per triggered run.
///
/// The at-most-one-run-per-task guard lives in the tracker
/// (`try_begin_run`), so concurrent `tick` and `run_now` calls cannot race
/// a second run into existence; the loser is reported as skipped.
pub struct Scheduler {
    deps: Arc<PipelineDeps>,
    tasks: RwLock<HashMap<Uuid, ScheduledTask>>,
    workers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    /// When present, each trigger re-snapshots the task definition from the
    /// configuration collaborator, so recipient changes (e.g. unsubscribes)
    /// apply to the next run without re-registration.
    config: Option<Arc<dyn ConfigStore>>,
}

impl Scheduler {
    pub fn new(deps: PipelineDeps) -> Self {
        Self::build(deps, None)
    }

    pub fn with_config(deps: PipelineDeps, config: Arc<dyn ConfigStore>) -> Self {
        Self::build(deps, Some(config))
    }

    fn build(deps: PipelineDeps, config: Option<Arc<dyn ConfigStore>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            deps: Arc::new(deps),
            tasks: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            shutdown_tx,
            config,
        }
    }

    pub fn deps(&self) -> &Arc<PipelineDeps> {
        &self.deps
    }

    /// Register (or replace) a task definition. A definition that fails
    /// validation is kept but suspended: it never triggers automatically
    /// until a corrected registration replaces it.
    pub async fn register(&self, task: Task) -> Result<()> {
        let validation = self.validate(&task);
        let mut tasks = self.tasks.write().await;
        let last_run_started = tasks.get(&task.id).and_then(|t| t.last_run_started);

        match validation {
            Ok(cadence) => {
                info!("registered task '{}' ({})", task.name, task.id);
                tasks.insert(
                    task.id,
                    ScheduledTask {
                        task,
                        cadence,
                        last_run_started,
                        suspended: None,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("task '{}' suspended: {}", task.name, reason);
                let task_id = task.id;
                // Any valid placeholder cadence works; a suspended task
                // never consults it.
                let cadence = Cadence::Every(chrono::Duration::hours(1));
                tasks.insert(
                    task_id,
                    ScheduledTask {
                        task,
                        cadence,
                        last_run_started,
                        suspended: Some(reason.clone()),
                    },
                );
                drop(tasks);
                self.deps
                    .tracker
                    .record_skip(task_id, &format!("suspended: {}", reason))
                    .await;
                Err(e)
            }
        }
    }

    fn validate(&self, task: &Task) -> Result<Cadence> {
        if task.name.trim().is_empty() {
            return Err(EngineError::Configuration("task name is empty".to_string()));
        }
        if self.deps.ai.get(&task.ai.backend).is_none() {
            return Err(EngineError::Configuration(format!(
                "unknown AI backend '{}'",
                task.ai.backend
            )));
        }
        Cadence::compile(&task.cadence)
    }

    pub async fn unregister(&self, task_id: Uuid) -> bool {
        let removed = self.tasks.write().await.remove(&task_id).is_some();
        if removed {
            info!("unregistered task {}", task_id);
        }
        removed
    }

    /// Evaluate every enabled task and start those that are due. A task
    /// whose computed next-run is in the past runs exactly once (the trigger
    /// re-bases `last_run_started`), so restarts cause a single catch-up run
    /// rather than a storm.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.reap_workers().await;

        let due: Vec<Uuid> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|st| st.task.enabled && st.suspended.is_none())
                .filter(|st| st.cadence.next_run(st.last_run_started, now) <= now)
                .map(|st| st.task.id)
                .collect()
        };

        for task_id in due {
            self.trigger(task_id, now).await;
        }
    }

    /// Manual trigger from the UI collaborator. Subject to the same
    /// in-progress guard as `tick`; a suppressed trigger is reported, not
    /// silently dropped.
    pub async fn run_now(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        let suspended = {
            let tasks = self.tasks.read().await;
            let st = tasks
                .get(&task_id)
                .ok_or_else(|| EngineError::General(format!("unknown task {}", task_id)))?;
            st.suspended.clone()
        };
        if let Some(reason) = suspended {
            return Err(EngineError::Configuration(format!(
                "task is suspended: {}",
                reason
            )));
        }
        Ok(self.trigger(task_id, Utc::now()).await)
    }

    /// Advisory cancellation of a running run.
    pub async fn cancel(&self, run_id: Uuid) -> bool {
        self.deps.tracker.request_cancel(run_id).await
    }

    /// The next time this task would fire, for UI display.
    pub async fn next_run_time(&self, task_id: Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tasks = self.tasks.read().await;
        let st = tasks.get(&task_id)?;
        if !st.task.enabled || st.suspended.is_some() {
            return None;
        }
        Some(st.cadence.next_run(st.last_run_started, now))
    }

    async fn trigger(&self, task_id: Uuid, now: DateTime<Utc>) -> Option<Uuid> {
        // Snapshot the definition at run start: mid-run config edits never
        // affect a running pipeline.
        let (mut task, since) = {
            let tasks = self.tasks.read().await;
            let st = tasks.get(&task_id)?;
            (st.task.clone(), st.last_run_started)
        };

        if let Some(config) = &self.config {
            match config.tasks().await {
                Ok(tasks) => {
                    if let Some(fresh) = tasks.into_iter().find(|t| t.id == task_id) {
                        task = fresh;
                    }
                }
                Err(e) => warn!(
                    "could not refresh task {} from configuration, using registered definition: {}",
                    task_id, e
                ),
            }
        }
        if !task.enabled {
            self.deps
                .tracker
                .record_skip(task_id, "skipped: disabled in configuration")
                .await;
            return None;
        }

        let run_id = self.deps.tracker.try_begin_run(task.id, &task.name).await?;

        {
            let mut tasks = self.tasks.write().await;
            if let Some(st) = tasks.get_mut(&task_id) {
                st.last_run_started = Some(now);
            }
        }

        let deps = Arc::clone(&self.deps);
        let handle = tokio::spawn(async move {
            execute_run(&deps, &task, run_id, since).await;
        });
        self.workers.lock().await.insert(run_id, handle);
        Some(run_id)
    }

    async fn reap_workers(&self) {
        self.workers.lock().await.retain(|_, handle| !handle.is_finished());
    }

    /// Periodic driver for `tick`.
    pub fn spawn_loop(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = scheduler.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick(Utc::now()).await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("scheduling loop stopped");
        })
    }

    /// Stop the scheduling loop, ask in-progress runs to wind down at their
    /// next stage boundary, and wait up to `drain_timeout` for them.
    /// Workers still running after the deadline are aborted.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(true);

        for (_, run_id) in self.deps.tracker.in_progress().await {
            self.deps.tracker.request_cancel(run_id).await;
        }

        let mut handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }

        info!("draining {} in-progress run(s)", handles.len());
        let drain = futures::future::join_all(handles.iter_mut());
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!("drain timed out, aborting remaining workers");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

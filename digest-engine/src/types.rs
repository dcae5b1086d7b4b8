use chrono::{DateTime, Utc};
use interfaces::CollaboratorError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Lifecycle of one task run. Transitions are strictly forward:
/// `Pending -> Running -> {Succeeded, PartiallyFailed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunOutcome::Succeeded | RunOutcome::PartiallyFailed | RunOutcome::Failed
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    /// `Pending -> Failed` covers runs that die before their first stage
    /// (pre-flight errors); success always passes through `Running`.
    pub fn can_advance_to(&self, next: RunOutcome) -> bool {
        match (self, next) {
            (RunOutcome::Pending, RunOutcome::Running) => true,
            (RunOutcome::Pending, RunOutcome::Failed) => true,
            (RunOutcome::Running, n) if n.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Pending => "pending",
            RunOutcome::Running => "running",
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartiallyFailed => "partially_failed",
            RunOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one stage within a run.
/// `NotStarted -> Running -> {Completed, Failed}`, or `NotStarted -> Skipped`
/// when an earlier stage failed or the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn can_advance_to(&self, next: StageStatus) -> bool {
        match (self, next) {
            (StageStatus::NotStarted, StageStatus::Running) => true,
            (StageStatus::NotStarted, StageStatus::Skipped) => true,
            (StageStatus::Running, StageStatus::Completed) => true,
            (StageStatus::Running, StageStatus::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Fetch,
    Summarize,
    Assemble,
    Deliver,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Fetch,
        StageName::Summarize,
        StageName::Assemble,
        StageName::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Fetch => "fetch",
            StageName::Summarize => "summarize",
            StageName::Assemble => "assemble",
            StageName::Deliver => "deliver",
        }
    }

    fn index(&self) -> usize {
        match self {
            StageName::Fetch => 0,
            StageName::Summarize => 1,
            StageName::Assemble => 2,
            StageName::Deliver => 3,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage counters. Each stage fills the fields it owns and leaves the
/// rest at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub fetched: u64,
    pub new_articles: u64,
    pub sources_failed: u64,
    pub excluded_by_tag: u64,
    pub summarized: u64,
    pub summarize_failed: u64,
    pub digests: u64,
    pub delivered: u64,
    pub deliveries_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub counts: StageCounts,
    /// Human-readable per-sub-unit notes ("source xyz: timed out",
    /// "bob@example.com: delivery failed").
    pub detail: Vec<String>,
}

impl StageRecord {
    fn new(stage: StageName) -> Self {
        Self {
            stage,
            status: StageStatus::NotStarted,
            started_at: None,
            ended_at: None,
            error: None,
            counts: StageCounts::default(),
            detail: Vec::new(),
        }
    }
}

/// One execution of a task. Owned exclusively by the status tracker;
/// immutable once the outcome is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl TaskRun {
    pub fn new(run_id: Uuid, task_id: Uuid, task_name: String, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            task_id,
            task_name,
            started_at: now,
            ended_at: None,
            outcome: RunOutcome::Pending,
            error: None,
            stages: StageName::ALL.iter().map(|s| StageRecord::new(*s)).collect(),
            cancel_requested: false,
        }
    }

    pub fn stage(&self, name: StageName) -> &StageRecord {
        &self.stages[name.index()]
    }

    pub(crate) fn stage_mut(&mut self, name: StageName) -> &mut StageRecord {
        &mut self.stages[name.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_outcome_transitions_are_monotonic() {
        use RunOutcome::*;
        assert!(Pending.can_advance_to(Running));
        assert!(Running.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(PartiallyFailed));
        assert!(Running.can_advance_to(Failed));

        assert!(Pending.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Succeeded));
        assert!(!Succeeded.can_advance_to(Running));
        assert!(!Failed.can_advance_to(Succeeded));
        assert!(!Running.can_advance_to(Pending));
    }

    #[test]
    fn stage_status_transitions() {
        use StageStatus::*;
        assert!(NotStarted.can_advance_to(Running));
        assert!(NotStarted.can_advance_to(Skipped));
        assert!(Running.can_advance_to(Completed));
        assert!(Running.can_advance_to(Failed));

        assert!(!Running.can_advance_to(Skipped));
        assert!(!Completed.can_advance_to(Running));
        assert!(!Skipped.can_advance_to(Running));
    }

    #[test]
    fn new_run_has_all_stages_not_started() {
        let run = TaskRun::new(Uuid::new_v4(), Uuid::new_v4(), "t".into(), Utc::now());
        assert_eq!(run.stages.len(), 4);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::NotStarted));
        assert_eq!(run.stage(StageName::Deliver).stage, StageName::Deliver);
    }
}

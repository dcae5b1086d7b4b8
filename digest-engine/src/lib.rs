pub mod ai;
pub mod cadence;
pub mod config;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod sources;
pub mod stages;
pub mod store;
pub mod tracker;
pub mod types;
pub mod watcher;

pub use ai::{AiRegistry, KeywordBackend};
pub use cadence::Cadence;
pub use pipeline::{PipelineDeps, RetryPolicies};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use store::ArticleStore;
pub use tracker::{StatusTracker, TrackerEvent};
pub use types::{EngineError, RunOutcome, StageName, StageStatus, TaskRun};
pub use watcher::UnsubscribeWatcher;

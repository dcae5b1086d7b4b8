use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use interfaces::{EmailTransport, FeedSource, Task};
use tracing::error;
use uuid::Uuid;

use crate::ai::AiRegistry;
use crate::retry::RetryPolicy;
use crate::stages::assemble::assemble_digests;
use crate::stages::deliver::run_deliver;
use crate::stages::fetch::run_fetch;
use crate::stages::summarize::run_summarize;
use crate::store::ArticleStore;
use crate::tracker::StatusTracker;
use crate::types::{Result, RunOutcome, StageCounts, StageName};

/// Retry budgets per collaborator class.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    pub fetch: RetryPolicy,
    pub ai: RetryPolicy,
    pub send: RetryPolicy,
}

/// Everything a task run needs. Shared by the scheduler and handed to each
/// worker.
pub struct PipelineDeps {
    pub sources: HashMap<String, Arc<dyn FeedSource>>,
    pub ai: Arc<AiRegistry>,
    pub transport: Arc<dyn EmailTransport>,
    pub store: Arc<ArticleStore>,
    pub tracker: Arc<StatusTracker>,
    pub retry: RetryPolicies,
}

/// Execute one task run end to end: fetch -> summarize -> assemble ->
/// deliver, updating the tracker at every step.
///
/// `task` is the definition snapshot taken at trigger time; configuration
/// edits made while the run executes are invisible to it. The advisory
/// cancel flag is checked between stages, never mid-call. This function
/// always drives the run to a terminal outcome.
pub async fn execute_run(
    deps: &PipelineDeps,
    task: &Task,
    run_id: Uuid,
    since: Option<DateTime<Utc>>,
) -> RunOutcome {
    match drive(deps, task, run_id, since).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Store or tracker trouble: the run cannot be trusted to have
            // done its work. Fail it loudly but keep the scheduler alive.
            error!("run {} for task '{}' aborted: {}", run_id, task.name, e);
            let _ = finish(deps, run_id, RunOutcome::Failed, Some(e.to_string())).await;
            RunOutcome::Failed
        }
    }
}

async fn drive(
    deps: &PipelineDeps,
    task: &Task,
    run_id: Uuid,
    since: Option<DateTime<Utc>>,
) -> Result<RunOutcome> {
    let tracker = &deps.tracker;
    tracker.mark_running(run_id).await?;
    let mut partial = false;

    // The backend is resolved from configuration before any work happens.
    let Some(backend) = deps.ai.get(&task.ai.backend) else {
        let msg = format!("unknown AI backend '{}'", task.ai.backend);
        for stage in StageName::ALL {
            tracker.stage_skipped(run_id, stage, &msg).await?;
        }
        return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
    };

    // ── Fetch ──────────────────────────────────────────────────────────
    tracker.stage_running(run_id, StageName::Fetch).await?;
    let fetch = match run_fetch(task, &deps.sources, &deps.store, &deps.retry.fetch, since).await {
        Ok(fetch) => fetch,
        Err(e) => {
            let msg = e.to_string();
            tracker.stage_failed(run_id, StageName::Fetch, &msg).await?;
            skip_stages(deps, run_id, &StageName::ALL[1..], "fetch failed").await?;
            return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
        }
    };

    if fetch.all_sources_failed() {
        let msg = format!(
            "all {} feed sources failed: {}",
            fetch.sources_attempted,
            fetch.detail().join("; ")
        );
        tracker.stage_failed(run_id, StageName::Fetch, &msg).await?;
        skip_stages(deps, run_id, &StageName::ALL[1..], "fetch failed").await?;
        return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
    }

    partial |= !fetch.failures.is_empty();
    tracker
        .stage_completed(
            run_id,
            StageName::Fetch,
            StageCounts {
                fetched: fetch.fetched,
                new_articles: fetch.articles.len() as u64,
                sources_failed: fetch.failures.len() as u64,
                ..Default::default()
            },
            fetch.detail(),
        )
        .await?;

    if check_cancelled(deps, task, run_id, &StageName::ALL[1..]).await? {
        return finish(
            deps,
            run_id,
            RunOutcome::Failed,
            Some("cancelled by request".to_string()),
        )
        .await;
    }

    // ── Filter / Summarize ─────────────────────────────────────────────
    tracker.stage_running(run_id, StageName::Summarize).await?;
    let summarize = match run_summarize(
        task,
        fetch.articles,
        backend.as_ref(),
        &deps.store,
        &deps.retry.ai,
    )
    .await
    {
        Ok(summarize) => summarize,
        Err(e) => {
            let msg = e.to_string();
            tracker.stage_failed(run_id, StageName::Summarize, &msg).await?;
            skip_stages(deps, run_id, &StageName::ALL[2..], "summarize failed").await?;
            return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
        }
    };

    if summarize.all_batches_failed() {
        let msg = format!("all {} AI batches failed", summarize.batches_total);
        tracker.stage_failed(run_id, StageName::Summarize, &msg).await?;
        skip_stages(deps, run_id, &StageName::ALL[2..], "summarize failed").await?;
        return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
    }

    partial |= summarize.batches_failed > 0 || summarize.summarize_failed > 0;
    tracker
        .stage_completed(
            run_id,
            StageName::Summarize,
            StageCounts {
                excluded_by_tag: summarize.excluded_by_tag,
                summarized: summarize.summarized,
                summarize_failed: summarize.summarize_failed,
                ..Default::default()
            },
            Vec::new(),
        )
        .await?;

    if check_cancelled(deps, task, run_id, &StageName::ALL[2..]).await? {
        return finish(
            deps,
            run_id,
            RunOutcome::Failed,
            Some("cancelled by request".to_string()),
        )
        .await;
    }

    // ── Assemble ───────────────────────────────────────────────────────
    tracker.stage_running(run_id, StageName::Assemble).await?;
    let digests = assemble_digests(task, &summarize.processed, Utc::now());
    tracker
        .stage_completed(
            run_id,
            StageName::Assemble,
            StageCounts {
                digests: digests.len() as u64,
                ..Default::default()
            },
            Vec::new(),
        )
        .await?;

    if check_cancelled(deps, task, run_id, &StageName::ALL[3..]).await? {
        return finish(
            deps,
            run_id,
            RunOutcome::Failed,
            Some("cancelled by request".to_string()),
        )
        .await;
    }

    // ── Deliver ────────────────────────────────────────────────────────
    tracker.stage_running(run_id, StageName::Deliver).await?;
    let deliver = run_deliver(&digests, deps.transport.as_ref(), &deps.retry.send).await;

    if deliver.all_deliveries_failed() {
        let msg = format!(
            "all {} deliveries failed: {}",
            deliver.attempted,
            deliver.detail().join("; ")
        );
        tracker.stage_failed(run_id, StageName::Deliver, &msg).await?;
        return finish(deps, run_id, RunOutcome::Failed, Some(msg)).await;
    }

    partial |= !deliver.failures.is_empty();
    tracker
        .stage_completed(
            run_id,
            StageName::Deliver,
            StageCounts {
                digests: digests.len() as u64,
                delivered: deliver.delivered,
                deliveries_failed: deliver.failures.len() as u64,
                ..Default::default()
            },
            deliver.detail(),
        )
        .await?;

    let outcome = if partial {
        RunOutcome::PartiallyFailed
    } else {
        RunOutcome::Succeeded
    };
    finish(deps, run_id, outcome, None).await
}

/// Check the advisory cancel flag between stages; on cancellation mark the
/// remaining stages skipped.
async fn check_cancelled(
    deps: &PipelineDeps,
    task: &Task,
    run_id: Uuid,
    remaining: &[StageName],
) -> Result<bool> {
    if !deps.tracker.cancel_requested(run_id).await {
        return Ok(false);
    }
    tracing::info!("run {} for task '{}' cancelled by request", run_id, task.name);
    skip_stages(deps, run_id, remaining, "cancelled by request").await?;
    Ok(true)
}

async fn skip_stages(
    deps: &PipelineDeps,
    run_id: Uuid,
    stages: &[StageName],
    reason: &str,
) -> Result<()> {
    for stage in stages {
        deps.tracker.stage_skipped(run_id, *stage, reason).await?;
    }
    Ok(())
}

/// Drive the run to its terminal outcome and persist the record.
async fn finish(
    deps: &PipelineDeps,
    run_id: Uuid,
    outcome: RunOutcome,
    error: Option<String>,
) -> Result<RunOutcome> {
    let snapshot = deps.tracker.finish_run(run_id, outcome, error).await?;
    if let Err(e) = deps.store.record_run(&snapshot).await {
        error!("failed to persist run {}: {}", run_id, e);
    }
    Ok(outcome)
}

//! End-to-end pipeline scenarios against scripted collaborators.

mod common;

use common::*;
use digest_engine::pipeline::execute_run;
use digest_engine::{RunOutcome, StageName, StageStatus};
use interfaces::Recipient;
use std::sync::atomic::Ordering;
use std::sync::Arc;

async fn begin(deps: &digest_engine::PipelineDeps, task: &interfaces::Task) -> uuid::Uuid {
    deps.tracker
        .try_begin_run(task.id, &task.name)
        .await
        .expect("no run should be in progress")
}

#[tokio::test]
async fn partial_feed_failure_still_delivers_a_full_digest() {
    // Two feeds: one returns 3 articles, the other hangs past its timeout.
    let source = ScriptedSource::new(&[
        (
            "good",
            SourceBehavior::Items(vec![raw_item("a"), raw_item("b"), raw_item("c")]),
        ),
        ("slow", SourceBehavior::Hang),
    ]);
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai, transport.clone()).await;

    let task = task(
        vec![feed("good", &["tech"]), feed("slow", &["tech"])],
        vec![Recipient::new("reader@example.com")],
    );
    let run_id = begin(&deps, &task).await;

    let outcome = execute_run(&deps, &task, run_id, None).await;
    assert_eq!(outcome, RunOutcome::PartiallyFailed);

    let run = deps.tracker.run(run_id).await.unwrap();
    let fetch = run.stage(StageName::Fetch);
    assert_eq!(fetch.status, StageStatus::Completed);
    assert_eq!(fetch.counts.sources_failed, 1);
    assert_eq!(fetch.counts.new_articles, 3);
    assert!(fetch.detail.iter().any(|d| d.contains("slow")));

    assert_eq!(run.stage(StageName::Deliver).status, StageStatus::Completed);
    assert_eq!(run.stage(StageName::Deliver).counts.delivered, 1);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "reader@example.com");
    assert_eq!(sent[0].item_keys.len(), 3);
}

#[tokio::test]
async fn all_sources_failing_fails_the_run_and_skips_downstream() {
    let source = ScriptedSource::new(&[
        ("one", SourceBehavior::Fail("dns error".to_string())),
        ("two", SourceBehavior::Fail("500".to_string())),
    ]);
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai.clone(), transport.clone()).await;

    let task = task(
        vec![feed("one", &[]), feed("two", &[])],
        vec![Recipient::new("reader@example.com")],
    );
    let run_id = begin(&deps, &task).await;

    let outcome = execute_run(&deps, &task, run_id, None).await;
    assert_eq!(outcome, RunOutcome::Failed);

    let run = deps.tracker.run(run_id).await.unwrap();
    assert_eq!(run.stage(StageName::Fetch).status, StageStatus::Failed);
    assert_eq!(run.stage(StageName::Summarize).status, StageStatus::Skipped);
    assert_eq!(run.stage(StageName::Assemble).status, StageStatus::Skipped);
    assert_eq!(run.stage(StageName::Deliver).status, StageStatus::Skipped);

    assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ai_failing_every_batch_fails_the_run() {
    let source = ScriptedSource::new(&[(
        "good",
        SourceBehavior::Items(vec![raw_item("a"), raw_item("b")]),
    )]);
    let ai = ScriptedAi::new(AiMode::FailAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai, transport.clone()).await;

    let task = task(
        vec![feed("good", &[])],
        vec![Recipient::new("reader@example.com")],
    );
    let run_id = begin(&deps, &task).await;

    let outcome = execute_run(&deps, &task, run_id, None).await;
    assert_eq!(outcome, RunOutcome::Failed);

    let run = deps.tracker.run(run_id).await.unwrap();
    assert_eq!(run.stage(StageName::Fetch).status, StageStatus::Completed);
    assert_eq!(run.stage(StageName::Summarize).status, StageStatus::Failed);
    assert_eq!(run.stage(StageName::Assemble).status, StageStatus::Skipped);
    assert_eq!(run.stage(StageName::Deliver).status, StageStatus::Skipped);
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn refetched_articles_never_reenter_the_pipeline() {
    let source = ScriptedSource::new(&[(
        "good",
        SourceBehavior::Items(vec![raw_item("a"), raw_item("b")]),
    )]);
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai.clone(), transport.clone()).await;

    let task = task(
        vec![feed("good", &[])],
        vec![Recipient::new("reader@example.com")],
    );

    let first = begin(&deps, &task).await;
    assert_eq!(execute_run(&deps, &task, first, None).await, RunOutcome::Succeeded);
    assert_eq!(transport.sent.lock().unwrap().len(), 1);
    let ai_calls_after_first = ai.calls.load(Ordering::SeqCst);

    // Same feed content again: everything deduplicates, nothing reaches the
    // AI or the mailer.
    let second = begin(&deps, &task).await;
    assert_eq!(execute_run(&deps, &task, second, None).await, RunOutcome::Succeeded);

    let run = deps.tracker.run(second).await.unwrap();
    assert_eq!(run.stage(StageName::Fetch).counts.fetched, 2);
    assert_eq!(run.stage(StageName::Fetch).counts.new_articles, 0);
    assert_eq!(ai.calls.load(Ordering::SeqCst), ai_calls_after_first);
    assert_eq!(transport.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn excluded_tag_never_reaches_a_digest_despite_ai_approval() {
    let source = ScriptedSource::new(&[
        ("sports", SourceBehavior::Items(vec![raw_item("match")])),
        ("tech", SourceBehavior::Items(vec![raw_item("launch")])),
    ]);
    // The scripted backend includes everything it sees; exclusion must win
    // before it gets the chance.
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai, transport.clone()).await;

    let mut task = task(
        vec![feed("sports", &["sports"]), feed("tech", &["tech"])],
        vec![Recipient::new("reader@example.com")],
    );
    task.tag_rules.exclude = vec!["sports".to_string()];

    let run_id = begin(&deps, &task).await;
    assert_eq!(execute_run(&deps, &task, run_id, None).await, RunOutcome::Succeeded);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].item_keys.len(), 1);
    assert_eq!(sent[0].item_keys[0].source_id, "tech");

    let run = deps.tracker.run(run_id).await.unwrap();
    assert_eq!(run.stage(StageName::Summarize).counts.excluded_by_tag, 1);
}

#[tokio::test]
async fn recipient_with_no_matches_gets_no_email() {
    let source = ScriptedSource::new(&[("tech", SourceBehavior::Items(vec![raw_item("a")]))]);
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai, transport.clone()).await;

    let mut gardener = Recipient::new("gardener@example.com");
    gardener.interests = vec!["gardening".to_string()];
    let reader = Recipient::new("reader@example.com");

    let task = task(vec![feed("tech", &["tech"])], vec![gardener, reader]);
    let run_id = begin(&deps, &task).await;
    assert_eq!(execute_run(&deps, &task, run_id, None).await, RunOutcome::Succeeded);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "reader@example.com");
}

#[tokio::test]
async fn terminal_runs_are_persisted_to_the_store() {
    let source = ScriptedSource::new(&[("good", SourceBehavior::Items(vec![raw_item("a")]))]);
    let ai = ScriptedAi::new(AiMode::IncludeAll);
    let transport = Arc::new(RecordingTransport::default());
    let deps = deps_with(source, ai, transport).await;

    let task = task(vec![feed("good", &[])], vec![Recipient::new("r@example.com")]);
    let run_id = begin(&deps, &task).await;
    execute_run(&deps, &task, run_id, None).await;

    let persisted = deps.store.recent_runs(Some(task.id), 10).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].run_id, run_id);
    assert!(persisted[0].outcome.is_terminal());
}

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use stockscan_core::execution::{CommandSpec, TokioProcessExecutor};
use stockscan_core::models::{ResourceCategory, TaskState};
use stockscan_core::orchestration::{
    AnalysisRequest, AnalysisRuntime, RuntimeConfig, StartOutcome,
};
use stockscan_core::status::TaskStatusStore;

fn runtime() -> AnalysisRuntime {
    stockscan_core::init_tracing();
    AnalysisRuntime::new(
        Arc::new(TaskStatusStore::new()),
        Arc::new(TokioProcessExecutor),
        RuntimeConfig::default(),
    )
}

fn shell(script: &str) -> CommandSpec {
    CommandSpec::new("/bin/sh").arg("-c").arg(script)
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn full_run_reports_progress_and_completes_with_payload() {
    let runtime = runtime();
    let script = r#"
echo "[PROGRESS] 10.0 loading symbols"
echo "[PROGRESS] 50.0 analyzed 13/26"
echo "[LOG] writing results"
echo "[PROGRESS] 100.0 done"
echo '{"status": "success", "patterns_found": 7}'
"#;

    let outcome = runtime
        .start(AnalysisRequest::new(
            ResourceCategory::ChartPattern,
            shell(script),
        ))
        .expect("start");
    let StartOutcome::Started(task_id) = outcome else {
        panic!("expected start, got busy");
    };

    let snapshot = runtime.wait_for_terminal(&task_id, WAIT).await.expect("terminal");

    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.progress_pct, 100.0);
    assert_eq!(snapshot.progress_message.as_deref(), Some("done"));
    assert_eq!(snapshot.counters.get("completed"), Some(&13));
    assert_eq!(snapshot.counters.get("total"), Some(&26));
    assert_eq!(snapshot.logs.len(), 5);
    assert_eq!(
        snapshot.result.expect("result payload")["patterns_found"],
        7
    );
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn second_start_for_a_busy_category_is_rejected_then_allowed() {
    let runtime = runtime();

    let outcome = runtime
        .start(AnalysisRequest::new(
            ResourceCategory::SimilarStock,
            shell(r#"sleep 0.3; echo '{"ok": true}'"#),
        ))
        .expect("start");
    let StartOutcome::Started(task_id) = outcome else {
        panic!("expected start, got busy");
    };

    let rejected = runtime
        .start(AnalysisRequest::new(
            ResourceCategory::SimilarStock,
            shell("echo unused"),
        ))
        .expect("second start");
    assert_eq!(rejected, StartOutcome::Busy);

    let snapshot = runtime.wait_for_terminal(&task_id, WAIT).await.expect("terminal");
    assert_eq!(snapshot.state, TaskState::Completed);

    // Completion released the gate for the next run.
    assert!(matches!(
        runtime.start(AnalysisRequest::new(
            ResourceCategory::SimilarStock,
            shell(r#"echo '{"ok": true}'"#),
        )),
        Ok(StartOutcome::Started(_))
    ));
}

#[tokio::test]
async fn timeout_fails_the_task_and_releases_the_gate() {
    let runtime = runtime();

    let outcome = runtime
        .start(
            AnalysisRequest::new(
                ResourceCategory::StockListingUpdate,
                shell("sleep 30"),
            )
            .timeout(Duration::from_millis(150)),
        )
        .expect("start");
    let StartOutcome::Started(task_id) = outcome else {
        panic!("expected start, got busy");
    };

    let snapshot = runtime.wait_for_terminal(&task_id, WAIT).await.expect("terminal");

    assert_eq!(snapshot.state, TaskState::Failed);
    assert!(
        snapshot
            .error
            .as_deref()
            .is_some_and(|msg| msg.contains("timed out")),
        "unexpected error: {:?}",
        snapshot.error
    );
    assert!(matches!(
        runtime.start(AnalysisRequest::new(
            ResourceCategory::StockListingUpdate,
            shell(r#"echo '{"ok": true}'"#),
        )),
        Ok(StartOutcome::Started(_))
    ));
}

#[tokio::test]
async fn cancel_terminates_the_process_and_marks_the_task_cancelled() {
    let runtime = runtime();

    let outcome = runtime
        .start(AnalysisRequest::new(
            ResourceCategory::LastCloseDownward,
            shell(r#"echo "[PROGRESS] 5.0 starting"; sleep 30"#),
        ))
        .expect("start");
    let StartOutcome::Started(task_id) = outcome else {
        panic!("expected start, got busy");
    };

    // Let the process get going before pulling the plug.
    tokio::time::sleep(Duration::from_millis(150)).await;
    runtime.cancel(&task_id).expect("cancel");

    let snapshot = runtime.wait_for_terminal(&task_id, WAIT).await.expect("terminal");
    assert_eq!(snapshot.state, TaskState::Cancelled);

    assert!(matches!(
        runtime.start(AnalysisRequest::new(
            ResourceCategory::LastCloseDownward,
            shell(r#"echo '{"ok": true}'"#),
        )),
        Ok(StartOutcome::Started(_))
    ));
}

#[tokio::test]
async fn script_failure_with_trailing_error_object_surfaces_the_message() {
    let runtime = runtime();
    let script = r#"
echo "[PROGRESS] 20.0 fetching"
echo '{"error": "KRX fetch failed: connection reset"}' >&2
exit 1
"#;

    let outcome = runtime
        .start(AnalysisRequest::new(
            ResourceCategory::ChartPattern,
            shell(script),
        ))
        .expect("start");
    let StartOutcome::Started(task_id) = outcome else {
        panic!("expected start, got busy");
    };

    let snapshot = runtime.wait_for_terminal(&task_id, WAIT).await.expect("terminal");

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("KRX fetch failed: connection reset")
    );
    // Progress observed before the failure is preserved on the snapshot.
    assert_eq!(snapshot.progress_pct, 20.0);
}

#[tokio::test]
async fn independent_categories_run_concurrently() {
    let runtime = runtime();
    let script = r#"sleep 0.2; echo '{"ok": true}'"#;

    let mut task_ids = Vec::new();
    for category in [
        ResourceCategory::ChartPattern,
        ResourceCategory::SimilarStock,
        ResourceCategory::LastCloseDownward,
        ResourceCategory::StockListingUpdate,
    ] {
        let outcome = runtime
            .start(AnalysisRequest::new(category, shell(script)))
            .expect("start");
        let StartOutcome::Started(task_id) = outcome else {
            panic!("category {category} should not be gated by the others");
        };
        task_ids.push(task_id);
    }

    for task_id in &task_ids {
        let snapshot = runtime.wait_for_terminal(task_id, WAIT).await.expect("terminal");
        assert_eq!(snapshot.state, TaskState::Completed);
    }
}

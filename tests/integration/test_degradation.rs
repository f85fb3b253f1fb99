//! Deadline and failure behavior: slow or failing branches degrade the
//! response, they never block the caller past the configured deadlines.

use std::time::{Duration, Instant};

use serde_json::json;

use caliper::config::{PipelineSettings, SessionSettings};

use crate::support::{engine, engine_with, rows, Script};

fn delayed(wait: Duration) -> Script {
    Script::Delay(
        wait,
        rows(json!([
            {"PressOperations.pressLine": "Line A", "PressOperations.defectRate": 2.0},
        ])),
    )
}

#[tokio::test]
async fn slow_source_expires_both_branches() {
    let settings = PipelineSettings {
        branch_deadline_secs: 1,
        pipeline_deadline_secs: 10,
        ..Default::default()
    };
    let (orchestrator, _bus) = engine_with(
        delayed(Duration::from_secs(3)),
        settings,
        SessionSettings::default(),
    );

    let started = Instant::now();
    let output = orchestrator
        .handle_turn(None, "defect rate by press line")
        .await
        .unwrap();

    // The branch deadline fires at ~1s, well before the source answers.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(
        output.response.degraded_branches,
        vec!["chart_ready", "insights_ready"]
    );
    assert!(output.response.chart.is_none());
    assert!(
        output.response.narrative.contains("in time"),
        "timed-out turn should apologize: {}",
        output.response.narrative
    );
}

#[tokio::test]
async fn pipeline_deadline_caps_the_caller_wait() {
    let settings = PipelineSettings {
        branch_deadline_secs: 30,
        pipeline_deadline_secs: 1,
        ..Default::default()
    };
    let (orchestrator, _bus) = engine_with(
        delayed(Duration::from_secs(5)),
        settings,
        SessionSettings::default(),
    );

    let started = Instant::now();
    let output = orchestrator
        .handle_turn(None, "defect rate by press line")
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!output.response.degraded_branches.is_empty());
    assert!(output.response.narrative.contains("in time"));
}

#[tokio::test]
async fn source_failure_degrades_to_no_data() {
    let (orchestrator, _bus) = engine(Script::Fail("connection refused".into()));

    let output = orchestrator
        .handle_turn(None, "defect rate last week")
        .await
        .unwrap();

    // Both branches still deliver, so the join completes without expiry;
    // the degradation lives in the content, not in missing branches.
    assert!(output.response.degraded_branches.is_empty());
    assert!(output.response.chart.is_none());
    assert!(
        output.response.narrative.starts_with("No matching data"),
        "source failure should read as no data: {}",
        output.response.narrative
    );
}

#[tokio::test]
async fn late_branches_after_expiry_are_dropped() {
    let settings = PipelineSettings {
        branch_deadline_secs: 1,
        pipeline_deadline_secs: 10,
        ..Default::default()
    };
    let (orchestrator, _bus) = engine_with(
        delayed(Duration::from_secs(2)),
        settings,
        SessionSettings::default(),
    );

    let first = orchestrator
        .handle_turn(None, "defect rate by press line")
        .await
        .unwrap();
    assert!(!first.response.degraded_branches.is_empty());

    // Let the stragglers land; they must find no open join to disturb.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orchestrator.in_flight(), 0);

    // The engine keeps serving the same session afterwards.
    let second = orchestrator
        .handle_turn(Some(first.session_id), "pass rate by press line")
        .await
        .unwrap();
    assert!(second.response.narrative.contains("in time"));
    assert_eq!(orchestrator.in_flight(), 0);
}

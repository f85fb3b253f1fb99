//! End-to-end turns over the full worker pipeline: data questions,
//! conversational short-circuits, clarifications, and anomaly alerts.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use caliper::messages::{ChartKind, Payload, Severity, Topic};

use crate::support::{engine, rows, Probe, Script};

#[tokio::test]
async fn data_question_returns_chart_findings_and_follow_ups() {
    let (orchestrator, _bus) = engine(Script::Rows(rows(json!([
        {"PressOperations.pressLine": "Line A", "PressOperations.defectRate": 2.1},
        {"PressOperations.pressLine": "Line B", "PressOperations.defectRate": 3.4},
    ]))));

    let output = orchestrator
        .handle_turn(None, "What's the defect rate by press line?")
        .await
        .unwrap();

    let response = &output.response;
    assert!(!response.clarification);
    assert!(response.degraded_branches.is_empty());

    let chart = response.chart.as_ref().expect("data turn should carry a chart");
    assert_eq!(chart.kind, ChartKind::Bar);
    assert_eq!(chart.categories, vec!["Line A", "Line B"]);

    assert!(response.narrative.contains("Key findings:"));
    assert!(
        response.narrative.contains("Line B"),
        "comparative finding should name the higher line: {}",
        response.narrative
    );
    assert!(!response.follow_ups.is_empty());
    assert!(response.follow_ups.len() <= 3);
    assert_eq!(orchestrator.in_flight(), 0);
}

#[tokio::test]
async fn greeting_short_circuits_without_a_query() {
    let (orchestrator, _bus) = engine(Script::Fail("must not be queried".into()));

    let output = orchestrator.handle_turn(None, "Good morning!").await.unwrap();

    assert!(output.response.narrative.starts_with("Hello"));
    assert!(output.response.chart.is_none());
    assert!(!output.response.clarification);
    assert_eq!(orchestrator.in_flight(), 0);
}

#[tokio::test]
async fn vague_reference_asks_for_clarification() {
    let (orchestrator, _bus) = engine(Script::Fail("must not be queried".into()));

    let output = orchestrator
        .handle_turn(None, "show me those numbers again")
        .await
        .unwrap();

    assert!(output.response.clarification);
    assert!(output.response.chart.is_none());
    assert!(!output.response.follow_ups.is_empty());
    assert!(
        output
            .response
            .follow_ups
            .iter()
            .any(|f| f.contains("Door_Outer_Left")),
        "clarification should offer concrete part families: {:?}",
        output.response.follow_ups
    );
}

#[tokio::test]
async fn off_domain_question_is_redirected() {
    let (orchestrator, _bus) = engine(Script::Fail("must not be queried".into()));

    let output = orchestrator
        .handle_turn(None, "what will the weather be tomorrow?")
        .await
        .unwrap();

    assert!(output.response.narrative.contains("press-shop"));
    assert!(output.response.chart.is_none());
    assert!(!output.response.clarification);
}

#[tokio::test]
async fn empty_result_set_reads_as_no_data() {
    let (orchestrator, _bus) = engine(Script::Rows(Vec::new()));

    let output = orchestrator
        .handle_turn(None, "scrap rate for bonnets last month")
        .await
        .unwrap();

    assert!(
        output.response.narrative.starts_with("No matching data"),
        "empty rows should read as no data: {}",
        output.response.narrative
    );
    assert!(output.response.chart.is_none());
}

#[tokio::test]
async fn critical_outlier_raises_an_alert_and_flags_the_narrative() {
    // 19 quiet samples plus one spike gives |z| well past the critical bound.
    let mut fixture = Vec::new();
    for _ in 0..19 {
        fixture.push(json!({"PressOperations.defectRate": 2.0}));
    }
    fixture.push(json!({"PressOperations.defectRate": 30.0}));

    let (orchestrator, bus) = engine(Script::Rows(rows(json!(fixture))));
    let (probe, mut alerts) = Probe::channel();
    bus.subscribe(Topic::AnomalyAlert, probe);

    let output = orchestrator
        .handle_turn(None, "any anomalies in the defect rate?")
        .await
        .unwrap();

    assert!(
        output.response.narrative.contains("[critical]"),
        "critical anomaly should surface in the narrative: {}",
        output.response.narrative
    );

    let envelope = timeout(Duration::from_secs(2), alerts.recv())
        .await
        .expect("alert should be broadcast promptly")
        .expect("alert channel should stay open");
    match &envelope.payload {
        Payload::AnomalyAlert(alert) => {
            assert_eq!(alert.insight.severity, Severity::Critical);
            assert_eq!(alert.insight.metric, "defectRate");
            assert!(alert.insight.observed > alert.insight.expected_high);
        }
        other => panic!("expected an anomaly alert, got {other:?}"),
    }
}

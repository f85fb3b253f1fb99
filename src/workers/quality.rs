//! Quality inspector: statistical findings and anomalies over result rows.
//!
//! All analysis is rule-based on the routines in [`crate::stats`]; there is
//! no inference in this branch, so the findings it reports are exactly the
//! numbers in the data. `InsufficientData` and `InsufficientVariance` from
//! the stats layer mean "no finding", never an error. Critical anomalies
//! are additionally broadcast as `anomaly_alert`, decoupled from the
//! response path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{MessageBus, MessageHandler};
use crate::error::Result;
use crate::messages::{
    column_value, to_number, AnomalyAlert, DataReady, Envelope, Finding, FindingTier, Insight,
    InsightsReady, Payload, Severity,
};
use crate::metrics::get_metrics;
use crate::stats::{control_limits, mean, moving_average, outliers_iqr, sample_stddev};

/// Comparative findings require at least this spread between best and worst.
const COMPARATIVE_MIN_RATIO: f64 = 1.25;

/// Moving-average window for trend direction.
const TREND_WINDOW: usize = 3;

/// Trend changes below this fraction are reported as stable, not noise.
const TREND_MIN_CHANGE: f64 = 0.05;

/// Fourth pipeline stage, analysis branch: subscribes to `data_ready`,
/// publishes `insights_ready` and, for critical anomalies, `anomaly_alert`.
pub struct QualityInspector {
    bus: Arc<MessageBus>,
}

impl QualityInspector {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl MessageHandler for QualityInspector {
    fn name(&self) -> &'static str {
        "quality_inspector"
    }

    async fn on_message(&self, envelope: Envelope) -> Result<()> {
        let Payload::DataReady(data) = &envelope.payload else {
            debug!(topic = %envelope.topic(), "ignoring non-data payload");
            return Ok(());
        };

        let insights = analyze(data);
        let criticals: Vec<Insight> = insights
            .anomalies
            .iter()
            .filter(|a| a.severity == Severity::Critical)
            .cloned()
            .collect();

        self.bus.publish(Envelope::new(
            envelope.session_id,
            envelope.request_id,
            self.name(),
            Payload::InsightsReady(insights),
        ));

        for insight in criticals {
            get_metrics().anomaly_alerts_total.inc();
            self.bus.publish(Envelope::new(
                envelope.session_id,
                envelope.request_id,
                self.name(),
                Payload::AnomalyAlert(AnomalyAlert { insight }),
            ));
        }
        Ok(())
    }
}

/// Run the full analysis over one result set.
pub fn analyze(data: &DataReady) -> InsightsReady {
    if data.request.rejected {
        return InsightsReady {
            findings: Vec::new(),
            anomalies: Vec::new(),
            degraded: Some("request rejected".to_string()),
        };
    }
    if let Some(error) = &data.error {
        return InsightsReady {
            findings: Vec::new(),
            anomalies: Vec::new(),
            degraded: Some(error.clone()),
        };
    }
    if data.rows.is_empty() {
        return InsightsReady {
            findings: Vec::new(),
            anomalies: Vec::new(),
            degraded: None,
        };
    }

    let entity_column = data.dimensions.first().map(String::as_str);
    let mut findings = Vec::new();
    let mut anomalies = Vec::new();

    for measure in &data.measures {
        let label = short_name(measure);
        let points = numeric_points(data, measure);
        if points.is_empty() {
            continue;
        }
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();

        observe(&mut findings, &label, &points, &values, entity_column.is_some());
        if entity_column.is_some() {
            compare(&mut findings, &label, &points);
        }
        if data.has_time_series {
            trend(&mut findings, &label, &values);
        }

        let before = anomalies.len();
        detect_anomalies(&mut anomalies, &label, &points, &values);
        if anomalies.len() > before {
            attach_causes(&mut findings, &mut anomalies[before..], &label);
        }
    }

    InsightsReady {
        findings,
        anomalies,
        degraded: None,
    }
}

/// Severity from the absolute standard score.
pub fn severity_for(z_abs: f64) -> Severity {
    if z_abs >= 4.0 {
        Severity::Critical
    } else if z_abs >= 3.0 {
        Severity::High
    } else if z_abs >= 2.0 {
        Severity::Moderate
    } else {
        Severity::Low
    }
}

/// A numeric cell with the row entity it belongs to.
struct Point {
    value: f64,
    entity: Option<String>,
}

fn numeric_points(data: &DataReady, measure: &str) -> Vec<Point> {
    let entity_column = data.dimensions.first().map(String::as_str);
    data.rows
        .iter()
        .filter_map(|row| {
            let value = column_value(row, measure).and_then(to_number)?;
            let entity = entity_column
                .and_then(|column| column_value(row, column))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            Some(Point { value, entity })
        })
        .collect()
}

fn observe(
    findings: &mut Vec<Finding>,
    label: &str,
    points: &[Point],
    values: &[f64],
    grouped: bool,
) {
    let Some(avg) = mean(values) else { return };

    if values.len() == 1 {
        findings.push(Finding {
            tier: FindingTier::Observation,
            text: format!("{label} is {:.2}.", values[0]),
            metric: Some(label.to_string()),
            confidence: 0.95,
        });
        return;
    }

    let (min_idx, max_idx) = extremes(values);
    let text = if grouped {
        format!(
            "Average {label} is {avg:.2} across {n} groups; lowest is {min:.2} at {min_e}, highest {max:.2} at {max_e}.",
            n = values.len(),
            min = values[min_idx],
            min_e = entity_label(points, min_idx),
            max = values[max_idx],
            max_e = entity_label(points, max_idx),
        )
    } else {
        format!(
            "Average {label} is {avg:.2} over {n} points, ranging {min:.2} to {max:.2}.",
            n = values.len(),
            min = values[min_idx],
            max = values[max_idx],
        )
    };
    findings.push(Finding {
        tier: FindingTier::Observation,
        text,
        metric: Some(label.to_string()),
        confidence: 0.95,
    });
}

fn compare(findings: &mut Vec<Finding>, label: &str, points: &[Point]) {
    if points.len() < 2 {
        return;
    }
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let (min_idx, max_idx) = extremes(&values);
    let (low, high) = (values[min_idx], values[max_idx]);
    if low <= 0.0 {
        return;
    }
    let ratio = high / low;
    if ratio < COMPARATIVE_MIN_RATIO {
        return;
    }
    findings.push(Finding {
        tier: FindingTier::Comparative,
        text: format!(
            "{max_e} runs {ratio:.1}x the {label} of {min_e} ({high:.2} vs {low:.2}).",
            max_e = entity_label(points, max_idx),
            min_e = entity_label(points, min_idx),
        ),
        metric: Some(label.to_string()),
        confidence: 0.8,
    });
}

fn trend(findings: &mut Vec<Finding>, label: &str, values: &[f64]) {
    let smoothed = moving_average(values, TREND_WINDOW);
    let (Some(first), Some(last)) = (smoothed.first(), smoothed.last()) else {
        return;
    };
    if smoothed.len() < 2 || first.abs() < f64::EPSILON {
        return;
    }
    let change = (last - first) / first.abs();
    if change.abs() < TREND_MIN_CHANGE {
        return;
    }
    let direction = if change > 0.0 { "up" } else { "down" };
    findings.push(Finding {
        tier: FindingTier::Observation,
        text: format!(
            "{label} is trending {direction} {pct:.1}% over the period.",
            pct = change.abs() * 100.0,
        ),
        metric: Some(label.to_string()),
        confidence: 0.75,
    });
}

fn detect_anomalies(anomalies: &mut Vec<Insight>, label: &str, points: &[Point], values: &[f64]) {
    let Ok(limits) = control_limits(values) else {
        // Not enough data to bound anything.
        return;
    };
    let Some(stddev) = sample_stddev(values) else {
        return;
    };
    if stddev.abs() < f64::EPSILON {
        // Constant series. Nothing can be out of control.
        return;
    }

    let mut flagged: Vec<usize> = Vec::new();
    for (index, value) in values.iter().enumerate() {
        let z = (value - limits.centerline) / stddev;
        if z.abs() >= 2.0 {
            flagged.push(index);
            anomalies.push(make_insight(label, points, index, *value, &limits, z.abs()));
        }
    }

    // The IQR fence catches skewed outliers the z-score misses.
    for outlier in outliers_iqr(values) {
        if flagged.contains(&outlier.index) {
            continue;
        }
        let z = (outlier.value - limits.centerline) / stddev;
        anomalies.push(make_insight(
            label,
            points,
            outlier.index,
            outlier.value,
            &limits,
            z.abs(),
        ));
    }
}

fn make_insight(
    label: &str,
    points: &[Point],
    index: usize,
    value: f64,
    limits: &crate::stats::ControlLimits,
    z_abs: f64,
) -> Insight {
    let entity = points.get(index).and_then(|p| p.entity.clone());
    let place = entity
        .as_deref()
        .map(|e| format!(" at {e}"))
        .unwrap_or_default();
    Insight {
        metric: label.to_string(),
        observed: value,
        expected_low: limits.lower,
        expected_high: limits.upper,
        severity: severity_for(z_abs),
        entity,
        cause: None,
        description: format!(
            "{label} of {value:.2}{place} is outside the expected range {low:.2} to {high:.2}.",
            low = limits.lower,
            high = limits.upper,
        ),
    }
}

/// Fill in candidate causes and the matching recommended action.
fn attach_causes(findings: &mut Vec<Finding>, anomalies: &mut [Insight], label: &str) {
    let Some((cause, action)) = cause_for(label) else {
        return;
    };
    for anomaly in anomalies.iter_mut() {
        anomaly.cause = Some(cause.to_string());
    }
    findings.push(Finding {
        tier: FindingTier::Causal,
        text: cause.to_string(),
        metric: Some(label.to_string()),
        confidence: 0.6,
    });
    findings.push(Finding {
        tier: FindingTier::Actionable,
        text: action.to_string(),
        metric: Some(label.to_string()),
        confidence: 0.7,
    });
}

/// Static cause table keyed by metric kind.
fn cause_for(label: &str) -> Option<(&'static str, &'static str)> {
    let lower = label.to_lowercase();
    if lower.contains("defect") || lower.contains("scrap") || lower.contains("rework") {
        Some((
            "Die wear or an off-spec coil batch typically drives defect spikes.",
            "Inspect the active dies and review coil certificates for the affected window.",
        ))
    } else if lower.contains("oee") || lower.contains("availability") || lower.contains("utilization")
    {
        Some((
            "Unplanned downtime or extended changeovers drag line effectiveness.",
            "Review the downtime log and changeover durations for the flagged period.",
        ))
    } else if lower.contains("cycle") {
        Some((
            "Reduced slide speed or repeated micro-stops lengthen cycle times.",
            "Check slide speed settings and the micro-stop log on the affected line.",
        ))
    } else if lower.contains("tonnage") {
        Some((
            "Tonnage drift usually follows die setup changes or material thickness variation.",
            "Verify die setup sheets and incoming material thickness certificates.",
        ))
    } else if lower.contains("pass") || lower.contains("quality") || lower.contains("yield") {
        Some((
            "Upstream material condition or worn dies degrade first-pass quality.",
            "Quarantine the affected batch and schedule a die inspection.",
        ))
    } else if lower.contains("cost") {
        Some((
            "Energy tariffs or rework volume usually drive unit cost shifts.",
            "Break the cost down by component for the affected period.",
        ))
    } else if lower.contains("count") || lower.contains("parts") {
        Some((
            "Line stoppages or schedule gaps reduce output volume.",
            "Cross-check the production schedule against the stoppage log.",
        ))
    } else {
        None
    }
}

fn short_name(member: &str) -> String {
    member.rsplit('.').next().unwrap_or(member).to_string()
}

fn entity_label(points: &[Point], index: usize) -> String {
    points
        .get(index)
        .and_then(|p| p.entity.clone())
        .unwrap_or_else(|| format!("row {}", index + 1))
}

fn extremes(values: &[f64]) -> (usize, usize) {
    let mut min_idx = 0;
    let mut max_idx = 0;
    for (i, v) in values.iter().enumerate() {
        if *v < values[min_idx] {
            min_idx = i;
        }
        if *v > values[max_idx] {
            max_idx = i;
        }
    }
    (min_idx, max_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AnalysisKind, DataShape, EnrichedRequest, Intent};
    use serde_json::json;
    use std::collections::HashMap;

    fn data_with(
        rows: Vec<serde_json::Value>,
        measures: Vec<&str>,
        dimensions: Vec<&str>,
    ) -> DataReady {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> = rows
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect();
        DataReady {
            source: "PressOperations".to_string(),
            row_count: rows.len(),
            rows,
            measures: measures.into_iter().map(String::from).collect(),
            dimensions: dimensions.into_iter().map(String::from).collect(),
            time_column: None,
            query_ms: 1,
            shape: DataShape::SingleSeries,
            has_time_series: false,
            category_counts: HashMap::new(),
            request: EnrichedRequest {
                intent: Intent::DataQuery,
                rejected: false,
                rejection_reason: None,
                metrics: Vec::new(),
                dimensions: Vec::new(),
                filters: Vec::new(),
                time_range: None,
                analysis: AnalysisKind::Overview,
                user_text: "test".to_string(),
            },
            error: None,
        }
    }

    #[test]
    fn severity_ladder() {
        assert_eq!(severity_for(4.2), Severity::Critical);
        assert_eq!(severity_for(3.1), Severity::High);
        assert_eq!(severity_for(2.0), Severity::Moderate);
        assert_eq!(severity_for(1.9), Severity::Low);
    }

    #[test]
    fn steady_series_yields_observation_without_anomalies() {
        let rows = vec![
            json!({"pressLine": "Line A", "defectRate": 2.0}),
            json!({"pressLine": "Line B", "defectRate": 2.2}),
        ];
        let insights = analyze(&data_with(
            rows,
            vec!["PressOperations.defectRate"],
            vec!["PressOperations.pressLine"],
        ));

        assert!(insights.anomalies.is_empty());
        assert!(insights.degraded.is_none());
        let observation = insights
            .findings
            .iter()
            .find(|f| f.tier == FindingTier::Observation)
            .unwrap();
        assert!(observation.text.contains("2.10"), "{}", observation.text);
    }

    #[test]
    fn spread_between_groups_yields_comparative_finding() {
        let rows = vec![
            json!({"pressLine": "Line A", "defectRate": 2.0}),
            json!({"pressLine": "Line B", "defectRate": 6.0}),
        ];
        let insights = analyze(&data_with(
            rows,
            vec!["PressOperations.defectRate"],
            vec!["PressOperations.pressLine"],
        ));

        let comparative = insights
            .findings
            .iter()
            .find(|f| f.tier == FindingTier::Comparative)
            .unwrap();
        assert!(comparative.text.contains("3.0x"), "{}", comparative.text);
        assert!(comparative.text.contains("Line B"));
    }

    #[test]
    fn outlier_is_flagged_with_entity_and_cause() {
        let mut rows: Vec<serde_json::Value> = (0..10)
            .map(|i| json!({"die": format!("D{i}"), "defectRate": 2.0 + (i as f64) * 0.01}))
            .collect();
        rows.push(json!({"die": "D10", "defectRate": 9.0}));

        let insights = analyze(&data_with(
            rows,
            vec!["PressOperations.defectRate"],
            vec!["PressOperations.die"],
        ));

        assert!(!insights.anomalies.is_empty());
        let anomaly = &insights.anomalies[0];
        assert_eq!(anomaly.entity.as_deref(), Some("D10"));
        assert_eq!(anomaly.observed, 9.0);
        assert!(anomaly.cause.as_deref().unwrap().contains("Die wear"));
        assert!(insights
            .findings
            .iter()
            .any(|f| f.tier == FindingTier::Actionable));
    }

    #[test]
    fn trend_direction_from_moving_average() {
        let rows: Vec<serde_json::Value> = (0..8)
            .map(|i| json!({"productionDate": format!("2026-03-0{}", i + 1), "oee": 60.0 + (i as f64) * 3.0}))
            .collect();
        let mut data = data_with(rows, vec!["PressOperations.oee"], vec![]);
        data.has_time_series = true;
        data.time_column = Some("PressOperations.productionDate".to_string());

        let insights = analyze(&data);
        let trend = insights
            .findings
            .iter()
            .find(|f| f.text.contains("trending"))
            .unwrap();
        assert!(trend.text.contains("up"), "{}", trend.text);
    }

    #[test]
    fn constant_series_never_alarms() {
        let rows: Vec<serde_json::Value> = (0..6)
            .map(|i| json!({"shift": format!("S{i}"), "passRate": 95.0}))
            .collect();
        let insights = analyze(&data_with(
            rows,
            vec!["PressOperations.passRate"],
            vec!["PressOperations.shift"],
        ));
        assert!(insights.anomalies.is_empty());
    }

    #[test]
    fn upstream_error_degrades_the_branch() {
        let mut data = data_with(vec![], vec!["PressOperations.count"], vec![]);
        data.error = Some("source unavailable".to_string());
        let insights = analyze(&data);
        assert_eq!(insights.degraded.as_deref(), Some("source unavailable"));
        assert!(insights.findings.is_empty());
    }

    #[test]
    fn empty_rows_mean_no_findings_not_an_error() {
        let insights = analyze(&data_with(vec![], vec!["PressOperations.count"], vec![]));
        assert!(insights.degraded.is_none());
        assert!(insights.findings.is_empty());
        assert!(insights.anomalies.is_empty());
    }

    #[test]
    fn string_decimals_are_analyzed_like_numbers() {
        let rows = vec![
            json!({"pressLine": "Line A", "avgTonnage": "780.5"}),
            json!({"pressLine": "Line B", "avgTonnage": "1150.0"}),
        ];
        let insights = analyze(&data_with(
            rows,
            vec!["PressOperations.avgTonnage"],
            vec!["PressOperations.pressLine"],
        ));
        assert!(!insights.findings.is_empty());
    }
}

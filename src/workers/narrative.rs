//! Narrative composer: merges the joined branches into the final reply.
//!
//! Runs at the fan-in point, invoked by the orchestrator once a turn's
//! correlation record completes (or its deadline expires), so it is not a
//! bus subscriber. The deterministic renderer is the canonical behavior:
//! findings are ordered observation, comparative, causal, actionable, and
//! degraded branches are listed in the payload but never mentioned in the
//! text. When inference is enabled the rendered notes are handed over for
//! a polish pass; any failure falls back to the rendered text.

use std::sync::Arc;

use tracing::debug;

use crate::catalog;
use crate::entity::{EntityCategory, EntityTracker};
use crate::messages::{
    ChartKind, ChartSpec, Clarification, EnrichedRequest, FinalResponse, FindingTier,
    InsightsReady,
};
use crate::services::InferenceService;
use crate::workers::viz::format_label;

const MAX_FINDING_BULLETS: usize = 5;
const MAX_CAUSE_BULLETS: usize = 3;
const MAX_ACTION_BULLETS: usize = 3;
const MAX_ANOMALY_BULLETS: usize = 3;

/// Final pipeline stage, invoked at fan-in.
pub struct NarrativeComposer {
    inference: Arc<dyn InferenceService>,
    max_follow_ups: usize,
}

impl NarrativeComposer {
    pub fn new(inference: Arc<dyn InferenceService>, max_follow_ups: usize) -> Self {
        Self {
            inference,
            max_follow_ups,
        }
    }

    /// Compose the reply for a data turn from whatever branches delivered.
    pub async fn compose(
        &self,
        request: &EnrichedRequest,
        entities: &EntityTracker,
        chart: Option<ChartSpec>,
        insights: Option<InsightsReady>,
        degraded_branches: Vec<String>,
    ) -> FinalResponse {
        if request.rejected {
            return self.redirect(request, degraded_branches);
        }

        let rendered = render(request, chart.as_ref(), insights.as_ref());
        let narrative = self.polish(&rendered).await;

        FinalResponse {
            narrative,
            chart: chart.filter(|c| c.kind != ChartKind::Empty),
            follow_ups: self.follow_ups(&request.user_text, entities),
            degraded_branches,
            clarification: false,
        }
    }

    /// Reply for a turn with no data component.
    pub async fn compose_conversational(
        &self,
        request: &EnrichedRequest,
        entities: &EntityTracker,
    ) -> FinalResponse {
        let rendered = conversational_text(&request.user_text);
        let narrative = self.polish(&rendered).await;

        FinalResponse {
            narrative,
            chart: None,
            follow_ups: self.follow_ups(&request.user_text, entities),
            degraded_branches: Vec::new(),
            clarification: false,
        }
    }

    /// Route a clarification question back as the turn's reply.
    pub fn compose_clarification(&self, clarification: &Clarification) -> FinalResponse {
        FinalResponse {
            narrative: clarification.question.clone(),
            chart: None,
            follow_ups: clarification
                .options
                .iter()
                .take(self.max_follow_ups)
                .cloned()
                .collect(),
            degraded_branches: Vec::new(),
            clarification: true,
        }
    }

    /// Canned redirect for off-domain requests.
    fn redirect(&self, request: &EnrichedRequest, degraded_branches: Vec<String>) -> FinalResponse {
        let reason = request
            .rejection_reason
            .as_deref()
            .unwrap_or("I can only answer questions about press-shop production data.");
        let narrative = format!("{reason}\n\n{}", catalog::capabilities_text());

        FinalResponse {
            narrative,
            chart: None,
            follow_ups: catalog::suggest_follow_ups("", self.max_follow_ups),
            degraded_branches,
            clarification: false,
        }
    }

    /// Follow-up suggestions: drill-downs for the entities the conversation
    /// is tracking first, topped up from the keyword table.
    fn follow_ups(&self, user_text: &str, entities: &EntityTracker) -> Vec<String> {
        let mut suggestions = entity_follow_ups(entities);
        suggestions.truncate(self.max_follow_ups);
        for candidate in catalog::suggest_follow_ups(user_text, self.max_follow_ups) {
            if suggestions.len() >= self.max_follow_ups {
                break;
            }
            if !suggestions.contains(&candidate) {
                suggestions.push(candidate);
            }
        }
        suggestions
    }

    /// Hand the rendered notes to inference for phrasing; keep the rendered
    /// text on any failure.
    async fn polish(&self, rendered: &str) -> String {
        if !self.inference.enabled() {
            return rendered.to_string();
        }
        let prompt = format!(
            "You are a manufacturing analyst writing for a plant manager.\n\
             Rewrite the notes below as a short, plain narrative.\n\
             Keep every number exactly as written. Do not invent data.\n\
             Notes:\n{rendered}"
        );
        match self.inference.complete(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => rendered.to_string(),
            Err(err) => {
                debug!(error = %err, "narrative polish unavailable, using rendered text");
                rendered.to_string()
            }
        }
    }
}

/// Deterministic renderer: findings ordered by tier, then anomalies, then
/// causes and actions. Degraded branches are not mentioned.
fn render(
    request: &EnrichedRequest,
    chart: Option<&ChartSpec>,
    insights: Option<&InsightsReady>,
) -> String {
    let has_chart = chart.map(|c| c.kind != ChartKind::Empty).unwrap_or(false);
    let has_insights = insights
        .map(|i| !i.findings.is_empty() || !i.anomalies.is_empty())
        .unwrap_or(false);

    if !has_chart && !has_insights {
        if chart.is_none() && insights.is_none() {
            return "I wasn't able to complete the analysis in time. Please try again."
                .to_string();
        }
        return format!(
            "No matching data for \"{}\". Try widening the time window or removing a filter.",
            request.user_text
        );
    }

    let mut lines: Vec<String> = Vec::new();
    if let Some(chart) = chart {
        if chart.kind != ChartKind::Empty {
            lines.push(format!("Here is {}.", lowercase_first(&chart.title)));
        }
    }

    if let Some(insights) = insights {
        push_tier_section(
            &mut lines,
            "Key findings:",
            insights,
            &[FindingTier::Observation, FindingTier::Comparative],
            MAX_FINDING_BULLETS,
        );

        if !insights.anomalies.is_empty() {
            lines.push("Anomalies:".to_string());
            for anomaly in insights.anomalies.iter().take(MAX_ANOMALY_BULLETS) {
                lines.push(format!(
                    "- [{}] {}",
                    anomaly.severity.as_str(),
                    anomaly.description
                ));
            }
        }

        push_tier_section(
            &mut lines,
            "Likely causes:",
            insights,
            &[FindingTier::Causal],
            MAX_CAUSE_BULLETS,
        );
        push_tier_section(
            &mut lines,
            "Recommended actions:",
            insights,
            &[FindingTier::Actionable],
            MAX_ACTION_BULLETS,
        );
    }

    lines.join("\n")
}

fn push_tier_section(
    lines: &mut Vec<String>,
    header: &str,
    insights: &InsightsReady,
    tiers: &[FindingTier],
    cap: usize,
) {
    let mut bullets: Vec<&str> = Vec::new();
    // Tier order within the section follows the tiers argument.
    for tier in tiers {
        for finding in insights.findings.iter().filter(|f| f.tier == *tier) {
            if !bullets.contains(&finding.text.as_str()) {
                bullets.push(&finding.text);
            }
            if bullets.len() == cap {
                break;
            }
        }
        if bullets.len() == cap {
            break;
        }
    }
    if bullets.is_empty() {
        return;
    }
    lines.push(header.to_string());
    for bullet in bullets {
        lines.push(format!("- {bullet}"));
    }
}

/// Drill-down questions for whatever the conversation is tracking.
fn entity_follow_ups(entities: &EntityTracker) -> Vec<String> {
    let mut suggestions = Vec::new();
    if let Some(family) = entities.get(EntityCategory::PartFamilies).first() {
        suggestions.push(format!("Break down {} by defect type", format_label(family)));
    }
    if let Some(metric) = entities.get(EntityCategory::Metric).first() {
        suggestions.push(format!("Show me {} by shift", format_label(metric)));
    }
    if let Some(line) = entities.get(EntityCategory::Line).first() {
        if let Some(other) = catalog::PRESS_LINES.iter().find(|&&l| l != line.as_str()) {
            suggestions.push(format!("How does {other} compare?"));
        }
    }
    suggestions
}

fn conversational_text(user_text: &str) -> String {
    let lower = user_text.to_lowercase();
    if lower.contains("thank") {
        return "You're welcome. Ask me about production whenever you need.".to_string();
    }
    if lower.starts_with("hi")
        || lower.starts_with("hello")
        || lower.starts_with("hey")
        || lower.starts_with("good ")
    {
        return format!(
            "Hello! I can help you explore press-shop production data.\n\n{}",
            catalog::capabilities_text()
        );
    }
    catalog::capabilities_text()
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityUpdate;
    use crate::messages::{AnalysisKind, Finding, Insight, Intent, Series, Severity, ValueFormat};
    use crate::services::NullInference;

    fn composer() -> NarrativeComposer {
        NarrativeComposer::new(Arc::new(NullInference), 3)
    }

    fn data_request(text: &str) -> EnrichedRequest {
        EnrichedRequest {
            intent: Intent::DataQuery,
            rejected: false,
            rejection_reason: None,
            metrics: vec!["defect_rate".to_string()],
            dimensions: Vec::new(),
            filters: Vec::new(),
            time_range: None,
            analysis: AnalysisKind::Overview,
            user_text: text.to_string(),
        }
    }

    fn chart() -> ChartSpec {
        ChartSpec {
            kind: ChartKind::Bar,
            title: "Defect Rate by Press Line".to_string(),
            x_label: None,
            y_label: None,
            categories: vec!["Line A".to_string(), "Line B".to_string()],
            series: vec![Series {
                name: "Defect Rate".to_string(),
                values: vec![2.1, 3.4],
            }],
            value_format: ValueFormat::Percent,
        }
    }

    fn finding(tier: FindingTier, text: &str) -> Finding {
        Finding {
            tier,
            text: text.to_string(),
            metric: Some("defectRate".to_string()),
            confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn findings_render_in_tier_order() {
        let insights = InsightsReady {
            findings: vec![
                finding(FindingTier::Actionable, "Inspect the dies."),
                finding(FindingTier::Observation, "Average defect rate is 2.75."),
                finding(FindingTier::Causal, "Die wear drives defect spikes."),
                finding(FindingTier::Comparative, "Line B runs 1.6x Line A."),
            ],
            anomalies: Vec::new(),
            degraded: None,
        };

        let response = composer()
            .compose(
                &data_request("defect rate by line"),
                &EntityTracker::new(),
                Some(chart()),
                Some(insights),
                Vec::new(),
            )
            .await;

        let narrative = &response.narrative;
        let observation = narrative.find("Average defect rate").unwrap();
        let comparative = narrative.find("1.6x").unwrap();
        let cause = narrative.find("Die wear").unwrap();
        let action = narrative.find("Inspect the dies").unwrap();
        assert!(observation < comparative);
        assert!(comparative < cause);
        assert!(cause < action);
        assert!(response.chart.is_some());
        assert!(!response.clarification);
    }

    #[tokio::test]
    async fn anomalies_list_severity_and_description() {
        let insights = InsightsReady {
            findings: Vec::new(),
            anomalies: vec![Insight {
                metric: "defectRate".to_string(),
                observed: 9.0,
                expected_low: 1.0,
                expected_high: 4.0,
                severity: Severity::Critical,
                entity: Some("D10".to_string()),
                cause: None,
                description: "defectRate of 9.00 at D10 is outside the expected range 1.00 to 4.00.".to_string(),
            }],
            degraded: None,
        };

        let response = composer()
            .compose(
                &data_request("defects"),
                &EntityTracker::new(),
                Some(chart()),
                Some(insights),
                Vec::new(),
            )
            .await;

        assert!(response.narrative.contains("[critical]"));
        assert!(response.narrative.contains("9.00"));
    }

    #[tokio::test]
    async fn rejection_gets_redirect_with_capabilities() {
        let mut request = data_request("weather?");
        request.rejected = true;
        request.rejection_reason =
            Some("I can only answer questions about press-shop production data.".to_string());

        let response = composer()
            .compose(&request, &EntityTracker::new(), None, None, Vec::new())
            .await;

        assert!(response.narrative.contains("press-shop"));
        assert!(response.chart.is_none());
        assert!(!response.follow_ups.is_empty());
    }

    #[tokio::test]
    async fn degraded_branches_are_listed_but_never_mentioned() {
        let insights = InsightsReady {
            findings: vec![finding(FindingTier::Observation, "Average OEE is 71.20.")],
            anomalies: Vec::new(),
            degraded: None,
        };

        let response = composer()
            .compose(
                &data_request("oee"),
                &EntityTracker::new(),
                None,
                Some(insights),
                vec!["chart_ready".to_string()],
            )
            .await;

        // The surviving branch still speaks: its findings carry the reply.
        assert!(response.narrative.contains("Average OEE is 71.20."));
        assert_eq!(response.degraded_branches, vec!["chart_ready"]);
        assert!(!response.narrative.contains("chart_ready"));
        assert!(!response.narrative.to_lowercase().contains("degraded"));
    }

    #[tokio::test]
    async fn empty_branches_explain_no_data() {
        let response = composer()
            .compose(
                &data_request("defect rate for bonnets in 1999"),
                &EntityTracker::new(),
                Some(ChartSpec::empty("No data")),
                Some(InsightsReady {
                    findings: Vec::new(),
                    anomalies: Vec::new(),
                    degraded: None,
                }),
                Vec::new(),
            )
            .await;

        assert!(response.narrative.contains("No matching data"));
        assert!(response.chart.is_none());
    }

    #[tokio::test]
    async fn nothing_delivered_reads_as_timeout() {
        let response = composer()
            .compose(&data_request("oee"), &EntityTracker::new(), None, None, Vec::new())
            .await;
        assert!(response.narrative.contains("in time"));
    }

    #[tokio::test]
    async fn follow_ups_are_capped() {
        let composer = NarrativeComposer::new(Arc::new(NullInference), 2);
        let response = composer
            .compose(
                &data_request("defect rate"),
                &EntityTracker::new(),
                Some(chart()),
                None,
                Vec::new(),
            )
            .await;
        assert!(response.follow_ups.len() <= 2);
    }

    #[tokio::test]
    async fn follow_ups_lead_with_tracked_entities() {
        let mut entities = EntityTracker::new();
        entities.apply(&[
            EntityUpdate::new(
                EntityCategory::PartFamilies,
                vec!["Door_Outer_Left".to_string()],
            ),
            EntityUpdate::single(EntityCategory::Metric, "oee"),
        ]);

        let response = composer()
            .compose(
                &data_request("oee for doors"),
                &entities,
                Some(chart()),
                None,
                Vec::new(),
            )
            .await;

        assert_eq!(
            response.follow_ups[0],
            "Break down Door Outer Left by defect type"
        );
        assert!(response.follow_ups.iter().any(|f| f.contains("OEE")));
        assert!(response.follow_ups.len() <= 3);
    }

    #[tokio::test]
    async fn greeting_reply_introduces_capabilities() {
        let request = EnrichedRequest::conversational("Hello!");
        let response = composer()
            .compose_conversational(&request, &EntityTracker::new())
            .await;
        assert!(response.narrative.starts_with("Hello"));
        assert!(!response.follow_ups.is_empty());
    }

    #[test]
    fn clarification_passthrough_sets_flag() {
        let response = composer().compose_clarification(&Clarification {
            question: "Which press line?".to_string(),
            options: vec!["Line A".to_string(), "Line B".to_string()],
        });
        assert!(response.clarification);
        assert_eq!(response.narrative, "Which press line?");
        assert_eq!(response.follow_ups.len(), 2);
    }
}

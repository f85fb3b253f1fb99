//! Intent advisor: classifies each user turn and maps it onto the
//! canonical vocabulary.
//!
//! Classification and extraction are rule-based over the static catalog;
//! when an inference service is configured its hints are merged in, but
//! every hint is validated against the catalog and the rule-based result
//! stands alone when inference is disabled or misbehaves. Reference
//! expressions ("these", "it") are resolved against the session's entity
//! tracker BEFORE this turn's mentions are recorded, so a reference always
//! points at prior context.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bus::{MessageBus, MessageHandler};
use crate::catalog;
use crate::entity::{detect_reference, EntityCategory, EntityUpdate};
use crate::error::Result;
use crate::messages::{
    AnalysisKind, Clarification, EnrichedRequest, Envelope, FilterOp, FilterSpec, Intent,
    Payload, SessionId,
};
use crate::services::InferenceService;
use crate::session::SessionStore;

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hiya|hello|hey|howdy|good\s+(morning|afternoon|evening)|thanks|thank\s+you|bye|goodbye)\b")
        .unwrap()
});

/// "by line", "per shift", "across part families".
static GROUPING_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:by|per|across|for each)\s+([a-z][a-z _-]{1,40})").unwrap()
});

const CAPABILITY_PHRASES: &[&str] = &[
    "what can i ask",
    "what can you do",
    "what data",
    "which data",
    "what datasets",
    "what metrics",
    "what do you know",
    "help",
    "capabilit",
];

const OFF_DOMAIN_TERMS: &[&str] = &[
    "weather",
    "stock market",
    "football",
    "cricket",
    "movie",
    "recipe",
    "lottery",
    "horoscope",
    "joke",
];

/// Verbs and question stems that signal a data request even when no
/// vocabulary term matched. Used to separate "show me the uptime of
/// flurble" (clarify) from small talk (conversational).
const DATA_VERBS: &[&str] = &[
    "show",
    "compare",
    "how many",
    "how much",
    "what is the",
    "what's the",
    "what was the",
    "give me",
    "average",
    "total",
    "count",
    "trend",
    "breakdown",
];

const ANOMALY_WORDS: &[&str] = &["anomal", "outlier", "unusual", "spike", "out of control"];
const TREND_WORDS: &[&str] = &["trend", "over time", "history", "daily", "weekly", "evolution"];
const COMPARE_WORDS: &[&str] = &["compare", "versus", " vs ", " vs.", "difference between", "against"];

/// What the advisor decided to publish for a turn.
#[derive(Debug, Clone)]
pub enum Advice {
    Request(EnrichedRequest),
    Clarify(Clarification),
}

/// Structured hints returned by the inference service. Every field is
/// optional; unknown names are dropped after catalog validation.
#[derive(Debug, Default, Deserialize)]
struct EnrichmentHints {
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    dimensions: Vec<String>,
    #[serde(default)]
    rejected: bool,
    #[serde(default)]
    rejection_reason: Option<String>,
}

/// First pipeline stage: subscribes to `user_query`, publishes either an
/// enriched request or a clarification.
pub struct IntentAdvisor {
    bus: Arc<MessageBus>,
    store: Arc<SessionStore>,
    inference: Arc<dyn InferenceService>,
}

impl IntentAdvisor {
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<SessionStore>,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        Self {
            bus,
            store,
            inference,
        }
    }

    /// Classify and enrich one user turn.
    ///
    /// Also records this turn's entity mentions in the session tracker,
    /// after references have been resolved against the previous state.
    pub async fn advise(&self, session_id: SessionId, text: &str) -> Advice {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();

        if GREETING.is_match(trimmed) || is_capability_question(&lower) {
            return Advice::Request(EnrichedRequest::conversational(trimmed));
        }

        let off_domain = OFF_DOMAIN_TERMS.iter().any(|t| lower.contains(t));

        // Prior state first: a reference in this turn must see last turn's
        // entities, not its own.
        let snapshot = self.store.snapshot(session_id);
        let reference = detect_reference(trimmed);
        let resolved = reference.and_then(|kind| {
            snapshot
                .as_ref()
                .and_then(|record| record.entities.resolve(kind))
        });

        let updates = catalog::extract_entities(trimmed);
        let defects = catalog::detect_defect_types(trimmed);
        let dimensions = extract_dimensions(trimmed);

        if reference.is_some() && resolved.is_none() && updates.is_empty() {
            debug!(session_id = %session_id, "reference with no prior context");
            return Advice::Clarify(Clarification {
                question: "I don't have earlier context to resolve that reference. \
                           Which parts or metric do you mean?"
                    .to_string(),
                options: catalog::PART_FAMILIES
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            });
        }

        let mut request = self.build_request(trimmed, &lower, &updates, resolved, defects);
        request.dimensions = dimensions;

        if off_domain && !request.rejected {
            request.rejected = true;
            request.rejection_reason = Some(
                "I can only answer questions about press-shop production data.".to_string(),
            );
        }

        let nothing_extracted = request.metrics.is_empty()
            && request.dimensions.is_empty()
            && request.filters.is_empty()
            && request.time_range.is_none();

        if nothing_extracted && !request.rejected {
            if DATA_VERBS.iter().any(|v| lower.contains(v)) {
                return Advice::Clarify(Clarification {
                    question: "Which metric would you like to see? I can analyze OEE, \
                               pass rate, defect rate, cycle time, tonnage, and cost."
                        .to_string(),
                    options: vec![
                        "OEE by press line".to_string(),
                        "Defect rate by part family".to_string(),
                        "Pass rate trend last week".to_string(),
                    ],
                });
            }
            // No vocabulary match and no data phrasing: treat as chat.
            return Advice::Request(EnrichedRequest::conversational(trimmed));
        }

        if !request.rejected {
            self.merge_inference_hints(&mut request, snapshot.as_deref()).await;
        }

        request.analysis = classify_analysis(
            &lower,
            request.time_range.is_some(),
            !request.dimensions.is_empty(),
        );

        // Record this turn's mentions after resolution so the next turn's
        // references land on them.
        if let Err(err) = self.store.apply_entities(session_id, &updates) {
            warn!(session_id = %session_id, error = %err, "entity update skipped");
        }

        Advice::Request(request)
    }

    fn build_request(
        &self,
        text: &str,
        lower: &str,
        updates: &[EntityUpdate],
        resolved: Option<crate::entity::ResolvedReference>,
        defects: Vec<String>,
    ) -> EnrichedRequest {
        let mut metrics: Vec<String> = Vec::new();
        let mut part_values: Vec<String> = Vec::new();
        let mut line_value: Option<String> = None;
        let mut time_label: Option<String> = None;

        for update in updates {
            match update.category {
                EntityCategory::PartFamilies => part_values = update.values.clone(),
                EntityCategory::Metric => metrics.extend(update.values.iter().cloned()),
                EntityCategory::Line => line_value = update.values.first().cloned(),
                EntityCategory::TimePeriod => time_label = update.values.first().cloned(),
            }
        }

        // A resolved reference fills only the slots the turn left empty;
        // explicit mentions always win.
        if let Some(reference) = resolved {
            match reference.category {
                EntityCategory::PartFamilies if part_values.is_empty() => {
                    part_values = reference.values;
                }
                EntityCategory::Metric if metrics.is_empty() => metrics = reference.values,
                EntityCategory::Line if line_value.is_none() => {
                    line_value = reference.values.into_iter().next();
                }
                EntityCategory::TimePeriod if time_label.is_none() => {
                    time_label = reference.values.into_iter().next();
                }
                _ => {}
            }
        }

        let mut filters = Vec::new();
        if !part_values.is_empty() {
            filters.push(FilterSpec {
                category: "part_family".to_string(),
                op: FilterOp::Equals,
                values: part_values,
            });
        }
        if let Some(line) = line_value {
            filters.push(FilterSpec {
                category: "press_line".to_string(),
                op: FilterOp::Equals,
                values: vec![line],
            });
        }
        if !defects.is_empty() {
            filters.push(FilterSpec {
                category: "defect_type".to_string(),
                op: FilterOp::Equals,
                values: defects,
            });
        }

        let time_range = time_label.and_then(|label| catalog::resolve_time_range(&label, Utc::now()));

        EnrichedRequest {
            intent: Intent::DataQuery,
            rejected: false,
            rejection_reason: None,
            metrics,
            dimensions: Vec::new(),
            filters,
            time_range,
            analysis: classify_analysis(lower, false, false),
            user_text: text.to_string(),
        }
    }

    /// Ask the inference service for additional canonical names and merge
    /// whatever survives catalog validation. Any failure leaves the
    /// rule-based request untouched.
    async fn merge_inference_hints(
        &self,
        request: &mut EnrichedRequest,
        snapshot: Option<&crate::session::SessionRecord>,
    ) {
        if !self.inference.enabled() {
            return;
        }

        let context = snapshot
            .map(|record| record.entities.context_string())
            .unwrap_or_default();
        let recent = snapshot
            .map(|record| {
                record
                    .context(6)
                    .iter()
                    .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let prompt = format!(
            "You map manufacturing questions onto a fixed analytics vocabulary.\n\
             Known metrics: oee, pass_rate, defect_rate, first_pass_yield, rework_rate, \
             cycle_time, tonnage, cost_per_part, utilization_rate, parts_per_day, count.\n\
             Known dimensions: part_family, press_line, die, material_grade, shift, \
             operator, defect_type, part_type, day_type.\n\
             Conversation context: {context}\n\
             Recent turns:\n{recent}\n\
             Question: {question}\n\
             Reply with JSON only: {{\"metrics\": [], \"dimensions\": [], \
             \"rejected\": false, \"rejection_reason\": null}}",
            context = context,
            recent = recent,
            question = request.user_text,
        );

        let value = match self.inference.complete_json(&prompt).await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "inference hints unavailable, rule-based only");
                return;
            }
        };
        let hints: EnrichmentHints = match serde_json::from_value(value) {
            Ok(hints) => hints,
            Err(err) => {
                debug!(error = %err, "inference hints did not match the expected shape");
                return;
            }
        };

        for metric in &hints.metrics {
            if let Some(name) = catalog::resolve_metric_name(metric) {
                if !request.metrics.iter().any(|m| m == name) {
                    request.metrics.push(name.to_string());
                }
            }
        }
        for dimension in &hints.dimensions {
            if let Some(name) = catalog::resolve_dimension_name(dimension) {
                if !request.dimensions.iter().any(|d| d == name) {
                    request.dimensions.push(name.to_string());
                }
            }
        }
        if hints.rejected && !request.rejected {
            request.rejected = true;
            request.rejection_reason = hints.rejection_reason.or_else(|| {
                Some("I can only answer questions about press-shop production data.".into())
            });
        }
    }
}

#[async_trait]
impl MessageHandler for IntentAdvisor {
    fn name(&self) -> &'static str {
        "intent_advisor"
    }

    async fn on_message(&self, envelope: Envelope) -> Result<()> {
        let Payload::UserQuery(query) = &envelope.payload else {
            debug!(topic = %envelope.topic(), "ignoring non-query payload");
            return Ok(());
        };

        let advice = self.advise(envelope.session_id, &query.text).await;
        let payload = match advice {
            Advice::Request(request) => Payload::EnrichedRequest(request),
            Advice::Clarify(clarification) => Payload::ClarificationNeeded(clarification),
        };
        self.bus.publish(Envelope::new(
            envelope.session_id,
            envelope.request_id,
            self.name(),
            payload,
        ));
        Ok(())
    }
}

fn is_capability_question(lower: &str) -> bool {
    CAPABILITY_PHRASES.iter().any(|p| lower.contains(p))
}

/// Grouping categories named after "by"/"per"/"across", resolved against
/// the source catalogs. Tries the two-word phrase first so "part family"
/// does not stop at "part".
fn extract_dimensions(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for captures in GROUPING_PHRASE.captures_iter(text) {
        let phrase = captures[1].trim().to_string();
        let words: Vec<&str> = phrase.split_whitespace().collect();

        let mut resolved = None;
        if words.len() >= 2 {
            resolved = catalog::resolve_dimension_name(&words[..2].join(" "));
        }
        if resolved.is_none() && !words.is_empty() {
            resolved = catalog::resolve_dimension_name(words[0]);
        }

        if let Some(name) = resolved {
            if !out.iter().any(|d| d == name) {
                out.push(name.to_string());
            }
        }
    }
    out
}

fn classify_analysis(lower: &str, has_time: bool, has_dimensions: bool) -> AnalysisKind {
    if ANOMALY_WORDS.iter().any(|w| lower.contains(w)) {
        AnalysisKind::Anomaly
    } else if COMPARE_WORDS.iter().any(|w| lower.contains(w)) {
        AnalysisKind::Comparison
    } else if has_time || TREND_WORDS.iter().any(|w| lower.contains(w)) {
        AnalysisKind::Trend
    } else if has_dimensions {
        AnalysisKind::Comparison
    } else {
        AnalysisKind::Overview
    }
}

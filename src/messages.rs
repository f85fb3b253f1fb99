//! Typed messages exchanged on the bus.
//!
//! One tagged variant per pipeline stage, dispatched by topic. Workers only
//! ever communicate through these payloads; no component reaches into
//! another's state.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier for one conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one pipeline turn. At most one execution is ever in
/// flight per request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Topics
// ============================================================================

/// Bus topics, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    UserQuery,
    EnrichedRequest,
    ClarificationNeeded,
    DataReady,
    ChartReady,
    InsightsReady,
    AnomalyAlert,
    FinalResponse,
}

impl Topic {
    /// Parse a topic from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_query" => Some(Self::UserQuery),
            "enriched_request" => Some(Self::EnrichedRequest),
            "clarification_needed" => Some(Self::ClarificationNeeded),
            "data_ready" => Some(Self::DataReady),
            "chart_ready" => Some(Self::ChartReady),
            "insights_ready" => Some(Self::InsightsReady),
            "anomaly_alert" => Some(Self::AnomalyAlert),
            "final_response" => Some(Self::FinalResponse),
            _ => None,
        }
    }

    /// The topic's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserQuery => "user_query",
            Self::EnrichedRequest => "enriched_request",
            Self::ClarificationNeeded => "clarification_needed",
            Self::DataReady => "data_ready",
            Self::ChartReady => "chart_ready",
            Self::InsightsReady => "insights_ready",
            Self::AnomalyAlert => "anomaly_alert",
            Self::FinalResponse => "final_response",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Stage payloads
// ============================================================================

/// Raw user turn entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuery {
    pub text: String,
}

/// Classified intent of a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    DataQuery,
    Conversational,
    NeedsClarification,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataQuery => "data_query",
            Self::Conversational => "conversational",
            Self::NeedsClarification => "needs_clarification",
        }
    }
}

/// What kind of analysis the request calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Overview,
    Comparison,
    Trend,
    Anomaly,
    Conversational,
}

/// Time grain for trend queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Hour,
    Day,
    Week,
    Month,
}

/// Requested time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    /// Human label as the user phrased it ("last week").
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain: Option<TimeGrain>,
}

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A filter expressed in canonical vocabulary, before source translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Canonical category ("part_family", "line").
    pub category: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

/// Output of the Intent Advisor: the user turn mapped onto canonical
/// vocabulary, ready for planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedRequest {
    pub intent: Intent,
    /// Off-domain requests are flagged rather than planned.
    #[serde(default)]
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Canonical metric names ("defect_rate").
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Canonical grouping categories ("part_family").
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub analysis: AnalysisKind,
    pub user_text: String,
}

impl EnrichedRequest {
    /// A conversational request with no data component.
    pub fn conversational(user_text: impl Into<String>) -> Self {
        Self {
            intent: Intent::Conversational,
            rejected: false,
            rejection_reason: None,
            metrics: Vec::new(),
            dimensions: Vec::new(),
            filters: Vec::new(),
            time_range: None,
            analysis: AnalysisKind::Conversational,
            user_text: user_text.into(),
        }
    }
}

/// A clarification question routed back to the user instead of advancing
/// the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Shape of a result set, used by the visualization decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShape {
    Empty,
    SingleValue,
    SingleSeries,
    MultiSeries,
}

/// Result rows plus the metadata downstream workers key off.
///
/// Published even when execution failed or the request was rejected, so
/// the fan-out degrades instead of stalling; `error` carries the marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReady {
    pub source: String,
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Resolved source measure columns.
    #[serde(default)]
    pub measures: Vec<String>,
    /// Resolved source dimension columns.
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    pub row_count: usize,
    pub query_ms: u64,
    pub shape: DataShape,
    pub has_time_series: bool,
    #[serde(default)]
    pub category_counts: HashMap<String, usize>,
    /// The enrichment that produced this query, carried for downstream
    /// workers.
    pub request: EnrichedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataReady {
    /// A degraded result for a request that produced no rows.
    pub fn degraded(request: EnrichedRequest, source: &str, error: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            rows: Vec::new(),
            measures: Vec::new(),
            dimensions: Vec::new(),
            time_column: None,
            row_count: 0,
            query_ms: 0,
            shape: DataShape::Empty,
            has_time_series: false,
            category_counts: HashMap::new(),
            request,
            error: Some(error.into()),
        }
    }
}

/// Look up a column in a result row by its qualified member name, falling
/// back to the bare name after the dot. Sources differ in whether they
/// echo qualified or short column names.
pub fn column_value<'a>(
    row: &'a serde_json::Map<String, serde_json::Value>,
    member: &str,
) -> Option<&'a serde_json::Value> {
    if let Some(value) = row.get(member) {
        return Some(value);
    }
    member.rsplit('.').next().and_then(|short| row.get(short))
}

/// Numeric view of a JSON value. Sources deliver decimals as strings, so
/// string parsing is part of the contract, not a workaround.
pub fn to_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Chart archetype chosen by the visualization planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Kpi,
    Bar,
    GroupedBar,
    Line,
    Donut,
    Table,
    Empty,
}

/// Hint for rendering numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormat {
    Plain,
    Percent,
    Currency,
}

/// One labeled series of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
}

/// Renderer-agnostic chart description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_label: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub series: Vec<Series>,
    pub value_format: ValueFormat,
}

impl ChartSpec {
    /// The empty chart, used when there is nothing to draw.
    pub fn empty(title: impl Into<String>) -> Self {
        Self {
            kind: ChartKind::Empty,
            title: title.into(),
            x_label: None,
            y_label: None,
            categories: Vec::new(),
            series: Vec::new(),
            value_format: ValueFormat::Plain,
        }
    }
}

/// Visualization branch result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartReady {
    pub chart: ChartSpec,
}

/// Severity ladder for statistical findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Tier a finding belongs to, in narrative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingTier {
    Observation,
    Comparative,
    Causal,
    Actionable,
}

/// A narrative-ready statement about the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub tier: FindingTier,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub confidence: f64,
}

/// A statistical anomaly with its expected range and candidate cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub metric: String,
    pub observed: f64,
    pub expected_low: f64,
    pub expected_high: f64,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub description: String,
}

/// Quality branch result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsReady {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub anomalies: Vec<Insight>,
    /// Set when the branch could not analyze (no data, upstream error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// Broadcast for critical anomalies, independent of the response path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub insight: Insight,
}

/// The composed answer for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResponse {
    pub narrative: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    /// Branch names that were degraded and silently omitted.
    #[serde(default)]
    pub degraded_branches: Vec<String>,
    /// True when the narrative is a clarification question, not an answer.
    #[serde(default)]
    pub clarification: bool,
}

// ============================================================================
// Envelope
// ============================================================================

/// Payload union, tagged by stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    UserQuery(UserQuery),
    EnrichedRequest(EnrichedRequest),
    ClarificationNeeded(Clarification),
    DataReady(DataReady),
    ChartReady(ChartReady),
    InsightsReady(InsightsReady),
    AnomalyAlert(AnomalyAlert),
    FinalResponse(FinalResponse),
}

impl Payload {
    /// Topic this payload is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::UserQuery(_) => Topic::UserQuery,
            Self::EnrichedRequest(_) => Topic::EnrichedRequest,
            Self::ClarificationNeeded(_) => Topic::ClarificationNeeded,
            Self::DataReady(_) => Topic::DataReady,
            Self::ChartReady(_) => Topic::ChartReady,
            Self::InsightsReady(_) => Topic::InsightsReady,
            Self::AnomalyAlert(_) => Topic::AnomalyAlert,
            Self::FinalResponse(_) => Topic::FinalResponse,
        }
    }
}

/// An immutable unit of information in flight between workers.
/// Created on publish, discarded after delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub producer: String,
    pub published_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        session_id: SessionId,
        request_id: RequestId,
        producer: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            session_id,
            request_id,
            producer: producer.into(),
            published_at: Utc::now(),
            payload,
        }
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

//! Query planner: turns an enriched request into a source query, runs it,
//! and publishes the result with the metadata downstream workers key off.
//!
//! Source selection walks the catalog's candidates strictly first: a source
//! qualifies only when it declares every requested measure, dimension, and
//! filter category. When no source covers the whole request, the planner
//! falls back to the best candidate that declares at least one requested
//! metric and drops the rest with a warning. Execution failures never
//! propagate as handler errors; the planner always publishes `data_ready`,
//! carrying an error marker when something went wrong, so the fan-out
//! degrades instead of stalling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{MessageBus, MessageHandler};
use crate::catalog::{self, SourceSpec};
use crate::error::{CaliperError, PlanError};
use crate::messages::{
    column_value, DataReady, DataShape, EnrichedRequest, Envelope, FilterOp, Intent, Payload,
    TimeGrain,
};
use crate::metrics::get_metrics;
use crate::services::{QueryFilter, QueryRequest, QueryResult, QueryService, TimeDimension};

/// A validated query bound to the source that will run it.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub source: &'static SourceSpec,
    pub query: QueryRequest,
}

/// Build a source query for `request`.
///
/// Fails with `Rejected` for off-domain requests and `NoViableSource` when
/// none of the requested metrics exist in any source's vocabulary.
pub fn plan_query(request: &EnrichedRequest, row_limit: usize) -> Result<PlannedQuery, PlanError> {
    if request.rejected {
        let reason = request
            .rejection_reason
            .clone()
            .unwrap_or_else(|| "off-domain request".to_string());
        return Err(PlanError::Rejected(reason));
    }

    let candidates = catalog::candidate_sources(&request.metrics, &request.dimensions);

    for &source in &candidates {
        match translate(source, request, row_limit, Strictness::Full) {
            Ok(query) => return Ok(PlannedQuery { source, query }),
            Err(err) => debug!(source = source.name, reason = %err, "source passed over"),
        }
    }

    if !request.metrics.is_empty()
        && !request
            .metrics
            .iter()
            .any(|m| catalog::resolve_metric_name(m).is_some())
    {
        return Err(PlanError::NoViableSource(format!(
            "no source declares any of: {}",
            request.metrics.join(", ")
        )));
    }

    // Partial coverage: keep the metrics, drop what the source lacks.
    let fallback = candidates
        .iter()
        .find(|s| {
            request.metrics.is_empty()
                || request.metrics.iter().any(|m| s.resolve_measure(m).is_some())
        })
        .copied()
        .ok_or_else(|| PlanError::NoViableSource("source catalog is empty".to_string()))?;

    let query = translate(fallback, request, row_limit, Strictness::BestEffort)?;
    Ok(PlannedQuery {
        source: fallback,
        query,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    /// Every requested name must resolve.
    Full,
    /// Unresolved names are skipped with a warning.
    BestEffort,
}

fn translate(
    source: &'static SourceSpec,
    request: &EnrichedRequest,
    row_limit: usize,
    strictness: Strictness,
) -> Result<QueryRequest, PlanError> {
    let mut measures = Vec::new();
    for metric in &request.metrics {
        match source.resolve_measure(metric) {
            Some(spec) => measures.push(spec.member.to_string()),
            None if strictness == Strictness::Full => {
                return Err(PlanError::UnknownMeasure {
                    source_name: source.name.to_string(),
                    measure: metric.clone(),
                });
            }
            None => warn!(source = source.name, metric = %metric, "metric skipped"),
        }
    }
    if measures.is_empty() {
        let default = source
            .resolve_measure(source.default_measure)
            .ok_or_else(|| PlanError::UnknownMeasure {
                source_name: source.name.to_string(),
                measure: source.default_measure.to_string(),
            })?;
        measures.push(default.member.to_string());
    }

    let mut dimensions = Vec::new();
    for dimension in &request.dimensions {
        match source.resolve_dimension(dimension) {
            Some(spec) => dimensions.push(spec.member.to_string()),
            None if strictness == Strictness::Full => {
                return Err(PlanError::UnknownDimension {
                    source_name: source.name.to_string(),
                    dimension: dimension.clone(),
                });
            }
            None => warn!(source = source.name, dimension = %dimension, "dimension skipped"),
        }
    }

    let mut filters = Vec::new();
    for filter in &request.filters {
        match source.resolve_dimension(&filter.category) {
            Some(spec) => filters.push(QueryFilter {
                member: spec.member.to_string(),
                operator: operator_name(filter.op).to_string(),
                values: filter.values.clone(),
            }),
            None if strictness == Strictness::Full => {
                return Err(PlanError::UnknownDimension {
                    source_name: source.name.to_string(),
                    dimension: filter.category.clone(),
                });
            }
            None => warn!(source = source.name, category = %filter.category, "filter skipped"),
        }
    }

    let mut time_dimensions = Vec::new();
    if let Some(range) = &request.time_range {
        if let (Some(start), Some(end)) = (range.start, range.end) {
            time_dimensions.push(TimeDimension {
                dimension: source.time_column.to_string(),
                date_range: [
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ],
                granularity: range.grain.map(|g| grain_name(g).to_string()),
            });
        }
    }

    Ok(QueryRequest {
        measures,
        dimensions,
        filters,
        time_dimensions,
        limit: Some(row_limit),
    })
}

fn operator_name(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Equals => "equals",
        FilterOp::Contains => "contains",
        FilterOp::Gt => "gt",
        FilterOp::Gte => "gte",
        FilterOp::Lt => "lt",
        FilterOp::Lte => "lte",
    }
}

fn grain_name(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Hour => "hour",
        TimeGrain::Day => "day",
        TimeGrain::Week => "week",
        TimeGrain::Month => "month",
    }
}

/// Shape classification from row count and grouping arity.
fn data_shape(row_count: usize, dimension_count: usize) -> DataShape {
    if row_count == 0 {
        DataShape::Empty
    } else if row_count == 1 && dimension_count == 0 {
        DataShape::SingleValue
    } else if dimension_count >= 2 {
        DataShape::MultiSeries
    } else {
        DataShape::SingleSeries
    }
}

/// Distinct value count per dimension column.
fn category_counts(
    rows: &[serde_json::Map<String, serde_json::Value>],
    dimensions: &[String],
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for dimension in dimensions {
        let distinct: std::collections::HashSet<String> = rows
            .iter()
            .filter_map(|row| column_value(row, dimension))
            .map(render_category)
            .collect();
        counts.insert(dimension.clone(), distinct.len());
    }
    counts
}

fn render_category(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Second pipeline stage: subscribes to `enriched_request`, publishes
/// `data_ready`.
pub struct QueryPlanner {
    bus: Arc<MessageBus>,
    query: Arc<dyn QueryService>,
    row_limit: usize,
}

impl QueryPlanner {
    pub fn new(bus: Arc<MessageBus>, query: Arc<dyn QueryService>, row_limit: usize) -> Self {
        Self {
            bus,
            query,
            row_limit,
        }
    }

    /// Plan and run one request. Always produces a payload; failures are
    /// carried as an error marker.
    pub async fn execute_request(&self, request: EnrichedRequest) -> DataReady {
        if request.rejected {
            let reason = request
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "request rejected".to_string());
            return DataReady::degraded(request, "none", reason);
        }

        let plan = match plan_query(&request, self.row_limit) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "planning failed");
                get_metrics().plan_failures_total.inc();
                return DataReady::degraded(request, "none", err.to_string());
            }
        };

        let source = plan.source;
        debug!(
            source = source.name,
            measures = plan.query.measures.len(),
            dimensions = plan.query.dimensions.len(),
            "dispatching query"
        );

        match self.query.execute(plan.query.clone()).await {
            Ok(result) => assemble(request, source, plan.query, result),
            Err(err) => {
                warn!(source = source.name, error = %err, "query execution failed");
                DataReady::degraded(request, source.name, err.to_string())
            }
        }
    }
}

fn assemble(
    request: EnrichedRequest,
    source: &'static SourceSpec,
    query: QueryRequest,
    result: QueryResult,
) -> DataReady {
    let time_column = query.time_dimensions.first().map(|t| t.dimension.clone());
    let shape = data_shape(result.rows.len(), query.dimensions.len());
    let counts = category_counts(&result.rows, &query.dimensions);

    DataReady {
        source: source.name.to_string(),
        row_count: result.rows.len(),
        rows: result.rows,
        measures: query.measures,
        dimensions: query.dimensions,
        has_time_series: time_column.is_some(),
        time_column,
        query_ms: result.elapsed_ms,
        shape,
        category_counts: counts,
        request,
        error: None,
    }
}

#[async_trait]
impl MessageHandler for QueryPlanner {
    fn name(&self) -> &'static str {
        "query_planner"
    }

    async fn on_message(&self, envelope: Envelope) -> Result<(), CaliperError> {
        let Payload::EnrichedRequest(request) = &envelope.payload else {
            debug!(topic = %envelope.topic(), "ignoring non-request payload");
            return Ok(());
        };
        if request.intent == Intent::Conversational {
            // Conversational turns never reach the data branch.
            return Ok(());
        }

        let ready = self.execute_request(request.clone()).await;
        self.bus.publish(Envelope::new(
            envelope.session_id,
            envelope.request_id,
            self.name(),
            Payload::DataReady(ready),
        ));
        Ok(())
    }
}

//! Visualization planner: picks a chart archetype from result metadata.
//!
//! The decision is a fixed table over the data-ready metadata, checked in
//! order: degraded or empty results draw nothing, a single value becomes a
//! KPI, a time series becomes a line, two grouping dimensions become a
//! grouped bar, and a single-dimension breakdown becomes a donut (share
//! style metrics), a bar, or a table. Oversized category sets are capped
//! with an aggregated "Other" bucket. The output is renderer-agnostic;
//! nothing here knows what will draw it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{MessageBus, MessageHandler};
use crate::error::Result;
use crate::messages::{
    column_value, to_number, ChartKind, ChartReady, ChartSpec, DataReady, DataShape, Envelope,
    Payload, Series, ValueFormat,
};

/// Grouped bars get unreadable past this many x positions.
const GROUPED_BAR_MAX_CATEGORIES: usize = 12;

/// Donut slices beyond this are folded into "Other".
const DONUT_MAX_SLICES: usize = 6;

/// Third pipeline stage, chart branch: subscribes to `data_ready`,
/// publishes `chart_ready`.
pub struct VisualizationPlanner {
    bus: Arc<MessageBus>,
    row_limit: usize,
    table_row_limit: usize,
}

impl VisualizationPlanner {
    pub fn new(bus: Arc<MessageBus>, row_limit: usize, table_row_limit: usize) -> Self {
        Self {
            bus,
            row_limit,
            table_row_limit,
        }
    }

    /// Chart decision table over result metadata.
    pub fn decide(&self, data: &DataReady) -> ChartSpec {
        if data.request.rejected || data.error.is_some() {
            return ChartSpec::empty("No data available");
        }
        if data.shape == DataShape::Empty {
            return ChartSpec::empty(title_for(data));
        }
        if data.shape == DataShape::SingleValue {
            return single_value_chart(data);
        }
        if data.has_time_series {
            return line_chart(data);
        }
        if data.dimensions.len() >= 2 {
            let x_categories = data
                .category_counts
                .get(&data.dimensions[0])
                .copied()
                .unwrap_or(data.row_count);
            if x_categories <= GROUPED_BAR_MAX_CATEGORIES {
                return grouped_bar_chart(data);
            }
            return table_chart(data, self.table_row_limit);
        }

        // Single grouping dimension.
        let categories = data
            .dimensions
            .first()
            .and_then(|d| data.category_counts.get(d))
            .copied()
            .unwrap_or(data.row_count);

        if data.measures.len() == 1 && is_share_style(&data.measures[0]) {
            return donut_chart(data);
        }
        if categories <= self.row_limit {
            return bar_chart(data);
        }
        table_chart(data, self.table_row_limit)
    }
}

#[async_trait]
impl MessageHandler for VisualizationPlanner {
    fn name(&self) -> &'static str {
        "visualization_planner"
    }

    async fn on_message(&self, envelope: Envelope) -> Result<()> {
        let Payload::DataReady(data) = &envelope.payload else {
            debug!(topic = %envelope.topic(), "ignoring non-data payload");
            return Ok(());
        };

        let chart = self.decide(data);
        debug!(kind = ?chart.kind, "chart decided");
        self.bus.publish(Envelope::new(
            envelope.session_id,
            envelope.request_id,
            self.name(),
            Payload::ChartReady(ChartReady { chart }),
        ));
        Ok(())
    }
}

// ============================================================================
// Chart builders
// ============================================================================

fn single_value_chart(data: &DataReady) -> ChartSpec {
    let row = match data.rows.first() {
        Some(row) => row,
        None => return ChartSpec::empty(title_for(data)),
    };

    if data.measures.len() == 1 {
        let label = format_label(&data.measures[0]);
        let value = column_value(row, &data.measures[0])
            .and_then(to_number)
            .unwrap_or(0.0);
        return ChartSpec {
            kind: ChartKind::Kpi,
            title: title_for(data),
            x_label: None,
            y_label: Some(label.clone()),
            categories: vec![label.clone()],
            series: vec![Series {
                name: label,
                values: vec![value],
            }],
            value_format: value_format_for(&data.measures),
        };
    }

    // One row, several measures: one bar per measure.
    let categories: Vec<String> = data.measures.iter().map(|m| format_label(m)).collect();
    let values: Vec<f64> = data
        .measures
        .iter()
        .map(|m| column_value(row, m).and_then(to_number).unwrap_or(0.0))
        .collect();
    ChartSpec {
        kind: ChartKind::Bar,
        title: title_for(data),
        x_label: None,
        y_label: None,
        categories,
        series: vec![Series {
            name: "Value".to_string(),
            values,
        }],
        value_format: value_format_for(&data.measures),
    }
}

fn line_chart(data: &DataReady) -> ChartSpec {
    let time_column = data
        .time_column
        .as_deref()
        .or(data.dimensions.first().map(String::as_str))
        .unwrap_or_default();

    let categories: Vec<String> = data
        .rows
        .iter()
        .map(|row| {
            column_value(row, time_column)
                .map(render_time_label)
                .unwrap_or_default()
        })
        .collect();

    let series = data
        .measures
        .iter()
        .map(|measure| Series {
            name: format_label(measure),
            values: data
                .rows
                .iter()
                .map(|row| column_value(row, measure).and_then(to_number).unwrap_or(0.0))
                .collect(),
        })
        .collect();

    ChartSpec {
        kind: ChartKind::Line,
        title: title_for(data),
        x_label: Some("Date".to_string()),
        y_label: data.measures.first().map(|m| format_label(m)),
        categories,
        series,
        value_format: value_format_for(&data.measures),
    }
}

fn grouped_bar_chart(data: &DataReady) -> ChartSpec {
    let x_dim = &data.dimensions[0];
    let group_dim = &data.dimensions[1];
    let measure = match data.measures.first() {
        Some(m) => m,
        None => return ChartSpec::empty(title_for(data)),
    };

    let mut x_order: Vec<String> = Vec::new();
    let mut groups: Vec<String> = Vec::new();
    let mut cells: HashMap<(String, String), f64> = HashMap::new();

    for row in &data.rows {
        let x = column_value(row, x_dim).map(label_of).unwrap_or_default();
        let group = column_value(row, group_dim).map(label_of).unwrap_or_default();
        let value = column_value(row, measure).and_then(to_number).unwrap_or(0.0);

        if !x_order.contains(&x) {
            x_order.push(x.clone());
        }
        if !groups.contains(&group) {
            groups.push(group.clone());
        }
        cells.insert((x, group), value);
    }
    groups.sort();

    let series = groups
        .iter()
        .map(|group| Series {
            name: group.clone(),
            values: x_order
                .iter()
                .map(|x| {
                    cells
                        .get(&(x.clone(), group.clone()))
                        .copied()
                        .unwrap_or(0.0)
                })
                .collect(),
        })
        .collect();

    ChartSpec {
        kind: ChartKind::GroupedBar,
        title: title_for(data),
        x_label: Some(format_label(x_dim)),
        y_label: Some(format_label(measure)),
        categories: x_order,
        series,
        value_format: value_format_for(&data.measures),
    }
}

fn donut_chart(data: &DataReady) -> ChartSpec {
    let dimension = data.dimensions.first().map(String::as_str).unwrap_or_default();
    let measure = &data.measures[0];

    let mut slices: Vec<(String, f64)> = data
        .rows
        .iter()
        .map(|row| {
            (
                column_value(row, dimension).map(label_of).unwrap_or_default(),
                column_value(row, measure).and_then(to_number).unwrap_or(0.0),
            )
        })
        .collect();
    slices.sort_by(|a, b| b.1.total_cmp(&a.1));

    if slices.len() > DONUT_MAX_SLICES {
        let rest: f64 = slices[DONUT_MAX_SLICES - 1..].iter().map(|(_, v)| v).sum();
        slices.truncate(DONUT_MAX_SLICES - 1);
        slices.push(("Other".to_string(), rest));
    }

    ChartSpec {
        kind: ChartKind::Donut,
        title: title_for(data),
        x_label: None,
        y_label: None,
        categories: slices.iter().map(|(label, _)| label.clone()).collect(),
        series: vec![Series {
            name: format_label(measure),
            values: slices.iter().map(|(_, v)| *v).collect(),
        }],
        value_format: value_format_for(&data.measures),
    }
}

fn bar_chart(data: &DataReady) -> ChartSpec {
    let dimension = data.dimensions.first().map(String::as_str).unwrap_or_default();

    let categories: Vec<String> = data
        .rows
        .iter()
        .map(|row| column_value(row, dimension).map(label_of).unwrap_or_default())
        .collect();

    let series = data
        .measures
        .iter()
        .map(|measure| Series {
            name: format_label(measure),
            values: data
                .rows
                .iter()
                .map(|row| column_value(row, measure).and_then(to_number).unwrap_or(0.0))
                .collect(),
        })
        .collect();

    ChartSpec {
        kind: ChartKind::Bar,
        title: title_for(data),
        x_label: data.dimensions.first().map(|d| format_label(d)),
        y_label: data.measures.first().map(|m| format_label(m)),
        categories,
        series,
        value_format: value_format_for(&data.measures),
    }
}

fn table_chart(data: &DataReady, table_row_limit: usize) -> ChartSpec {
    let dimension = data.dimensions.first().map(String::as_str);

    let mut categories: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); data.measures.len()];

    for (index, row) in data.rows.iter().take(table_row_limit).enumerate() {
        let label = match dimension {
            Some(d) => column_value(row, d).map(label_of).unwrap_or_default(),
            None => (index + 1).to_string(),
        };
        categories.push(label);
        for (column, measure) in columns.iter_mut().zip(&data.measures) {
            column.push(column_value(row, measure).and_then(to_number).unwrap_or(0.0));
        }
    }

    if data.rows.len() > table_row_limit {
        categories.push("Other".to_string());
        for (column, measure) in columns.iter_mut().zip(&data.measures) {
            let rest: f64 = data.rows[table_row_limit..]
                .iter()
                .map(|row| column_value(row, measure).and_then(to_number).unwrap_or(0.0))
                .sum();
            column.push(rest);
        }
    }

    let series = data
        .measures
        .iter()
        .zip(columns)
        .map(|(measure, values)| Series {
            name: format_label(measure),
            values,
        })
        .collect();

    ChartSpec {
        kind: ChartKind::Table,
        title: title_for(data),
        x_label: dimension.map(format_label),
        y_label: None,
        categories,
        series,
        value_format: value_format_for(&data.measures),
    }
}

// ============================================================================
// Labels and formats
// ============================================================================

/// "PressOperations.avgCycleTime" -> "Avg Cycle Time".
pub fn format_label(member: &str) -> String {
    let short = member.rsplit('.').next().unwrap_or(member);
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for c in short.chars() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else if c.is_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
            current.push(c);
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|word| {
            let lower = word.to_lowercase();
            match lower.as_str() {
                "oee" => "OEE".to_string(),
                "fpy" => "FPY".to_string(),
                _ => {
                    let mut chars = lower.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_for(data: &DataReady) -> String {
    let mut title = data
        .measures
        .first()
        .map(|m| format_label(m))
        .unwrap_or_else(|| "Results".to_string());

    if let Some(dimension) = data.dimensions.first() {
        title.push_str(" by ");
        title.push_str(&format_label(dimension));
    }
    if let Some(range) = &data.request.time_range {
        title.push_str(&format!(" ({})", range.label.replace('_', " ")));
    }
    title
}

fn value_format_for(measures: &[String]) -> ValueFormat {
    let short = measures
        .first()
        .map(|m| m.rsplit('.').next().unwrap_or(m).to_lowercase())
        .unwrap_or_default();

    if short.contains("rate")
        || short.contains("yield")
        || short.contains("availability")
        || short.contains("performance")
        || short.contains("quality")
        || short.contains("utilization")
        || short.contains("oee")
    {
        ValueFormat::Percent
    } else if short.contains("cost") {
        ValueFormat::Currency
    } else {
        ValueFormat::Plain
    }
}

fn is_share_style(measure: &str) -> bool {
    measure
        .rsplit('.')
        .next()
        .unwrap_or(measure)
        .to_lowercase()
        .contains("count")
}

fn label_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Trim timestamps down to their date part for axis labels.
fn render_time_label(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) if s.len() >= 10 && s.as_bytes()[4] == b'-' => {
            s.get(..10).unwrap_or(s).to_string()
        }
        other => label_of(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AnalysisKind, EnrichedRequest, Intent, TimeRange};
    use serde_json::json;

    fn rows(values: Vec<serde_json::Value>) -> Vec<serde_json::Map<String, serde_json::Value>> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    fn data(
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
        measures: Vec<&str>,
        dimensions: Vec<&str>,
    ) -> DataReady {
        let dimensions: Vec<String> = dimensions.into_iter().map(String::from).collect();
        let mut counts = HashMap::new();
        for dimension in &dimensions {
            let distinct: std::collections::HashSet<String> = rows
                .iter()
                .filter_map(|row| column_value(row, dimension))
                .map(label_of)
                .collect();
            counts.insert(dimension.clone(), distinct.len());
        }
        let shape = if rows.is_empty() {
            DataShape::Empty
        } else if rows.len() == 1 && dimensions.is_empty() {
            DataShape::SingleValue
        } else if dimensions.len() >= 2 {
            DataShape::MultiSeries
        } else {
            DataShape::SingleSeries
        };

        DataReady {
            source: "PressOperations".to_string(),
            row_count: rows.len(),
            rows,
            measures: measures.into_iter().map(String::from).collect(),
            dimensions,
            time_column: None,
            query_ms: 1,
            shape,
            has_time_series: false,
            category_counts: counts,
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

    fn planner() -> VisualizationPlanner {
        VisualizationPlanner::new(Arc::new(MessageBus::new()), 10, 20)
    }

    #[test]
    fn single_value_becomes_kpi() {
        let data = data(
            rows(vec![json!({"PressOperations.passRate": "96.5"})]),
            vec!["PressOperations.passRate"],
            vec![],
        );
        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Kpi);
        assert_eq!(chart.series[0].values, vec![96.5]);
        assert_eq!(chart.value_format, ValueFormat::Percent);
    }

    #[test]
    fn time_series_becomes_line_with_date_labels() {
        let mut data = data(
            rows(vec![
                json!({"PressOperations.productionDate": "2026-03-01T00:00:00.000", "PressOperations.oee": 71.0}),
                json!({"PressOperations.productionDate": "2026-03-02T00:00:00.000", "PressOperations.oee": 74.5}),
            ]),
            vec!["PressOperations.oee"],
            vec![],
        );
        data.time_column = Some("PressOperations.productionDate".to_string());
        data.has_time_series = true;
        data.request.time_range = Some(TimeRange {
            label: "last_7_days".to_string(),
            start: None,
            end: None,
            grain: None,
        });

        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Line);
        assert_eq!(chart.categories, vec!["2026-03-01", "2026-03-02"]);
        assert_eq!(chart.series[0].values, vec![71.0, 74.5]);
        assert!(chart.title.contains("last 7 days"));
    }

    #[test]
    fn two_dimensions_become_grouped_bar_with_sorted_groups() {
        let data = data(
            rows(vec![
                json!({"partFamily": "Door_Outer_Left", "shift": "Night", "count": 40}),
                json!({"partFamily": "Door_Outer_Left", "shift": "Day", "count": 55}),
                json!({"partFamily": "Bonnet_Outer", "shift": "Day", "count": 30}),
            ]),
            vec!["PressOperations.count"],
            vec!["PressOperations.partFamily", "PressOperations.shift"],
        );

        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::GroupedBar);
        assert_eq!(chart.categories, vec!["Door_Outer_Left", "Bonnet_Outer"]);
        let names: Vec<&str> = chart.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Day", "Night"]);
        // Bonnet_Outer has no Night row.
        assert_eq!(chart.series[1].values, vec![40.0, 0.0]);
    }

    #[test]
    fn count_breakdown_becomes_donut_sorted_by_share() {
        let data = data(
            rows(vec![
                json!({"defectType": "springback", "count": 12}),
                json!({"defectType": "burr", "count": 30}),
                json!({"defectType": "crack", "count": 5}),
            ]),
            vec!["PressOperations.count"],
            vec!["PressOperations.defectType"],
        );

        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Donut);
        assert_eq!(chart.categories, vec!["burr", "springback", "crack"]);
        assert_eq!(chart.series[0].values, vec![30.0, 12.0, 5.0]);
    }

    #[test]
    fn oversized_donut_folds_remainder_into_other() {
        let data = data(
            rows(vec![
                json!({"die": "D1", "count": 70}),
                json!({"die": "D2", "count": 60}),
                json!({"die": "D3", "count": 50}),
                json!({"die": "D4", "count": 40}),
                json!({"die": "D5", "count": 30}),
                json!({"die": "D6", "count": 20}),
                json!({"die": "D7", "count": 10}),
                json!({"die": "D8", "count": 5}),
            ]),
            vec!["PressOperations.count"],
            vec!["PressOperations.die"],
        );

        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Donut);
        assert_eq!(chart.categories.len(), DONUT_MAX_SLICES);
        assert_eq!(chart.categories.last().unwrap(), "Other");
        // 20 + 10 + 5 folded together.
        assert_eq!(*chart.series[0].values.last().unwrap(), 35.0);
    }

    #[test]
    fn rate_breakdown_becomes_bar() {
        let data = data(
            rows(vec![
                json!({"pressLine": "Line A", "defectRate": 2.1}),
                json!({"pressLine": "Line B", "defectRate": 3.4}),
            ]),
            vec!["PressOperations.defectRate"],
            vec!["PressOperations.pressLine"],
        );

        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Bar);
        assert_eq!(chart.categories, vec!["Line A", "Line B"]);
        assert_eq!(chart.value_format, ValueFormat::Percent);
        assert_eq!(chart.x_label.as_deref(), Some("Press Line"));
    }

    #[test]
    fn oversized_breakdown_becomes_table_with_other_row() {
        let many: Vec<serde_json::Value> = (0..30)
            .map(|i| json!({"die": format!("D{i}"), "avgCycleTime": 10.0 + i as f64}))
            .collect();
        let data = data(
            rows(many),
            vec!["PressOperations.avgCycleTime"],
            vec!["PressOperations.die"],
        );

        let planner = VisualizationPlanner::new(Arc::new(MessageBus::new()), 10, 20);
        let chart = planner.decide(&data);
        assert_eq!(chart.kind, ChartKind::Table);
        assert_eq!(chart.categories.len(), 21);
        assert_eq!(chart.categories.last().unwrap(), "Other");
    }

    #[test]
    fn degraded_input_draws_nothing() {
        let mut data = data(
            rows(vec![json!({"count": 10})]),
            vec!["PressOperations.count"],
            vec![],
        );
        data.error = Some("source unavailable".to_string());
        let chart = planner().decide(&data);
        assert_eq!(chart.kind, ChartKind::Empty);
    }

    #[test]
    fn empty_result_draws_nothing() {
        let data = data(vec![], vec!["PressOperations.count"], vec![]);
        assert_eq!(planner().decide(&data).kind, ChartKind::Empty);
    }

    #[test]
    fn labels_read_like_titles() {
        assert_eq!(format_label("PressOperations.avgCycleTime"), "Avg Cycle Time");
        assert_eq!(
            format_label("PartFamilyPerformance.firstPassYield"),
            "First Pass Yield"
        );
        assert_eq!(format_label("PressOperations.oee"), "OEE");
        assert_eq!(format_label("part_family"), "Part Family");
    }

    #[test]
    fn currency_hint_for_cost_measures() {
        assert_eq!(
            value_format_for(&["PressOperations.materialCost".to_string()]),
            ValueFormat::Currency
        );
        assert_eq!(
            value_format_for(&["PressOperations.count".to_string()]),
            ValueFormat::Plain
        );
    }
}

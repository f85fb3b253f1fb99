//! Static domain catalog for press-shop analytics.
//!
//! Three data sources cover a stamping plant: `PressOperations` holds
//! production-level rows with full traceability, `PartFamilyPerformance`
//! aggregates by part type, and `PressLineUtilization` tracks line capacity
//! and shifts. The catalog maps free-text vocabulary (synonyms, entity
//! mentions, time phrases) onto canonical measure and dimension members so
//! the planner never guesses column names.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::entity::{EntityCategory, EntityUpdate};
use crate::messages::{TimeGrain, TimeRange};

// ============================================================================
// Source specifications
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct MeasureSpec {
    /// Canonical name used in enriched requests ("pass_rate").
    pub name: &'static str,
    /// Fully qualified source member ("PressOperations.passRate").
    pub member: &'static str,
    pub synonyms: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct DimensionSpec {
    pub name: &'static str,
    pub member: &'static str,
    pub synonyms: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub name: &'static str,
    /// Lower tries first when coverage ties.
    pub priority: u8,
    pub description: &'static str,
    pub measures: &'static [MeasureSpec],
    pub dimensions: &'static [DimensionSpec],
    pub default_measure: &'static str,
    pub time_column: &'static str,
}

pub const SOURCES: &[SourceSpec] = &[
    SourceSpec {
        name: "PressOperations",
        priority: 0,
        description: "production-level data with full traceability",
        measures: &[
            MeasureSpec {
                name: "count",
                member: "PressOperations.count",
                synonyms: &["count", "volume", "production_volume", "parts_produced"],
            },
            MeasureSpec {
                name: "pass_rate",
                member: "PressOperations.passRate",
                synonyms: &["pass_rate", "yield"],
            },
            MeasureSpec {
                name: "oee",
                member: "PressOperations.oee",
                synonyms: &["oee", "overall_equipment_effectiveness", "efficiency"],
            },
            MeasureSpec {
                name: "availability",
                member: "PressOperations.availability",
                synonyms: &["availability"],
            },
            MeasureSpec {
                name: "performance",
                member: "PressOperations.performance",
                synonyms: &["performance"],
            },
            MeasureSpec {
                name: "quality_rate",
                member: "PressOperations.qualityRate",
                synonyms: &["quality_rate", "quality"],
            },
            MeasureSpec {
                name: "defect_rate",
                member: "PressOperations.defectRate",
                synonyms: &["defect_rate", "defect", "defects", "scrap", "scrap_rate"],
            },
            MeasureSpec {
                name: "tonnage",
                member: "PressOperations.avgTonnage",
                synonyms: &["tonnage"],
            },
            MeasureSpec {
                name: "cycle_time",
                member: "PressOperations.avgCycleTime",
                synonyms: &["cycle_time"],
            },
            MeasureSpec {
                name: "material_cost",
                member: "PressOperations.materialCost",
                synonyms: &["material_cost"],
            },
            MeasureSpec {
                name: "labor_cost",
                member: "PressOperations.laborCost",
                synonyms: &["labor_cost", "labour_cost"],
            },
            MeasureSpec {
                name: "energy_cost",
                member: "PressOperations.energyCost",
                synonyms: &["energy_cost"],
            },
        ],
        dimensions: &[
            DimensionSpec {
                name: "part_family",
                member: "PressOperations.partFamily",
                synonyms: &["part_family", "part_families", "part", "parts", "family"],
            },
            DimensionSpec {
                name: "press_line",
                member: "PressOperations.pressLine",
                synonyms: &["press_line", "line", "lines", "press"],
            },
            DimensionSpec {
                name: "die",
                member: "PressOperations.die",
                synonyms: &["die", "dies"],
            },
            DimensionSpec {
                name: "material_grade",
                member: "PressOperations.materialGrade",
                synonyms: &["material_grade", "material", "grade"],
            },
            DimensionSpec {
                name: "coil",
                member: "PressOperations.coil",
                synonyms: &["coil", "coils"],
            },
            DimensionSpec {
                name: "shift",
                member: "PressOperations.shift",
                synonyms: &["shift", "shifts"],
            },
            DimensionSpec {
                name: "operator",
                member: "PressOperations.operator",
                synonyms: &["operator", "operators"],
            },
            DimensionSpec {
                name: "defect_type",
                member: "PressOperations.defectType",
                synonyms: &["defect_type", "defect_types"],
            },
        ],
        default_measure: "count",
        time_column: "PressOperations.productionDate",
    },
    SourceSpec {
        name: "PartFamilyPerformance",
        priority: 1,
        description: "aggregated performance by part type",
        measures: &[
            MeasureSpec {
                name: "count",
                member: "PartFamilyPerformance.count",
                synonyms: &["count"],
            },
            MeasureSpec {
                name: "first_pass_yield",
                member: "PartFamilyPerformance.firstPassYield",
                synonyms: &["first_pass_yield", "fpy"],
            },
            MeasureSpec {
                name: "rework_rate",
                member: "PartFamilyPerformance.reworkRate",
                synonyms: &["rework_rate", "rework"],
            },
            MeasureSpec {
                name: "oee",
                member: "PartFamilyPerformance.oee",
                synonyms: &["oee"],
            },
            MeasureSpec {
                name: "cost_per_part",
                member: "PartFamilyPerformance.costPerPart",
                synonyms: &["cost_per_part", "cost", "costs"],
            },
            MeasureSpec {
                name: "coil_defect_rate",
                member: "PartFamilyPerformance.coilDefectRate",
                synonyms: &["coil_defect_rate"],
            },
        ],
        dimensions: &[
            DimensionSpec {
                name: "part_family",
                member: "PartFamilyPerformance.partFamily",
                synonyms: &["part_family", "part_families", "part", "parts", "family"],
            },
            DimensionSpec {
                name: "part_type",
                member: "PartFamilyPerformance.partType",
                synonyms: &["part_type"],
            },
            DimensionSpec {
                name: "material_grade",
                member: "PartFamilyPerformance.materialGrade",
                synonyms: &["material_grade", "material", "grade"],
            },
        ],
        default_measure: "count",
        time_column: "PartFamilyPerformance.periodStart",
    },
    SourceSpec {
        name: "PressLineUtilization",
        priority: 2,
        description: "press line capacity and shift analysis",
        measures: &[
            MeasureSpec {
                name: "count",
                member: "PressLineUtilization.count",
                synonyms: &["count"],
            },
            MeasureSpec {
                name: "oee",
                member: "PressLineUtilization.oee",
                synonyms: &["oee"],
            },
            MeasureSpec {
                name: "utilization_rate",
                member: "PressLineUtilization.utilizationRate",
                synonyms: &["utilization_rate", "utilization", "capacity"],
            },
            MeasureSpec {
                name: "parts_per_day",
                member: "PressLineUtilization.partsPerDay",
                synonyms: &["parts_per_day", "throughput", "daily_output"],
            },
        ],
        dimensions: &[
            DimensionSpec {
                name: "press_line",
                member: "PressLineUtilization.pressLine",
                synonyms: &["press_line", "line", "lines", "press"],
            },
            DimensionSpec {
                name: "part_type",
                member: "PressLineUtilization.partType",
                synonyms: &["part_type"],
            },
            DimensionSpec {
                name: "shift",
                member: "PressLineUtilization.shift",
                synonyms: &["shift", "shifts"],
            },
            DimensionSpec {
                name: "day_type",
                member: "PressLineUtilization.dayType",
                synonyms: &["day_type", "weekend", "weekday"],
            },
        ],
        default_measure: "count",
        time_column: "PressLineUtilization.periodStart",
    },
];

impl SourceSpec {
    pub fn resolve_measure(&self, term: &str) -> Option<&'static MeasureSpec> {
        let term = normalize(term);
        self.measures
            .iter()
            .find(|m| m.name == term || m.synonyms.contains(&term.as_str()))
    }

    pub fn resolve_dimension(&self, term: &str) -> Option<&'static DimensionSpec> {
        let term = normalize(term);
        self.dimensions
            .iter()
            .find(|d| d.name == term || d.synonyms.contains(&term.as_str()))
    }

    fn coverage(&self, metrics: &[String], dimensions: &[String]) -> usize {
        let measures = metrics
            .iter()
            .filter(|m| self.resolve_measure(m).is_some())
            .count();
        let dims = dimensions
            .iter()
            .filter(|d| self.resolve_dimension(d).is_some())
            .count();
        measures + dims
    }
}

/// Lowercase, trim, and join words with underscores so "Pass Rate",
/// "pass-rate", and "pass_rate" resolve alike.
fn normalize(term: &str) -> String {
    term.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '.')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn source_by_name(name: &str) -> Option<&'static SourceSpec> {
    SOURCES.iter().find(|s| s.name == name)
}

/// Canonical metric name for a term, searched across all sources.
pub fn resolve_metric_name(term: &str) -> Option<&'static str> {
    SOURCES
        .iter()
        .find_map(|s| s.resolve_measure(term))
        .map(|m| m.name)
}

/// Canonical dimension name for a term, searched across all sources.
pub fn resolve_dimension_name(term: &str) -> Option<&'static str> {
    SOURCES
        .iter()
        .find_map(|s| s.resolve_dimension(term))
        .map(|d| d.name)
}

/// Sources ordered by how much of the request they cover, then by priority.
/// The planner tries them in order and degrades after the last.
pub fn candidate_sources(metrics: &[String], dimensions: &[String]) -> Vec<&'static SourceSpec> {
    let mut candidates: Vec<&'static SourceSpec> = SOURCES.iter().collect();
    candidates.sort_by(|a, b| {
        b.coverage(metrics, dimensions)
            .cmp(&a.coverage(metrics, dimensions))
            .then(a.priority.cmp(&b.priority))
    });
    candidates
}

// ============================================================================
// Entity lexicon
// ============================================================================

pub const PART_FAMILIES: &[&str] = &["Door_Outer_Left", "Door_Outer_Right", "Bonnet_Outer"];

pub const PRESS_LINES: &[&str] = &["Line A", "Line B"];

pub const DEFECT_TYPES: &[&str] = &["springback", "burr", "crack", "warp", "scratch"];

/// Metric keyword table, first match wins. Longer phrases come first so
/// "first pass yield" is not swallowed by "pass rate".
const METRIC_KEYWORDS: &[(&str, &str)] = &[
    ("first pass yield", "first_pass_yield"),
    ("pass rate", "pass_rate"),
    ("cycle time", "cycle_time"),
    ("cost per part", "cost_per_part"),
    ("utilization", "utilization_rate"),
    ("throughput", "parts_per_day"),
    ("tonnage", "tonnage"),
    ("oee", "oee"),
    ("efficiency", "oee"),
    ("rework", "rework_rate"),
    ("defect", "defect_rate"),
    ("scrap", "defect_rate"),
    ("quality", "quality_rate"),
    ("cost", "cost_per_part"),
];

const TIME_KEYWORDS: &[(&str, &str)] = &[
    ("yesterday", "yesterday"),
    ("today", "today"),
    ("last week", "last_7_days"),
    ("last 7 days", "last_7_days"),
    ("last month", "last_30_days"),
    ("last 30 days", "last_30_days"),
    ("this week", "current_week"),
    ("this month", "current_month"),
];

/// Extract canonical entity mentions from user text. One call produces one
/// update batch for the session's tracker.
pub fn extract_entities(text: &str) -> Vec<EntityUpdate> {
    let lower = text.to_lowercase();
    let mut updates = Vec::new();

    let mut parts = Vec::new();
    if lower.contains("door") {
        if lower.contains("left") {
            parts.push("Door_Outer_Left".to_string());
        }
        if lower.contains("right") {
            parts.push("Door_Outer_Right".to_string());
        }
        if parts.is_empty() {
            // "doors" with no side means both.
            parts.push("Door_Outer_Left".to_string());
            parts.push("Door_Outer_Right".to_string());
        }
    }
    if lower.contains("bonnet") {
        parts.push("Bonnet_Outer".to_string());
    }
    if !parts.is_empty() {
        updates.push(EntityUpdate::new(EntityCategory::PartFamilies, parts));
    }

    if let Some((_, metric)) = METRIC_KEYWORDS.iter().find(|(kw, _)| lower.contains(kw)) {
        updates.push(EntityUpdate::single(EntityCategory::Metric, *metric));
    }

    if lower.contains("line a") || lower.contains("800t") {
        updates.push(EntityUpdate::single(EntityCategory::Line, "Line A"));
    } else if lower.contains("line b") || lower.contains("1200t") {
        updates.push(EntityUpdate::single(EntityCategory::Line, "Line B"));
    }

    if let Some((_, period)) = TIME_KEYWORDS.iter().find(|(kw, _)| lower.contains(kw)) {
        updates.push(EntityUpdate::single(EntityCategory::TimePeriod, *period));
    }

    updates
}

/// Defect types named in the text, for filter construction.
pub fn detect_defect_types(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    DEFECT_TYPES
        .iter()
        .filter(|d| lower.contains(*d))
        .map(|d| d.to_string())
        .collect()
}

// ============================================================================
// Time windows
// ============================================================================

/// Turn a canonical period label into concrete bounds relative to `now`.
pub fn resolve_time_range(label: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    let midnight = |d: chrono::NaiveDate| {
        Utc.with_ymd_and_hms(d.year(), d.month(), d.day(), 0, 0, 0)
            .single()
    };
    let today = now.date_naive();

    let (start, end, grain) = match label {
        "today" => (midnight(today)?, now, TimeGrain::Hour),
        "yesterday" => {
            let start = midnight(today - Duration::days(1))?;
            (start, midnight(today)?, TimeGrain::Hour)
        }
        "last_7_days" => (now - Duration::days(7), now, TimeGrain::Day),
        "last_30_days" => (now - Duration::days(30), now, TimeGrain::Day),
        "current_week" => {
            let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            (midnight(monday)?, now, TimeGrain::Day)
        }
        "current_month" => (midnight(today.with_day(1)?)?, now, TimeGrain::Day),
        _ => return None,
    };

    Some(TimeRange {
        label: label.to_string(),
        start: Some(start),
        end: Some(end),
        grain: Some(grain),
    })
}

// ============================================================================
// Follow-up suggestions
// ============================================================================

const FOLLOW_UP_TABLE: &[(&[&str], &[&str])] = &[
    (
        &["oee", "efficiency"],
        &[
            "What's the OEE breakdown by availability, performance, and quality?",
            "Compare OEE by shift",
            "Show me OEE trends over time",
        ],
    ),
    (
        &["pass rate", "quality"],
        &[
            "Which defect types are most common?",
            "What's the first pass yield by part family?",
            "Show me quality trends over time",
        ],
    ),
    (
        &["part", "door", "bonnet"],
        &[
            "Compare cost per part across part families",
            "Which part family has the best OEE?",
            "Show me production volumes by part family",
        ],
    ),
    (
        &["line", "press"],
        &[
            "Compare Line A and Line B utilization",
            "What's the shift performance on each line?",
            "Show me weekend versus weekday production",
        ],
    ),
    (
        &["shift"],
        &[
            "Which shift has the highest productivity?",
            "Compare morning, afternoon, and night shift output",
            "What's the quality by shift?",
        ],
    ),
    (
        &["cost"],
        &[
            "Break down costs by material, labor, and energy",
            "Which line has the lower cost per part?",
            "Compare costs across part families",
        ],
    ),
    (
        &["defect", "scrap"],
        &[
            "Which defects require the most rework?",
            "Show me defect trends by part family",
            "What's the defect rate by material grade?",
        ],
    ),
    (
        &["material", "coil"],
        &[
            "Compare material grades by quality",
            "Which coils have the highest defect rate?",
            "What's the coil defect rate by part family?",
        ],
    ),
    (
        &["trend", "time"],
        &[
            "What's the overall OEE?",
            "Compare part families by quality",
            "Show me shift productivity",
        ],
    ),
];

const DEFAULT_FOLLOW_UPS: &[&str] = &[
    "What's the OEE for each press line?",
    "Which part family has the best quality?",
    "Compare shift performance",
];

/// Keyword-matched follow-up questions for the final response.
pub fn suggest_follow_ups(question: &str, max: usize) -> Vec<String> {
    let lower = question.to_lowercase();
    let mut suggestions: Vec<String> = Vec::new();
    for (keywords, follow_ups) in FOLLOW_UP_TABLE {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            for follow_up in *follow_ups {
                if suggestions.len() < max && !suggestions.contains(&follow_up.to_string()) {
                    suggestions.push(follow_up.to_string());
                }
            }
        }
        if suggestions.len() >= max {
            break;
        }
    }
    if suggestions.is_empty() {
        suggestions = DEFAULT_FOLLOW_UPS
            .iter()
            .take(max)
            .map(|s| s.to_string())
            .collect();
    }
    suggestions
}

/// One-paragraph description of what the system can answer, for
/// conversational turns asking about capabilities.
pub fn capabilities_text() -> String {
    let mut lines = vec![
        "I analyze press-shop production data across three sources:".to_string(),
    ];
    for source in SOURCES {
        let measures: Vec<&str> = source.measures.iter().map(|m| m.name).take(6).collect();
        lines.push(format!(
            "- {} ({}): {}",
            source.name,
            source.description,
            measures.join(", ")
        ));
    }
    lines.push("Try asking about OEE, pass rates, defect trends, or cost per part.".to_string());
    lines.join("\n")
}

//! Conversational entity tracking.
//!
//! Each session carries one [`EntityTracker`]. Every enriched turn applies a
//! batch of category updates: list categories accumulate values most recent
//! first, exclusive categories hold a single current value. Pronouns in later
//! turns ("these", "it") resolve against this state.
//!
//! Recency is kept at batch granularity. A turn that mentions
//! `[Left, Right]` prepends the whole batch in its stated order, so a
//! follow-up "these" means `[Left, Right]`, not `[Right, Left]`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Categories
// ============================================================================

/// Tracked entity categories, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    PartFamilies,
    Metric,
    Line,
    TimePeriod,
}

/// How a category absorbs new values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryKind {
    /// Values accumulate; newer mentions sit in front of older ones.
    Accumulating,
    /// A single current value; each update replaces the previous one.
    Exclusive,
}

impl EntityCategory {
    /// Resolution priority when two categories were touched by the same
    /// turn: part families, then metric, then line, then time period.
    pub const PRIORITY: [EntityCategory; 4] = [
        EntityCategory::PartFamilies,
        EntityCategory::Metric,
        EntityCategory::Line,
        EntityCategory::TimePeriod,
    ];

    pub fn kind(self) -> CategoryKind {
        match self {
            EntityCategory::PartFamilies => CategoryKind::Accumulating,
            EntityCategory::Metric | EntityCategory::Line | EntityCategory::TimePeriod => {
                CategoryKind::Exclusive
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityCategory::PartFamilies => "part_families",
            EntityCategory::Metric => "metric",
            EntityCategory::Line => "line",
            EntityCategory::TimePeriod => "time_period",
        }
    }

    fn priority_rank(self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|c| *c == self)
            .unwrap_or(Self::PRIORITY.len())
    }
}

impl std::fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Pronoun references
// ============================================================================

/// What kind of anaphoric reference a piece of text carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// "these", "those", "them": the full current list.
    Plural,
    /// "it", "that one", "this one": the single most recent value.
    Singular,
}

static PLURAL_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(these|those|them)\b").unwrap());

static SINGULAR_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(it|that one|this one)\b").unwrap());

/// Detect a pronoun reference in user text. Plural wins when both appear.
pub fn detect_reference(text: &str) -> Option<ReferenceKind> {
    if PLURAL_REFERENCE.is_match(text) {
        Some(ReferenceKind::Plural)
    } else if SINGULAR_REFERENCE.is_match(text) {
        Some(ReferenceKind::Singular)
    } else {
        None
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// One category update extracted from a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub category: EntityCategory,
    pub values: Vec<String>,
}

impl EntityUpdate {
    pub fn new(category: EntityCategory, values: Vec<String>) -> Self {
        Self { category, values }
    }

    pub fn single(category: EntityCategory, value: impl Into<String>) -> Self {
        Self {
            category,
            values: vec![value.into()],
        }
    }
}

/// A reference resolved against tracker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    pub category: EntityCategory,
    pub values: Vec<String>,
}

/// Per-session entity state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityTracker {
    values: HashMap<EntityCategory, Vec<String>>,
    revisions: HashMap<EntityCategory, u64>,
    /// Batch sequence at which each category was last touched.
    last_touch: HashMap<EntityCategory, u64>,
    batch_seq: u64,
}

impl EntityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one turn's updates as a single batch. Updates with no usable
    /// values leave their category untouched.
    pub fn apply(&mut self, updates: &[EntityUpdate]) {
        let mut touched = false;
        let seq = self.batch_seq + 1;

        for update in updates {
            let incoming: Vec<String> = dedup_preserving_order(
                update
                    .values
                    .iter()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
            if incoming.is_empty() {
                continue;
            }
            touched = true;

            match update.category.kind() {
                CategoryKind::Accumulating => {
                    let current = self.values.entry(update.category).or_default();
                    let mut merged = incoming.clone();
                    merged.extend(
                        current
                            .iter()
                            .filter(|v| !incoming.contains(v))
                            .cloned(),
                    );
                    *current = merged;
                }
                CategoryKind::Exclusive => {
                    // The last mention in the batch is the most recent.
                    let value = incoming.last().cloned();
                    if let Some(value) = value {
                        self.values.insert(update.category, vec![value]);
                    }
                }
            }
            *self.revisions.entry(update.category).or_insert(0) += 1;
            self.last_touch.insert(update.category, seq);
        }

        if touched {
            self.batch_seq = seq;
        }
    }

    /// Current values for a category, most recent first.
    pub fn get(&self, category: EntityCategory) -> &[String] {
        self.values.get(&category).map_or(&[], Vec::as_slice)
    }

    /// Number of updates a category has absorbed.
    pub fn revision(&self, category: EntityCategory) -> u64 {
        self.revisions.get(&category).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(Vec::is_empty)
    }

    /// Resolve a pronoun reference against current state. A plural reference
    /// binds to list categories, a singular one to exclusive categories;
    /// within the matching kind the most recently touched non-empty category
    /// wins, and same-turn ties fall back to the fixed priority order. A
    /// reference with no candidate of its own kind binds to the most recent
    /// category of the other kind.
    pub fn resolve(&self, kind: ReferenceKind) -> Option<ResolvedReference> {
        let wanted = match kind {
            ReferenceKind::Plural => CategoryKind::Accumulating,
            ReferenceKind::Singular => CategoryKind::Exclusive,
        };
        let category = self
            .most_recent_category(|c| c.kind() == wanted)
            .or_else(|| self.most_recent_category(|_| true))?;
        let values = self.get(category);
        let resolved = match kind {
            ReferenceKind::Plural => values.to_vec(),
            ReferenceKind::Singular => vec![values.first()?.clone()],
        };
        Some(ResolvedReference {
            category,
            values: resolved,
        })
    }

    fn most_recent_category(
        &self,
        eligible: impl Fn(EntityCategory) -> bool,
    ) -> Option<EntityCategory> {
        EntityCategory::PRIORITY
            .iter()
            .copied()
            .filter(|c| eligible(*c) && !self.get(*c).is_empty())
            .max_by(|a, b| {
                let touch_a = self.last_touch.get(a).copied().unwrap_or(0);
                let touch_b = self.last_touch.get(b).copied().unwrap_or(0);
                // On equal touch the LOWER priority rank must win, so compare
                // ranks reversed before handing to max_by.
                touch_a
                    .cmp(&touch_b)
                    .then_with(|| b.priority_rank().cmp(&a.priority_rank()))
            })
    }

    /// Compact one-line summary of current state, priority order, for
    /// enrichment prompts and logs.
    pub fn context_string(&self) -> String {
        let mut parts = Vec::new();
        for category in EntityCategory::PRIORITY {
            let values = self.get(category);
            if !values.is_empty() {
                parts.push(format!("{}: {}", category.as_str(), values.join(", ")));
            }
        }
        parts.join("; ")
    }
}

fn dedup_preserving_order(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

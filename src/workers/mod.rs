//! Pipeline workers.
//!
//! Each worker implements [`MessageHandler`](crate::bus::MessageHandler) for
//! one topic and publishes its result back onto the bus, so the stages stay
//! decoupled: the intent advisor never knows a planner exists, the planner
//! never knows who consumes `data_ready`. The narrative composer is the one
//! exception: it runs at the fan-in point and is invoked by the orchestrator
//! rather than subscribed.

pub mod intent;
pub mod narrative;
pub mod planner;
pub mod quality;
pub mod viz;

pub use intent::{Advice, IntentAdvisor};
pub use narrative::NarrativeComposer;
pub use planner::{plan_query, PlannedQuery, QueryPlanner};
pub use quality::QualityInspector;
pub use viz::VisualizationPlanner;

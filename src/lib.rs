//! Caliper: Conversational Analytics Coordination Engine
//!
//! An event-driven pipeline that turns natural-language questions about
//! press-shop production into charts, statistical findings, and narrative
//! answers. Specialized workers communicate over an in-process message
//! bus; a correlation map joins the parallel branches of each turn and
//! degrades gracefully when a branch is late or fails.

pub mod api;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod correlation;
pub mod entity;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod orchestrator;
pub mod services;
pub mod session;
pub mod stats;
pub mod workers;

pub use api::{create_combined_router, create_rest_router, ApiState, RestApiConfig};
pub use bus::{BusStats, HandlerFailure, MessageBus, MessageHandler};
pub use config::Config;
pub use correlation::{
    BranchEntry, CorrelationMap, CorrelationRecord, CorrelationStatus, RecordOutcome,
};
pub use entity::{EntityCategory, EntityTracker, EntityUpdate, ReferenceKind};
pub use error::{CaliperError, Result};
pub use messages::{
    AnalysisKind, AnomalyAlert, ChartKind, ChartReady, ChartSpec, Clarification, DataReady,
    EnrichedRequest, Envelope, FinalResponse, Finding, FindingTier, InsightsReady, Intent, Payload,
    RequestId, SessionId, Severity, Topic, UserQuery,
};
pub use metrics::{get_metrics, HealthCheck, HealthState, HealthStatus, Metrics};
pub use orchestrator::{build_pipeline, Orchestrator, TurnOutput};
pub use services::{
    create_inference, HttpInference, HttpQueryService, InferenceService, NullInference,
    QueryService,
};
pub use session::{SessionInfo, SessionMirror, SessionStore};
pub use workers::{
    IntentAdvisor, NarrativeComposer, QualityInspector, QueryPlanner, VisualizationPlanner,
};

//! Error types for the caliper coordination engine.

use thiserror::Error;

/// Main error type for caliper operations.
#[derive(Error, Debug)]
pub enum CaliperError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Query service error: {0}")]
    QueryService(#[from] QueryServiceError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Pipeline deadline exceeded after {0}ms")]
    PipelineDeadline(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration-related errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Refusals from the statistical routines.
///
/// `InsufficientData` and `InsufficientVariance` mean "no finding can be
/// made", not that something went wrong; callers downstream of the quality
/// worker treat them as the absence of an anomaly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("Insufficient data: need at least {needed} points, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Insufficient variance: standard deviation is zero")]
    InsufficientVariance,

    #[error("Invalid specification limits: usl {usl} must exceed lsl {lsl}")]
    InvalidSpec { usl: f64, lsl: f64 },
}

/// Session store errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Message exceeds maximum length: {got} > {max}")]
    MessageTooLong { got: usize, max: usize },

    #[error("Message is empty")]
    EmptyMessage,
}

/// Message bus and correlation errors.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Duplicate request: {0} is already in flight")]
    DuplicateRequest(String),

    #[error("Correlation record not found for request {0}")]
    UnknownRequest(String),

    #[error("Handler {handler} failed: {reason}")]
    HandlerFailed { handler: String, reason: String },
}

/// Query planning errors. Raised before any execution call is made.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Measure {measure} is not declared by source {source_name}")]
    UnknownMeasure { source_name: String, measure: String },

    #[error("Dimension {dimension} is not declared by source {source_name}")]
    UnknownDimension { source_name: String, dimension: String },

    #[error("No source can satisfy the request: {0}")]
    NoViableSource(String),

    #[error("Request was rejected: {0}")]
    Rejected(String),
}

/// Failures from the external query execution service.
#[derive(Error, Debug)]
pub enum QueryServiceError {
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Failures from the external inference service.
///
/// Call sites never propagate these to the user; every one maps to a
/// deterministic rule-based fallback.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Inference service is disabled")]
    Disabled,

    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Inference timed out after {0}ms")]
    Timeout(u64),

    #[error("Malformed inference output: {0}")]
    MalformedOutput(String),
}

/// Result type alias for caliper operations.
pub type Result<T> = std::result::Result<T, CaliperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaliperError::Config(ConfigError::MissingField(
            "query_service.base_url".to_string(),
        ));
        assert!(err.to_string().contains("query_service.base_url"));
    }

    #[test]
    fn test_error_conversion() {
        let stats_err = StatsError::InsufficientVariance;
        let err: CaliperError = stats_err.into();
        assert!(matches!(err, CaliperError::Stats(_)));
    }

    #[test]
    fn test_plan_error_display() {
        let err = PlanError::UnknownMeasure {
            source_name: "quality_summary".to_string(),
            measure: "frobnitz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("frobnitz"));
        assert!(msg.contains("quality_summary"));
        // The offending source is part of the message, not a cause chain.
        assert!(std::error::Error::source(&err).is_none());
    }
}

//! Layered TOML configuration with serde defaults.

pub mod settings;

pub use settings::{
    Config, InferenceSettings, LoggingSettings, MirrorSettings, PipelineSettings,
    QueryServiceSettings, ServerSettings, SessionSettings,
};

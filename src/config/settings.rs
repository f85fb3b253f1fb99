//! Configuration settings for the Caliper coordination engine.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub pipeline: PipelineSettings,
    pub query_service: QueryServiceSettings,
    pub inference: InferenceSettings,
    pub mirror: MirrorSettings,
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            pipeline: PipelineSettings::default(),
            query_service: QueryServiceSettings::default(),
            inference: InferenceSettings::default(),
            mirror: MirrorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::ReadFile)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations or use defaults.
    pub fn load() -> Result<Self> {
        // Try standard config locations
        let config_paths = [
            // Current directory
            PathBuf::from("config.toml"),
            PathBuf::from("caliper.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("caliper/config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".caliper/config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        if self.query_service.base_url.is_empty() {
            return Err(ConfigError::MissingField("query_service.base_url".to_string()).into());
        }

        if self.inference.enabled {
            if self.inference.base_url.is_empty() {
                return Err(ConfigError::MissingField("inference.base_url".to_string()).into());
            }
            if self.inference.model.is_empty() {
                return Err(ConfigError::MissingField("inference.model".to_string()).into());
            }
        }

        if self.session.window == 0 {
            return Err(ConfigError::Invalid("session.window must be > 0".to_string()).into());
        }
        if self.session.max_message_len == 0 {
            return Err(
                ConfigError::Invalid("session.max_message_len must be > 0".to_string()).into(),
            );
        }

        if self.pipeline.branch_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.branch_deadline_secs must be > 0".to_string(),
            )
            .into());
        }
        if self.pipeline.pipeline_deadline_secs < self.pipeline.branch_deadline_secs {
            return Err(ConfigError::Invalid(
                "pipeline.pipeline_deadline_secs must be >= branch_deadline_secs".to_string(),
            )
            .into());
        }
        if self.pipeline.row_limit == 0 || self.pipeline.query_row_limit == 0 {
            return Err(ConfigError::Invalid("row limits must be > 0".to_string()).into());
        }

        if self.mirror.enabled && self.mirror.dir.is_empty() {
            return Err(ConfigError::MissingField("mirror.dir".to_string()).into());
        }

        Ok(())
    }

    /// Expand the transcript mirror directory path.
    pub fn mirror_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::tilde(&self.mirror.dir);
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for the HTTP listener
    pub host: String,
    /// HTTP port
    pub http_port: u16,
    /// Allow cross-origin requests (dashboard frontends)
    pub cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            cors: true,
        }
    }
}

/// Conversation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Messages retained per session before the oldest are dropped
    pub window: usize,
    /// Idle minutes before a session expires
    pub ttl_minutes: u64,
    /// How often the expiry sweep runs
    pub sweep_interval_secs: u64,
    /// Maximum accepted length of one user message
    pub max_message_len: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            window: 30,
            ttl_minutes: 30,
            sweep_interval_secs: 60,
            max_message_len: 500,
        }
    }
}

/// Turn pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Seconds the fan-in waits for both branches before degrading
    pub branch_deadline_secs: u64,
    /// Seconds a whole turn may take before the caller gets a partial reply
    pub pipeline_deadline_secs: u64,
    /// Row cap sent with every data query
    pub query_row_limit: usize,
    /// Rows above which a bar chart becomes a table
    pub row_limit: usize,
    /// Rows shown in a table before the remainder is aggregated
    pub table_row_limit: usize,
    /// Follow-up suggestions attached to a response
    pub max_follow_ups: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            branch_deadline_secs: 10,
            pipeline_deadline_secs: 30,
            query_row_limit: 1000,
            row_limit: 10,
            table_row_limit: 20,
            max_follow_ups: 3,
        }
    }
}

/// Analytical query service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryServiceSettings {
    /// Base URL of the query API
    pub base_url: String,
    /// Bearer token (loaded from environment if not set)
    pub api_token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Seconds the source metadata response is cached
    pub meta_ttl_secs: u64,
}

impl Default for QueryServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000/cubejs-api/v1".to_string(),
            api_token: None,
            timeout_secs: 15,
            meta_ttl_secs: 300,
        }
    }
}

/// Optional language-model configuration. Disabled by default; every
/// consumer has a deterministic fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Enable language-model assistance
    pub enabled: bool,
    /// Base URL of the completion API
    pub base_url: String,
    /// Model name
    pub model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 20,
        }
    }
}

/// On-disk transcript mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    /// Enable the transcript mirror
    pub enabled: bool,
    /// Directory for per-session JSONL transcripts
    pub dir: String,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: "~/.local/share/caliper/transcripts".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.session.window, 30);
        assert_eq!(config.pipeline.branch_deadline_secs, 10);
        assert!(!config.inference.enabled);
        assert!(!config.mirror.enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [server]
            http_port = 9090

            [session]
            window = 10
            ttl_minutes = 5

            [pipeline]
            branch_deadline_secs = 3
            pipeline_deadline_secs = 8

            [query_service]
            base_url = "http://cube.internal:4000/cubejs-api/v1"
            timeout_secs = 5
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.session.window, 10);
        assert_eq!(config.pipeline.branch_deadline_secs, 3);
        assert_eq!(
            config.query_service.base_url,
            "http://cube.internal:4000/cubejs-api/v1"
        );
        // Unset sections keep their defaults.
        assert_eq!(config.pipeline.row_limit, 10);
    }

    #[test]
    fn test_validate_missing_query_url() {
        let toml = r#"
            [query_service]
            base_url = ""
        "#;

        let result = Config::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_inference_needs_model() {
        let toml = r#"
            [inference]
            enabled = true
            base_url = "http://localhost:11434"
            model = ""
        "#;

        let result = Config::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_deadline_ordering() {
        let toml = r#"
            [pipeline]
            branch_deadline_secs = 30
            pipeline_deadline_secs = 10
        "#;

        let result = Config::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_mirror_dir_expansion() {
        let config = Config::default();
        let dir = config.mirror_dir().unwrap();
        assert!(dir.to_string_lossy().ends_with("caliper/transcripts"));
    }
}

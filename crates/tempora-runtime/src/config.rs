//! Engine configuration and logging setup.
//!
//! Supports YAML and TOML, picked by file extension.
//!
//! Example YAML config:
//! ```yaml
//! ingress:
//!   disorder: adjust
//!   reorder_latency: 50
//!   punctuation_period: 100
//!   on_completed: end_of_stream
//!
//! checkpoint:
//!   format: json
//!   directory: /var/lib/tempora/checkpoints
//!   retention: 5
//!
//! pattern:
//!   max_live_instances: 10000
//!
//! logging:
//!   level: debug
//!   json: true
//! ```

use crate::afa::Afa;
use crate::codec::CheckpointFormat;
use crate::ingress::{DisorderMode, DisorderPolicy, IngressPolicy, OnCompletedPolicy, PunctuationPolicy};
use crate::persistence::{CheckpointError, FileStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for inputs registered without an explicit policy
    pub ingress: IngressConfig,

    pub checkpoint: CheckpointConfig,

    pub pattern: PatternConfig,

    pub logging: LoggingConfig,
}

/// Default ingress policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub disorder: DisorderMode,

    /// Ticks of disorder absorbed by the reorder buffer
    pub reorder_latency: i64,

    /// Generate a punctuation each time the watermark crosses a multiple
    /// of this period
    pub punctuation_period: Option<i64>,

    pub on_completed: OnCompletedPolicy,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            disorder: DisorderMode::Throw,
            reorder_latency: 0,
            punctuation_period: None,
            on_completed: OnCompletedPolicy::EndOfStream,
        }
    }
}

impl IngressConfig {
    pub fn policy(&self) -> IngressPolicy {
        let disorder = DisorderPolicy {
            mode: self.disorder,
            reorder_latency: 0,
        }
        .with_reorder_latency(self.reorder_latency);
        let punctuation = match self.punctuation_period {
            Some(period) if period > 0 => PunctuationPolicy::Time { period },
            _ => PunctuationPolicy::None,
        };
        IngressPolicy::new(disorder, punctuation).with_on_completed(self.on_completed)
    }
}

/// Checkpoint encoding and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub format: CheckpointFormat,

    /// Root directory of the file store
    pub directory: Option<PathBuf>,

    /// Checkpoints kept per query after each save (0 keeps all)
    pub retention: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            format: CheckpointFormat::Json,
            directory: None,
            retention: 3,
        }
    }
}

impl CheckpointConfig {
    /// Opens the configured file store, if a directory is set.
    pub fn open_store(&self) -> Result<Option<FileStore>, CheckpointError> {
        self.directory.as_ref().map(FileStore::open).transpose()
    }
}

/// Limits applied to pattern automata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Upper bound on simultaneously live instances per matcher
    pub max_live_instances: Option<usize>,
}

impl PatternConfig {
    /// Applies the configured limits to an automaton under construction.
    pub fn apply<T, R>(&self, afa: Afa<T, R>) -> Afa<T, R> {
        match self.max_live_instances {
            Some(max) => afa.with_max_live_instances(max),
            None => afa,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Installs the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dispatch::RetryPolicy;

/// Main configuration structure for Labflow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabflowConfig {
    /// Ledger storage settings
    pub storage: StorageConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Report dispatch settings
    pub dispatch: DispatchConfig,
    /// Worklist presentation settings
    pub worklist: WorklistConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding the append-only JSONL ledgers
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Enable tracing output
    pub tracing_enabled: bool,
    /// Log level
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Start delivery automatically when an authorized sample carries
    /// channel preferences
    pub auto_dispatch: bool,
    /// Timeout for a single sink call in seconds; a timeout counts as a
    /// failed attempt
    pub sink_timeout_seconds: u64,
    /// Retry policy for failed deliveries
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempt budget per (report, channel), manual retries included
    pub max_attempts: u32,
    /// Base delay for exponential backoff in seconds
    pub base_delay_seconds: u64,
    /// Backoff ceiling in seconds
    pub max_delay_seconds: u64,
    /// Randomize delays to avoid thundering herd
    pub jitter: bool,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: std::time::Duration::from_secs(self.base_delay_seconds),
            max_delay: std::time::Duration::from_secs(self.max_delay_seconds),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorklistConfig {
    /// Rows per worklist page
    pub page_size: u32,
}

impl Default for LabflowConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                data_dir: ".labflow/ledgers".to_string(),
            },
            observability: ObservabilityConfig {
                tracing_enabled: true,
                log_level: "info".to_string(),
                json_logs: false,
            },
            dispatch: DispatchConfig {
                auto_dispatch: true,
                sink_timeout_seconds: 30,
                retry: RetryConfig {
                    max_attempts: 5,
                    base_delay_seconds: 30,
                    max_delay_seconds: 900, // 15 minutes
                    jitter: true,
                },
            },
            worklist: WorklistConfig { page_size: 10 },
        }
    }
}

impl LabflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (labflow.toml, .labflowrc)
    /// 3. Environment variables (prefixed with LABFLOW_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&LabflowConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("labflow.toml").exists() {
            builder = builder.add_source(File::with_name("labflow"));
        }

        if Path::new(".labflowrc").exists() {
            builder = builder.add_source(File::with_name(".labflowrc"));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("LABFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut labflow_config: LabflowConfig = config.try_deserialize()?;

        // Plain LABFLOW_DATA_DIR is the common deployment override
        if let Ok(data_dir) = std::env::var("LABFLOW_DATA_DIR") {
            labflow_config.storage.data_dir = data_dir;
        }

        Ok(labflow_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<LabflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = LabflowConfig::load_env_file();
        LabflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static LabflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

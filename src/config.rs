use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::module::policy::{ExceptionPolicy, OnExceptionBehaviour, PerformancePolicy};
use crate::module::ModuleDefaults;

/// Main configuration structure for Tickframe
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Module time limits
    pub performance: PerformanceConfig,
    /// Default fault handling for modules that do not set their own
    pub exceptions: ExceptionConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Host loop settings used by the bundled binary
    pub tick: TickConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PerformanceConfig {
    /// Per-tick budget for batched phases, in milliseconds
    pub max_tick_budget_ms: Option<u64>,
    /// Initialization stall timeout, in milliseconds
    pub init_stall_timeout_ms: Option<u64>,
    /// Unload stall timeout, in milliseconds
    pub unload_stall_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExceptionConfig {
    pub on_load: OnExceptionBehaviour,
    pub on_update: OnExceptionBehaviour,
    pub on_unload: OnExceptionBehaviour,
    pub skip_unload_if_exception: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive
    pub log_level: String,
    /// Emit JSON log lines
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TickConfig {
    /// Interval between ticks, in milliseconds
    pub interval_ms: u64,
    /// Run a fixed tick every N regular ticks (0 disables)
    pub fixed_every: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_tick_budget_ms: Some(8),
            init_stall_timeout_ms: Some(30_000),
            unload_stall_timeout_ms: Some(30_000),
        }
    }
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            on_load: OnExceptionBehaviour::UnloadModule,
            on_update: OnExceptionBehaviour::Continue,
            on_unload: OnExceptionBehaviour::Continue,
            skip_unload_if_exception: true,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_ms: 16,
            fixed_every: 4,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            performance: PerformanceConfig::default(),
            exceptions: ExceptionConfig::default(),
            observability: ObservabilityConfig::default(),
            tick: TickConfig::default(),
        }
    }
}

impl PerformanceConfig {
    pub fn policy(&self) -> PerformancePolicy {
        PerformancePolicy {
            max_tick_budget: self.max_tick_budget_ms.map(Duration::from_millis),
            init_stall_timeout: self.init_stall_timeout_ms.map(Duration::from_millis),
            unload_stall_timeout: self.unload_stall_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl ExceptionConfig {
    pub fn policy(&self) -> ExceptionPolicy {
        ExceptionPolicy {
            on_load: self.on_load,
            on_update: self.on_update,
            on_unload: self.on_unload,
            skip_unload_if_exception: self.skip_unload_if_exception,
            fallback: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (tickframe.toml, .tickframe-rc)
    /// 3. Environment variables (prefixed with TICKFRAME_, `__` between sections)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&RuntimeConfig::default())?);

        if Path::new("tickframe.toml").exists() {
            builder = builder.add_source(File::with_name("tickframe"));
        }

        if Path::new(".tickframe-rc").exists() {
            builder = builder.add_source(
                File::with_name(".tickframe-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("TICKFRAME")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load defaults overlaid with a single file, ignoring the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&RuntimeConfig::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?;
        Ok(config.try_deserialize()?)
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

    pub fn module_defaults(&self) -> ModuleDefaults {
        ModuleDefaults {
            exception_policy: self.exceptions.policy(),
            performance_policy: self.performance.policy(),
        }
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<RuntimeConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = RuntimeConfig::load_env_file();
        RuntimeConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static RuntimeConfig> {
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

//! Runtime configuration.
//!
//! Configuration can be built in code, or loaded from TOML with `GPUHOST_*`
//! environment overrides:
//!
//! ```toml
//! init_flags = 0
//! default_device = 0
//! report_release_failures = true
//! default_stream_priority = 0
//! ```

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::platform::DeviceId;

const ENV_PREFIX: &str = "GPUHOST";

/// Settings applied when a [`Runtime`](crate::runtime::Runtime) is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Flags passed to driver initialisation (must currently be 0 for CUDA).
    #[serde(default)]
    pub init_flags: u32,

    /// Device reported as current when no context is active on a thread.
    #[serde(default)]
    pub default_device: u32,

    /// Log swallowed release failures at `warn` instead of `debug`.
    #[serde(default = "default_report_release_failures")]
    pub report_release_failures: bool,

    /// Priority of streams created without an explicit one.
    #[serde(default)]
    pub default_stream_priority: i32,
}

fn default_report_release_failures() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            init_flags: 0,
            default_device: 0,
            report_release_failures: default_report_release_failures(),
            default_stream_priority: 0,
        }
    }
}

impl RuntimeConfig {
    /// Start a builder from defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load from a TOML file, then apply `GPUHOST_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn load_from_str(content: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Read `GPUHOST_*` environment variables only.
    pub fn from_env() -> Result<Self> {
        let builder =
            Config::builder().add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Device reported as current when nothing is.
    pub fn default_device(&self) -> DeviceId {
        DeviceId(self.default_device)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.init_flags != 0 {
            return Err(Error::Config(format!(
                "init_flags must be 0, got {}",
                self.init_flags
            )));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the driver initialisation flags.
    #[must_use]
    pub fn with_init_flags(mut self, flags: u32) -> Self {
        self.config.init_flags = flags;
        self
    }

    /// Sets the fallback current device.
    #[must_use]
    pub fn with_default_device(mut self, device: u32) -> Self {
        self.config.default_device = device;
        self
    }

    /// Chooses the log level of swallowed release failures.
    #[must_use]
    pub fn with_release_failure_reports(mut self, enabled: bool) -> Self {
        self.config.report_release_failures = enabled;
        self
    }

    /// Sets the default stream priority.
    #[must_use]
    pub fn with_default_stream_priority(mut self, priority: i32) -> Self {
        self.config.default_stream_priority = priority;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

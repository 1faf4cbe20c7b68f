//! Process-level entry point: driver initialisation, device enumeration and
//! primary context bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::error::{Error, Result, Status, StatusExt};
use crate::platform::{ContextHandle, DeviceId, Platform};

/// Handle to a platform plus the state shared by every proxy created from it.
///
/// Cloning is cheap; all clones refer to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

struct Shared {
    platform: Arc<dyn Platform>,
    config: RuntimeConfig,
    initialized: OnceLock<()>,
    primary_contexts: Mutex<HashMap<DeviceId, ContextHandle>>,
}

impl Runtime {
    /// Create a runtime over `platform` and initialise the driver.
    pub fn new(platform: Arc<dyn Platform>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let runtime = Self {
            shared: Arc::new(Shared {
                platform,
                config,
                initialized: OnceLock::new(),
                primary_contexts: Mutex::new(HashMap::new()),
            }),
        };
        runtime.initialize_driver()?;

        info!(
            platform = runtime.platform().name(),
            default_device = runtime.config().default_device,
            "gpuhost runtime created"
        );
        Ok(runtime)
    }

    /// Create a runtime with default configuration.
    pub fn with_platform(platform: Arc<dyn Platform>) -> Result<Self> {
        Self::new(platform, RuntimeConfig::default())
    }

    /// Initialise the driver if that has not succeeded yet.
    ///
    /// Success is remembered; a failure is returned to the caller and the next
    /// call tries again.
    pub fn initialize_driver(&self) -> Result<()> {
        if self.shared.initialized.get().is_some() {
            return Ok(());
        }
        self.platform()
            .initialize(self.shared.config.init_flags)
            .context("Failed initializing the driver")?;
        let _ = self.shared.initialized.set(());
        Ok(())
    }

    /// Number of usable devices; zero when the platform reports none.
    pub fn device_count(&self) -> Result<u32> {
        self.initialize_driver()?;
        match self.platform().device_count() {
            Ok(count) => Ok(count),
            Err(Status::NO_DEVICE) => Ok(0),
            Err(status) => Err(Error::Platform {
                status,
                message: "Failed obtaining the number of devices".to_string(),
            }),
        }
    }

    /// Look up a device by ordinal.
    pub fn device(&self, id: u32) -> Result<Device> {
        Device::get(self, DeviceId(id))
    }

    /// All devices, in ordinal order.
    pub fn devices(&self) -> Result<Vec<Device>> {
        let count = self.device_count()?;
        Ok((0..count)
            .map(|id| Device::new_unchecked(self.clone(), DeviceId(id)))
            .collect())
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The underlying driver.
    pub fn platform(&self) -> &dyn Platform {
        self.shared.platform.as_ref()
    }

    /// Primary context of `device`, retained on first use.
    pub(crate) fn primary_context(&self, device: DeviceId) -> Result<ContextHandle> {
        let mut contexts = self.shared.primary_contexts.lock();
        if let Some(context) = contexts.get(&device) {
            return Ok(*context);
        }
        let context = self
            .platform()
            .primary_context_retain(device)
            .with_context(|| format!("Failed retaining the primary context of {}", device))?;
        debug!(device = device.0, context = %context, "primary context retained");
        contexts.insert(device, context);
        Ok(context)
    }

    /// Identity of the platform instance, shared by runtimes over the same driver.
    pub(crate) fn platform_key(&self) -> usize {
        Arc::as_ptr(&self.shared.platform) as *const () as usize
    }

    /// Diagnostic channel for failures swallowed on drop.
    pub(crate) fn report_release_failure(
        &self,
        kind: &'static str,
        raw: &dyn fmt::Display,
        error: &Error,
    ) {
        if self.shared.config.report_release_failures {
            warn!(resource = kind, handle = %raw, error = %error, "release failed on drop");
        } else {
            debug!(resource = kind, handle = %raw, error = %error, "release failed on drop");
        }
    }

    /// True when both values refer to the same runtime.
    pub fn same_as(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("platform", &self.platform().name())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (device, _) in self.primary_contexts.get_mut().drain() {
            if let Err(status) = self.platform.primary_context_release(device) {
                debug!(device = device.0, %status, "primary context release failed");
            }
        }
    }
}

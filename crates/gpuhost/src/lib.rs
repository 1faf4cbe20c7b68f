//! # gpuhost
//!
//! Safe host-side control of GPU devices, streams, events, memory and
//! kernels.
//!
//! gpuhost wraps the opaque handles of an accelerator driver in proxies that
//! track ownership and device affinity, switches the thread's current context
//! with stack-disciplined guards, and sequences copies, launches and events
//! on ordered streams.
//!
//! ## Quick Start
//!
//! ```
//! use gpuhost::prelude::*;
//!
//! let runtime = gpuhost::RuntimeBuilder::new()
//!     .backend(Backend::Sim)
//!     .build()?;
//! let device = runtime.device(0)?;
//! let stream = device.create_stream(StreamConfig::non_blocking())?;
//!
//! let mut region = memory::device::allocate(&device, 1024)?;
//! stream.enqueue().zero(&mut region, 1024)?;
//! let done = stream.enqueue().event(EventFlags::sync_only())?;
//! done.synchronize()?;
//! # Ok::<(), gpuhost::Error>(())
//! ```
//!
//! ## Backends
//!
//! - **Sim** - Host-only platform, always available
//! - **CUDA** - NVIDIA GPUs through the driver API (requires `cuda` feature)
//!
//! ```toml
//! [dependencies]
//! gpuhost = { version = "0.3", features = ["cuda"] }
//! ```
//!
//! Logging goes through `tracing`; install a subscriber (for example
//! `tracing-subscriber` with `RUST_LOG=gpuhost_core=debug`) to see context
//! switches and resource lifetimes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

pub use gpuhost_core::*;

pub use gpuhost_cuda::{cuda_device_count, is_cuda_available, CudaPlatform};

#[cfg(feature = "cuda")]
pub use gpuhost_cuda::Module;

use std::fmt;

use tracing::info;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Backend, RuntimeBuilder};
    pub use gpuhost_core::prelude::*;
}

/// Which platform a [`Runtime`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// CUDA when a device is present, otherwise the simulated platform.
    #[default]
    Auto,
    /// The host-only simulated platform.
    Sim,
    /// The CUDA driver.
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Sim => write!(f, "sim"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Builder for a [`Runtime`] over a chosen backend.
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    backend: Backend,
    config: RuntimeConfig,
    sim: sim::SimConfig,
}

impl RuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: Backend::Auto,
            config: RuntimeConfig::default(),
            sim: sim::SimConfig::default(),
        }
    }

    /// Set the backend.
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the runtime configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Devices the simulated platform exposes, when it is selected.
    #[must_use]
    pub fn sim_config(mut self, sim: sim::SimConfig) -> Self {
        self.sim = sim;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<Runtime> {
        match self.backend {
            Backend::Auto => self.build_auto(),
            Backend::Sim => self.build_sim(),
            Backend::Cuda => gpuhost_cuda::cuda_runtime(self.config),
        }
    }

    fn build_auto(self) -> Result<Runtime> {
        if is_cuda_available() {
            info!("Auto-selected CUDA backend");
            return gpuhost_cuda::cuda_runtime(self.config);
        }

        info!("Auto-selected simulated backend (no GPU available)");
        self.build_sim()
    }

    fn build_sim(self) -> Result<Runtime> {
        let platform = std::sync::Arc::new(sim::SimPlatform::new(self.sim));
        Runtime::new(platform, self.config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime over the CUDA driver.
pub fn cuda_runtime(config: RuntimeConfig) -> Result<Runtime> {
    gpuhost_cuda::cuda_runtime(config)
}

/// Runtime over `devices` simulated devices, with a handle to the platform
/// for call accounting and kernel registration.
pub fn sim_runtime(devices: usize) -> Result<(Runtime, std::sync::Arc<sim::SimPlatform>)> {
    sim::simulated_runtime(devices)
}

/// Check availability of backends at runtime.
pub mod availability {
    use super::Backend;

    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        gpuhost_cuda::is_cuda_available()
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<Backend> {
        let mut backends = vec![Backend::Sim];
        if cuda() {
            backends.push(Backend::Cuda);
        }
        backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_backend_builds() {
        let runtime = RuntimeBuilder::new()
            .backend(Backend::Sim)
            .sim_config(sim::SimConfig::with_devices(vec![
                sim::SimDeviceConfig::default(),
                sim::SimDeviceConfig::default(),
            ]))
            .build()
            .unwrap();
        assert_eq!(runtime.platform().name(), "sim");
        assert_eq!(runtime.device_count().unwrap(), 2);
    }

    #[test]
    fn test_auto_falls_back_without_cuda() {
        if is_cuda_available() {
            return;
        }
        let runtime = RuntimeBuilder::default().build().unwrap();
        assert_eq!(runtime.platform().name(), "sim");
    }

    #[test]
    fn test_available_backends_always_has_sim() {
        let backends = availability::available_backends();
        assert_eq!(backends[0], Backend::Sim);
        assert_eq!(backends.contains(&Backend::Cuda), availability::cuda());
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_cuda_backend_unavailable() {
        let err = RuntimeBuilder::new().backend(Backend::Cuda).build().unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::Auto.to_string(), "auto");
        assert_eq!(Backend::Cuda.to_string(), "cuda");
    }
}

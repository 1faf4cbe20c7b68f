//! CUDA Backend for gpuhost
//!
//! This crate provides NVIDIA CUDA support for gpuhost by implementing
//! [`Platform`](gpuhost_core::Platform) over the CUDA driver API through
//! `cudarc`.
//!
//! # Features
//!
//! - `CudaPlatform`: one-to-one mapping of the driver contract onto `cu*` calls
//! - `Module`: owning PTX module that hands out non-owning [`Kernel`](gpuhost_core::Kernel)s
//!
//! # Requirements
//!
//! - NVIDIA GPU with Compute Capability 7.0+
//! - CUDA Toolkit 11.4+ (stream-ordered allocation)
//!
//! Without the `cuda` feature every constructor fails with
//! [`Error::BackendUnavailable`](gpuhost_core::Error::BackendUnavailable).
//!
//! # Example
//!
//! ```ignore
//! use gpuhost_cuda::cuda_runtime;
//!
//! let runtime = cuda_runtime(Default::default())?;
//! let device = runtime.device(0)?;
//! println!("{}: {}", device, device.name()?);
//! ```

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod module;
#[cfg(feature = "cuda")]
mod platform;

#[cfg(feature = "cuda")]
pub use module::Module;
#[cfg(feature = "cuda")]
pub use platform::CudaPlatform;

use gpuhost_core::{Result, Runtime, RuntimeConfig};

/// Create a runtime over the CUDA driver.
pub fn cuda_runtime(config: RuntimeConfig) -> Result<Runtime> {
    #[cfg(feature = "cuda")]
    {
        let platform = std::sync::Arc::new(CudaPlatform::new()?);
        Runtime::new(platform, config)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = config;
        Err(gpuhost_core::Error::BackendUnavailable(
            "CUDA feature not enabled".to_string(),
        ))
    }
}

// Placeholder implementations when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use gpuhost_core::{Error, Result};

    /// Stub CUDA platform when the CUDA feature is disabled.
    #[derive(Debug)]
    pub struct CudaPlatform;

    impl CudaPlatform {
        /// Create fails when CUDA is not available.
        pub fn new() -> Result<Self> {
            Err(Error::BackendUnavailable(
                "CUDA feature not enabled".to_string(),
            ))
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaPlatform;

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - CUDA feature is not enabled
/// - CUDA libraries are not installed on the system
/// - No CUDA devices are present
///
/// It safely catches panics from cudarc when CUDA is not installed.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or libraries are not installed.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count().unwrap_or(0) as usize
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_stub_reports_backend_unavailable() {
        assert!(matches!(
            CudaPlatform::new(),
            Err(gpuhost_core::Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            cuda_runtime(RuntimeConfig::default()),
            Err(gpuhost_core::Error::BackendUnavailable(_))
        ));
        assert!(!is_cuda_available());
        assert_eq!(cuda_device_count(), 0);
    }
}

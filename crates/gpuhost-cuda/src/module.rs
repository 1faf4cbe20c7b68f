//! Owning PTX modules.
//!
//! A [`Module`] is loaded into a device's primary context and unloaded when
//! dropped. The [`Kernel`]s it hands out do not own their functions; they
//! must not be launched after the module is gone.

use std::ffi::CString;
use std::ptr;

use cudarc::driver::sys as cuda_sys;
use tracing::{debug, warn};

use gpuhost_core::error::{Error, Result, StatusExt};
use gpuhost_core::platform::{ContextHandle, FunctionHandle};
use gpuhost_core::{Device, Kernel, ScopedOverride};

use crate::platform::check;

/// A PTX module loaded via the CUDA driver API.
pub struct Module {
    device: Device,
    context: ContextHandle,
    module: cuda_sys::CUmodule,
}

// SAFETY: a CUmodule may be used from any thread once its context is current;
// every use below installs the context first.
unsafe impl Send for Module {}

impl Module {
    /// Load PTX source into the primary context of `device`.
    pub fn load_ptx(device: &Device, ptx: &str) -> Result<Self> {
        if device.runtime().platform().name() != "cuda" {
            return Err(Error::BackendUnavailable(format!(
                "PTX modules need the CUDA platform, runtime uses '{}'",
                device.runtime().platform().name()
            )));
        }

        // PTX must be null-terminated for CUDA driver API
        let source = CString::new(ptx.strip_suffix('\0').unwrap_or(ptx))
            .map_err(|e| Error::invalid_argument(format!("PTX contains a null byte: {}", e)))?;

        let scope = ScopedOverride::device(device)?;
        let mut module: cuda_sys::CUmodule = ptr::null_mut();
        // SAFETY: `source` is NUL-terminated and outlives the call.
        check(unsafe { cuda_sys::cuModuleLoadData(&mut module, source.as_ptr() as *const _) })
            .with_context(|| format!("Failed loading a PTX module on {}", device))?;
        debug!(device = device.id().0, module = ?module, "PTX module loaded");

        Ok(Self {
            device: device.clone(),
            context: scope.target_context(),
            module,
        })
    }

    /// Device the module was loaded on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Look up a kernel by its (unmangled) name.
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let symbol = CString::new(name)
            .map_err(|e| Error::invalid_argument(format!("Invalid function name: {}", e)))?;

        let _scope = ScopedOverride::context(&self.device, self.context)?;
        let mut function: cuda_sys::CUfunction = ptr::null_mut();
        // SAFETY: `symbol` is NUL-terminated; the module is loaded.
        check(unsafe { cuda_sys::cuModuleGetFunction(&mut function, self.module, symbol.as_ptr()) })
            .with_context(|| format!("Failed resolving kernel '{}'", name))?;

        Ok(Kernel::wrap_in_context(
            &self.device,
            self.context,
            FunctionHandle(function as usize as u64),
        ))
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        let unloaded = ScopedOverride::context(&self.device, self.context).and_then(|_scope| {
            // SAFETY: loaded in `load_ptx`, unloaded exactly once.
            check(unsafe { cuda_sys::cuModuleUnload(self.module) })
                .context("Failed unloading a module")
        });
        if let Err(error) = unloaded {
            warn!(device = self.device.id().0, error = %error, "module unload failed on drop");
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("device", &self.device.id().0)
            .field("module", &self.module)
            .finish()
    }
}

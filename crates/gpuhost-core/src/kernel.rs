//! Kernel (compiled function) proxy: attributes, launch tuning and occupancy.
//!
//! Kernels never own their function; the code object that produced the
//! handle outlives the proxy. Every call that changes or depends on
//! per-context state first makes the kernel's context current.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::current::ScopedOverride;
use crate::device::{ComputeCapability, Device};
use crate::error::{Error, Result, StatusExt};
use crate::handle::Ownership;
use crate::launch::{self, KernelArgs, LaunchConfig};
use crate::platform::{
    CachePreference, ContextHandle, DeviceAttribute, FunctionAttribute, FunctionHandle,
    SharedMemoryBankSize, StreamHandle,
};
use crate::stream::Stream;

/// Every readable attribute of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAttributes {
    /// Largest block the kernel can be launched with.
    pub max_threads_per_block: u32,
    /// Static shared memory per block.
    pub shared_size_bytes: usize,
    /// Constant memory.
    pub const_size_bytes: usize,
    /// Local memory per thread.
    pub local_size_bytes: usize,
    /// Registers per thread.
    pub num_regs: u32,
    /// PTX virtual architecture.
    pub ptx_version: ComputeCapability,
    /// Binary architecture.
    pub binary_version: ComputeCapability,
    /// Global loads cached in L1.
    pub cache_mode_ca: bool,
    /// Dynamic shared memory ceiling per launch.
    pub max_dynamic_shared_size_bytes: usize,
    /// Preferred carveout in percent, `None` when the device default applies.
    pub preferred_shared_memory_carveout: Option<u32>,
}

/// Result of the occupancy search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridParams {
    /// Smallest grid that keeps every multiprocessor fully occupied.
    pub min_grid_size: u32,
    /// Block size achieving maximal occupancy.
    pub block_size: u32,
}

/// A compiled function bound to a device and context.
#[derive(Clone)]
pub struct Kernel {
    device: Device,
    context: ContextHandle,
    function: FunctionHandle,
}

impl Kernel {
    /// Wrap a function loaded in `device`'s primary context.
    pub fn wrap(device: &Device, function: FunctionHandle) -> Result<Self> {
        let context = device.primary_context()?;
        Ok(Self::wrap_in_context(device, context, function))
    }

    /// Wrap a function loaded in `context`.
    pub fn wrap_in_context(
        device: &Device,
        context: ContextHandle,
        function: FunctionHandle,
    ) -> Self {
        Self {
            device: device.clone(),
            context,
            function,
        }
    }

    /// Device the function belongs to.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Context the function belongs to.
    #[inline]
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Raw function handle.
    #[inline]
    pub fn handle(&self) -> FunctionHandle {
        self.function
    }

    fn scope(&self) -> Result<ScopedOverride> {
        ScopedOverride::context(&self.device, self.context)
    }

    /// Read one attribute.
    pub fn attribute(&self, attribute: FunctionAttribute) -> Result<i32> {
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .function_attribute(self.function, attribute)
            .with_context(|| {
                format!(
                    "Failed obtaining attribute '{}' of kernel {}",
                    attribute.name(),
                    self.function
                )
            })
    }

    fn attribute_usize(&self, attribute: FunctionAttribute) -> Result<usize> {
        Ok(self.attribute(attribute)?.max(0) as usize)
    }

    /// Read every attribute.
    pub fn attributes(&self) -> Result<KernelAttributes> {
        let _scope = self.scope()?;
        let carveout = self.attribute(FunctionAttribute::PreferredSharedMemoryCarveout)?;
        Ok(KernelAttributes {
            max_threads_per_block: self.max_threads_per_block()?,
            shared_size_bytes: self.attribute_usize(FunctionAttribute::SharedSizeBytes)?,
            const_size_bytes: self.attribute_usize(FunctionAttribute::ConstSizeBytes)?,
            local_size_bytes: self.attribute_usize(FunctionAttribute::LocalSizeBytes)?,
            num_regs: self.attribute_usize(FunctionAttribute::NumRegs)? as u32,
            ptx_version: self.ptx_version()?,
            binary_version: self.binary_version()?,
            cache_mode_ca: self.attribute(FunctionAttribute::CacheModeCa)? != 0,
            max_dynamic_shared_size_bytes: self
                .attribute_usize(FunctionAttribute::MaxDynamicSharedSizeBytes)?,
            preferred_shared_memory_carveout: u32::try_from(carveout).ok(),
        })
    }

    /// Largest block the kernel can be launched with.
    pub fn max_threads_per_block(&self) -> Result<u32> {
        Ok(self.attribute_usize(FunctionAttribute::MaxThreadsPerBlock)? as u32)
    }

    /// PTX virtual architecture the kernel was compiled for.
    pub fn ptx_version(&self) -> Result<ComputeCapability> {
        Ok(ComputeCapability::from_combined(
            self.attribute_usize(FunctionAttribute::PtxVersion)? as u32,
        ))
    }

    /// Binary architecture of the loaded code.
    pub fn binary_version(&self) -> Result<ComputeCapability> {
        Ok(ComputeCapability::from_combined(
            self.attribute_usize(FunctionAttribute::BinaryVersion)? as u32,
        ))
    }

    /// Set a writable attribute.
    pub fn set_attribute(&self, attribute: FunctionAttribute, value: i32) -> Result<()> {
        if !attribute.is_writable() {
            return Err(Error::invalid_argument(format!(
                "attribute '{}' is read-only",
                attribute.name()
            )));
        }
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .set_function_attribute(self.function, attribute, value)
            .with_context(|| {
                format!(
                    "Failed setting attribute '{}' of kernel {} to {}",
                    attribute.name(),
                    self.function,
                    value
                )
            })?;
        debug!(function = %self.function, attribute = ?attribute, value, "kernel attribute set");
        Ok(())
    }

    /// Allow launches with up to `bytes` bytes of dynamic shared memory.
    pub fn set_max_dynamic_shared_memory(&self, bytes: u32) -> Result<()> {
        let value = i32::try_from(bytes).map_err(|_| {
            Error::invalid_argument(format!("{} bytes of shared memory is out of range", bytes))
        })?;
        self.set_attribute(FunctionAttribute::MaxDynamicSharedSizeBytes, value)
    }

    /// Prefer `percent` of the unified L1/shared pool as shared memory.
    ///
    /// Values above 100 are rejected before anything is changed.
    pub fn set_shared_memory_carveout(&self, percent: u32) -> Result<()> {
        if percent > 100 {
            return Err(Error::invalid_argument(format!(
                "shared memory carveout must be a percentage in [0, 100], got {}",
                percent
            )));
        }
        self.set_attribute(FunctionAttribute::PreferredSharedMemoryCarveout, percent as i32)
    }

    /// Return to the device's default carveout.
    pub fn reset_shared_memory_carveout(&self) -> Result<()> {
        self.set_attribute(FunctionAttribute::PreferredSharedMemoryCarveout, -1)
    }

    /// Set the L1/shared preference.
    pub fn set_cache_preference(&self, preference: CachePreference) -> Result<()> {
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .set_function_cache_preference(self.function, preference)
            .with_context(|| {
                format!(
                    "Failed setting the cache preference of kernel {} to {:?}",
                    self.function, preference
                )
            })
    }

    /// Set the shared memory bank width.
    pub fn set_shared_memory_bank_size(&self, size: SharedMemoryBankSize) -> Result<()> {
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .set_function_shared_memory_bank_size(self.function, size)
            .with_context(|| {
                format!(
                    "Failed setting the shared memory bank size of kernel {} to {:?}",
                    self.function, size
                )
            })
    }

    /// Blocks of `block_size` threads that fit on one multiprocessor at once.
    pub fn max_active_blocks_per_multiprocessor(
        &self,
        block_size: u32,
        dynamic_shared_memory: usize,
        disable_caching_override: bool,
    ) -> Result<u32> {
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .occupancy_max_active_blocks(
                self.function,
                block_size,
                dynamic_shared_memory,
                disable_caching_override,
            )
            .with_context(|| {
                format!(
                    "Failed determining the occupancy of kernel {} with block size {}",
                    self.function, block_size
                )
            })
    }

    /// Block size that maximises occupancy and the smallest grid that fills
    /// the device with it, for a fixed dynamic shared memory size.
    ///
    /// `block_size_limit` of 0 means no limit beyond the kernel's own.
    pub fn min_grid_params_for_max_occupancy(
        &self,
        dynamic_shared_memory: usize,
        block_size_limit: u32,
        disable_caching_override: bool,
    ) -> Result<GridParams> {
        self.min_grid_params_for_max_occupancy_with(
            |_| dynamic_shared_memory,
            block_size_limit,
            disable_caching_override,
        )
    }

    /// As [`Kernel::min_grid_params_for_max_occupancy`], with the dynamic
    /// shared memory computed per candidate block size.
    pub fn min_grid_params_for_max_occupancy_with<F>(
        &self,
        shared_memory_for_block: F,
        block_size_limit: u32,
        disable_caching_override: bool,
    ) -> Result<GridParams>
    where
        F: Fn(u32) -> usize,
    {
        let _scope = self.scope()?;
        let warp = self.device.attribute(DeviceAttribute::WarpSize)?.max(1) as u32;
        let sm_count = self
            .device
            .attribute(DeviceAttribute::MultiprocessorCount)?
            .max(0) as u32;
        let threads_per_sm = self
            .device
            .attribute(DeviceAttribute::MaxThreadsPerMultiprocessor)?
            .max(0) as u32;
        let device_limit = self
            .device
            .attribute(DeviceAttribute::MaxThreadsPerBlock)?
            .max(0) as u32;

        let mut limit = self.max_threads_per_block()?.min(device_limit);
        if block_size_limit != 0 {
            limit = limit.min(block_size_limit);
        }
        if limit == 0 {
            return Err(Error::invalid_argument("block size limit is zero"));
        }

        let start = if limit >= warp { limit - limit % warp } else { limit };
        let mut best = GridParams {
            min_grid_size: 0,
            block_size: 0,
        };
        let mut best_threads = 0u64;
        let mut block_size = start;
        while block_size > 0 {
            let blocks = self.max_active_blocks_per_multiprocessor(
                block_size,
                shared_memory_for_block(block_size),
                disable_caching_override,
            )?;
            let threads = u64::from(blocks) * u64::from(block_size);
            if threads > best_threads {
                best_threads = threads;
                best = GridParams {
                    min_grid_size: blocks * sm_count,
                    block_size,
                };
                if threads >= u64::from(threads_per_sm) {
                    break;
                }
            }
            block_size = block_size.saturating_sub(warp);
        }

        if best_threads == 0 {
            return Err(Error::invalid_argument(format!(
                "no block size up to {} lets kernel {} become resident",
                start, self.function
            )));
        }
        debug!(
            function = %self.function,
            block_size = best.block_size,
            min_grid_size = best.min_grid_size,
            "occupancy search finished"
        );
        Ok(best)
    }

    /// Launch on the default stream of the kernel's device.
    ///
    /// # Safety
    ///
    /// See [`launch::enqueue_launch`].
    pub unsafe fn launch(&self, config: LaunchConfig, args: &KernelArgs) -> Result<()> {
        let stream = Stream::wrap_in_context(
            &self.device,
            self.context,
            StreamHandle::DEFAULT,
            Ownership::Borrowed,
        );
        launch::enqueue_launch(self, &stream, config, args)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("device", &self.device.id().0)
            .field("context", &self.context)
            .field("function", &self.function)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::ArchitectureLimits;
    use crate::sim::{self, SimDeviceConfig, SimKernelSpec};

    fn kernel_with(spec: SimKernelSpec) -> (Kernel, std::sync::Arc<sim::SimPlatform>) {
        let config = SimDeviceConfig::new("sim-ampere", ArchitectureLimits::ampere());
        let (runtime, sim) = sim::simulated_runtime_with(vec![config]).unwrap();
        let device = runtime.device(0).unwrap();
        let handle = sim.register_kernel(device.id(), spec, |_| Ok(())).unwrap();
        (Kernel::wrap(&device, handle).unwrap(), sim)
    }

    #[test]
    fn test_attributes_reflect_spec() {
        let (kernel, _sim) = kernel_with(
            SimKernelSpec::new("k")
                .with_registers(40)
                .with_static_shared_memory(2048)
                .with_versions(80, 86),
        );
        let attrs = kernel.attributes().unwrap();

        assert_eq!(attrs.num_regs, 40);
        assert_eq!(attrs.shared_size_bytes, 2048);
        assert_eq!(attrs.ptx_version, ComputeCapability::new(8, 0));
        assert_eq!(attrs.binary_version, ComputeCapability::new(8, 6));
        assert_eq!(attrs.max_threads_per_block, 1024);
        assert_eq!(attrs.preferred_shared_memory_carveout, None);
    }

    #[test]
    fn test_carveout_out_of_range_has_no_effect() {
        let (kernel, sim) = kernel_with(SimKernelSpec::new("k"));
        kernel.set_shared_memory_carveout(50).unwrap();

        let calls = sim.total_calls();
        assert!(matches!(
            kernel.set_shared_memory_carveout(101),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(sim.total_calls(), calls);
        assert_eq!(
            kernel
                .attribute(FunctionAttribute::PreferredSharedMemoryCarveout)
                .unwrap(),
            50
        );
    }

    #[test]
    fn test_read_only_attribute_rejected() {
        let (kernel, _sim) = kernel_with(SimKernelSpec::new("k"));
        assert!(kernel.set_attribute(FunctionAttribute::NumRegs, 8).is_err());
    }

    #[test]
    fn test_launch_on_stream_of_another_runtime_is_rejected() {
        let (kernel, sim) = kernel_with(SimKernelSpec::new("k"));
        let (other, _other_sim) = sim::simulated_runtime(1).unwrap();
        let stranger = other.device(0).unwrap();
        let stream = stranger.default_stream().unwrap();
        assert_eq!(kernel.device().id(), stranger.id());

        let err = unsafe {
            crate::launch::enqueue_launch(
                &kernel,
                &stream,
                crate::launch::LaunchConfig::new(1, 32),
                &crate::launch::KernelArgs::new(),
            )
        }
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceMismatch {
                operation: crate::error::AffinityOperation::KernelLaunch,
                ..
            }
        ));
        assert_eq!(sim.launch_count(), 0);
    }

    #[test]
    fn test_setters_restore_ambient_context() {
        let (kernel, _sim) = kernel_with(SimKernelSpec::new("k"));
        let runtime = kernel.device().runtime().clone();

        kernel.set_cache_preference(CachePreference::PreferShared).unwrap();
        kernel
            .set_shared_memory_bank_size(SharedMemoryBankSize::EightBytes)
            .unwrap();
        kernel.set_max_dynamic_shared_memory(64 * 1024).unwrap();
        assert_eq!(crate::current::context(&runtime).unwrap(), None);
        assert_eq!(
            kernel.attributes().unwrap().max_dynamic_shared_size_bytes,
            64 * 1024
        );
    }

    #[test]
    fn test_min_grid_params_light_kernel() {
        let (kernel, _sim) = kernel_with(SimKernelSpec::new("k").with_registers(32));
        let params = kernel.min_grid_params_for_max_occupancy(0, 0, false).unwrap();

        let limits = ArchitectureLimits::ampere();
        let blocks_per_sm = limits.max_threads_per_sm / params.block_size;
        assert_eq!(params.block_size * blocks_per_sm, limits.max_threads_per_sm);
        assert_eq!(params.min_grid_size, blocks_per_sm * limits.sm_count);
    }

    #[test]
    fn test_min_grid_params_respects_limit() {
        let (kernel, _sim) = kernel_with(SimKernelSpec::new("k").with_registers(32));
        let params = kernel.min_grid_params_for_max_occupancy(0, 96, false).unwrap();
        assert!(params.block_size <= 96);
        assert_eq!(params.block_size % 32, 0);
    }

    #[test]
    fn test_min_grid_params_with_variable_shared_memory() {
        let (kernel, _sim) = kernel_with(SimKernelSpec::new("k").with_registers(16));
        let fixed = kernel.min_grid_params_for_max_occupancy(0, 0, false).unwrap();
        let heavy = kernel
            .min_grid_params_for_max_occupancy_with(|bs| bs as usize * 160, 0, false)
            .unwrap();

        assert!(heavy.min_grid_size <= fixed.min_grid_size);
        assert!(heavy.block_size > 0);
    }
}

//! Launch configuration, argument packing and launch dispatch.
//!
//! Two things can be launched: a [`Kernel`], which knows its device and is
//! checked against the target stream, and a [`RawFunction`], a bare function
//! handle with no affinity to check. Both implement [`Launchable`]; the choice
//! is made statically at the call site.

use std::ffi::c_void;
use std::fmt;

use tracing::trace;

use crate::current::ScopedOverride;
use crate::error::{AffinityOperation, Error, Result, StatusExt};
use crate::kernel::Kernel;
use crate::platform::{DevicePtr, FunctionHandle};
use crate::stream::Stream;

/// Three-dimensional extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    /// Extent along x.
    pub x: u32,
    /// Extent along y.
    pub y: u32,
    /// Extent along z.
    pub z: u32,
}

impl Dim3 {
    /// Construct from components.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of elements spanned.
    pub fn volume(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// True when no component is zero.
    pub fn is_valid(&self) -> bool {
        self.x != 0 && self.y != 0 && self.z != 0
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Grid shape and per-launch resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchConfig {
    /// Blocks in the grid.
    pub grid: Dim3,
    /// Threads per block.
    pub block: Dim3,
    /// Dynamic shared memory per block, in bytes.
    pub dynamic_shared_memory: u32,
}

impl LaunchConfig {
    /// Configuration with no dynamic shared memory.
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            dynamic_shared_memory: 0,
        }
    }

    /// One-dimensional grid covering `elements` with `block_size` threads per block.
    pub fn for_elements(elements: u32, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        Self::new(elements.div_ceil(block_size).max(1), block_size)
    }

    /// Sets the dynamic shared memory size.
    #[must_use]
    pub fn with_dynamic_shared_memory(mut self, bytes: u32) -> Self {
        self.dynamic_shared_memory = bytes;
        self
    }

    /// Threads per block.
    pub fn block_size(&self) -> u64 {
        self.block.volume()
    }

    /// Threads in the whole grid.
    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }

    /// Reject zero-sized dimensions.
    pub fn validate(&self) -> Result<()> {
        if !self.grid.is_valid() {
            return Err(Error::invalid_argument(format!(
                "grid dimensions {} contain a zero",
                self.grid
            )));
        }
        if !self.block.is_valid() {
            return Err(Error::invalid_argument(format!(
                "block dimensions {} contain a zero",
                self.block
            )));
        }
        Ok(())
    }
}

/// Plain-old-data values that can be passed to device code by value.
///
/// # Safety
///
/// Implementors must be `Copy`, contain no padding, and be valid for every bit pattern.
pub unsafe trait KernelParam: Copy + Send + Sync + 'static {}

macro_rules! impl_kernel_param {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl KernelParam for $t {})*
    };
}

impl_kernel_param!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, DevicePtr);

/// Packed kernel arguments.
///
/// Each argument is stored in its own 8-byte-aligned slot so the platform can
/// be handed an array of pointers, one per parameter.
#[derive(Clone, Default)]
pub struct KernelArgs {
    storage: Vec<u64>,
    entries: Vec<(usize, usize)>,
}

impl KernelArgs {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument.
    pub fn push<T: KernelParam>(&mut self, value: T) -> &mut Self {
        let size = std::mem::size_of::<T>();
        let words = size.div_ceil(8).max(1);
        let offset = self.storage.len();
        self.storage.resize(offset + words, 0);
        // SAFETY: the destination spans `words * 8 >= size` freshly reserved bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                self.storage.as_mut_ptr().add(offset) as *mut u8,
                size,
            );
        }
        self.entries.push((offset, size));
        self
    }

    /// Append an argument, builder style.
    #[must_use]
    pub fn arg<T: KernelParam>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size in bytes of argument `index`.
    pub fn size_of(&self, index: usize) -> Option<usize> {
        self.entries.get(index).map(|(_, size)| *size)
    }

    /// Read argument `index` back, if it has the size of `T`.
    pub fn get<T: KernelParam>(&self, index: usize) -> Option<T> {
        let (offset, size) = *self.entries.get(index)?;
        if size != std::mem::size_of::<T>() {
            return None;
        }
        // SAFETY: the slot holds `size` initialised bytes and `T` accepts any bit pattern.
        Some(unsafe { std::ptr::read_unaligned(self.storage.as_ptr().add(offset) as *const T) })
    }

    /// One pointer per argument, in order, as the driver expects.
    ///
    /// The pointers borrow `self` and must not outlive it.
    pub fn as_param_ptrs(&self) -> Vec<*mut c_void> {
        self.entries
            .iter()
            .map(|(offset, _)| {
                // SAFETY: every recorded offset lies inside `storage`.
                unsafe { self.storage.as_ptr().add(*offset) as *mut c_void }
            })
            .collect()
    }
}

impl fmt::Debug for KernelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelArgs")
            .field("count", &self.entries.len())
            .field("sizes", &self.entries.iter().map(|(_, s)| *s).collect::<Vec<_>>())
            .finish()
    }
}

/// Build [`KernelArgs`] from a list of values.
///
/// ```
/// use gpuhost_core::kernel_args;
/// let args = kernel_args![1u32, 2.5f32];
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! kernel_args {
    ($($arg:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut args = $crate::launch::KernelArgs::new();
        $( args.push($arg); )*
        args
    }};
}

/// Something that can be launched on a stream.
pub trait Launchable {
    /// Function to launch.
    fn function(&self) -> FunctionHandle;

    /// Reject streams this function cannot run on. Must not call the platform.
    fn check_stream(&self, stream: &Stream) -> Result<()>;
}

impl Launchable for Kernel {
    fn function(&self) -> FunctionHandle {
        self.handle()
    }

    fn check_stream(&self, stream: &Stream) -> Result<()> {
        if self.device() != stream.device() {
            return Err(Error::DeviceMismatch {
                operation: AffinityOperation::KernelLaunch,
                expected: stream.device().id(),
                actual: self.device().id(),
            });
        }
        Ok(())
    }
}

/// A function handle with no known device; launched wherever it is asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFunction(FunctionHandle);

impl RawFunction {
    /// Wrap a function handle.
    pub fn new(handle: FunctionHandle) -> Self {
        Self(handle)
    }

    /// Launch on the default stream of the device made current by `scope`.
    ///
    /// # Safety
    ///
    /// See [`enqueue_launch`].
    pub unsafe fn launch_in(
        &self,
        scope: &ScopedOverride,
        config: LaunchConfig,
        args: &KernelArgs,
    ) -> Result<()> {
        let stream = scope.target_device().default_stream()?;
        enqueue_launch(self, &stream, config, args)
    }
}

impl Launchable for RawFunction {
    fn function(&self) -> FunctionHandle {
        self.0
    }

    fn check_stream(&self, _stream: &Stream) -> Result<()> {
        Ok(())
    }
}

/// Launch `function` on `stream`.
///
/// Affinity and configuration are checked before the platform is called.
///
/// # Safety
///
/// `args` must match the function's parameters in count, order and layout,
/// and any memory they reference must stay valid until the launch completes.
pub unsafe fn enqueue_launch<L>(
    function: &L,
    stream: &Stream,
    config: LaunchConfig,
    args: &KernelArgs,
) -> Result<()>
where
    L: Launchable + ?Sized,
{
    function.check_stream(stream)?;
    config.validate()?;
    let handle = stream.handle()?;
    let raw = function.function();

    let _scope = stream.scope()?;
    trace!(
        function = %raw,
        stream = %handle,
        grid = %config.grid,
        block = %config.block,
        dynamic_shared_memory = config.dynamic_shared_memory,
        args = args.len(),
        "enqueue kernel launch"
    );
    stream
        .device()
        .runtime()
        .platform()
        .launch_kernel(raw, &config, handle, args)
        .with_context(|| {
            format!(
                "Failed launching function {} with grid {} and block {} on stream {}",
                raw, config.grid, config.block, handle
            )
        })
}

//! # gpuhost core
//!
//! Host-side ownership, ambient-context and stream-ordering layer for
//! GPU-style accelerators.
//!
//! The crate wraps the opaque numeric handles of an accelerator driver
//! (devices, contexts, streams, events, allocations and compiled functions)
//! in proxies that know who owns what, which device they belong to, and how
//! to make that device current for the duration of a call.
//!
//! ## Core Abstractions
//!
//! - [`Platform`] - The driver contract implemented by each backend
//! - [`Runtime`] - Driver initialisation, device enumeration, primary contexts
//! - [`ScopedOverride`] - Stack-disciplined switch of the thread's current context
//! - [`Stream`] / [`Enqueue`] - Ordered command queues and the work put on them
//! - [`Event`] - Synchronisation markers between streams and the host
//! - [`Region`] - Device, pinned, managed and mapped memory
//! - [`Kernel`] - Compiled-function proxy: attributes, occupancy, launch
//! - [`sim::SimPlatform`] - A host-only platform for tests and hardware-free use
//!
//! ## Example
//!
//! ```
//! use gpuhost_core::prelude::*;
//! use gpuhost_core::sim;
//!
//! let (runtime, _sim) = sim::simulated_runtime(1)?;
//! let device = runtime.device(0)?;
//! let stream = device.create_stream(StreamConfig::default())?;
//!
//! let mut region = memory::device::allocate(&device, 256)?;
//! stream.enqueue().set(&mut region, 0xAB, 256)?;
//! stream.synchronize()?;
//!
//! let mut host = vec![0u8; 256];
//! memory::copy(&mut host, &region, 256)?;
//! assert!(host.iter().all(|b| *b == 0xAB));
//! # Ok::<(), gpuhost_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod current;
pub mod device;
pub mod error;
pub mod event;
pub mod handle;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod occupancy;
pub mod platform;
pub mod runtime;
pub mod sim;
pub mod stream;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use current::ScopedOverride;
pub use device::{ComputeCapability, Device, DeviceProperties, MemoryInfo, StreamPriorityRange};
pub use error::{AffinityOperation, Error, PlatformResult, Result, Status, StatusExt};
pub use event::{Event, EventFlags, EventFlagsBuilder};
pub use handle::Ownership;
pub use kernel::{GridParams, Kernel, KernelAttributes};
pub use launch::{
    enqueue_launch, Dim3, KernelArgs, KernelParam, LaunchConfig, Launchable, RawFunction,
};
pub use memory::{Addressable, Region, RegionKind};
pub use occupancy::{ArchitectureLimits, BlockUsage};
pub use platform::{DeviceId, DevicePtr, Platform};
pub use runtime::Runtime;
pub use stream::{Enqueue, Stream, StreamConfig, StreamConfigBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::current::{self, ScopedOverride};
    pub use crate::device::{ComputeCapability, Device};
    pub use crate::error::{Error, Result, Status};
    pub use crate::event::{ipc, Event, EventFlags};
    pub use crate::handle::Ownership;
    pub use crate::kernel::{GridParams, Kernel};
    pub use crate::kernel_args;
    pub use crate::launch::{
        enqueue_launch, Dim3, KernelArgs, LaunchConfig, Launchable, RawFunction,
    };
    pub use crate::memory::{self, Region, RegionKind};
    pub use crate::platform::{
        CachePreference, DeviceAttribute, DevicePtr, FunctionAttribute, HostAllocOptions,
        InitialVisibility, Location, SharedMemoryBankSize,
    };
    pub use crate::runtime::Runtime;
    pub use crate::stream::{Stream, StreamConfig};
    pub use crate::RuntimeConfig;
}

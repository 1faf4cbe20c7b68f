//! Ordered command queues.
//!
//! Work enqueued on one [`Stream`] runs in enqueue order. Work on different
//! streams is unordered unless connected through an [`Event`](crate::event::Event)
//! wait. Enqueue calls never block the host thread; only
//! [`Stream::synchronize`] does.

mod config;
mod enqueue;

pub use config::{StreamConfig, StreamConfigBuilder};
pub use enqueue::Enqueue;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use tracing::debug;

use crate::current::ScopedOverride;
use crate::device::Device;
use crate::error::{Result, StatusExt};
use crate::handle::{Ownership, Slot};
use crate::platform::{ContextHandle, StreamHandle};

/// Proxy for a platform stream.
///
/// Owning streams are destroyed when dropped; outstanding work still
/// completes, but the proxy accepts no further work once released.
pub struct Stream {
    device: Device,
    context: ContextHandle,
    slot: Slot<StreamHandle>,
    synchronizes_with_default: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl Stream {
    /// Create an owning stream on `device`.
    pub fn create(device: &Device, config: StreamConfig) -> Result<Self> {
        let scope = ScopedOverride::device(device)?;
        Self::create_in(&scope, config)
    }

    /// Create an owning stream on the device made current by `scope`.
    pub fn create_in(scope: &ScopedOverride, config: StreamConfig) -> Result<Self> {
        let device = scope.target_device();
        let priority = config
            .priority
            .unwrap_or(device.runtime().config().default_stream_priority);
        let handle = device
            .runtime()
            .platform()
            .stream_create(config.synchronizes_with_default, priority)
            .with_context(|| format!("Failed creating a stream on {}", device.id()))?;

        debug!(
            device = device.id().0,
            stream = %handle,
            priority,
            synchronizes_with_default = config.synchronizes_with_default,
            "stream created"
        );
        Ok(Self::from_parts(
            device.clone(),
            scope.target_context(),
            handle,
            config.synchronizes_with_default,
            Ownership::Owned,
        ))
    }

    /// Wrap an existing stream of `device`'s primary context.
    ///
    /// Wrapped streams are assumed to synchronize with the default stream.
    pub fn wrap(device: &Device, handle: StreamHandle, ownership: Ownership) -> Result<Self> {
        let context = device.primary_context()?;
        Ok(Self::wrap_in_context(device, context, handle, ownership))
    }

    /// Wrap an existing stream of a specific context.
    pub fn wrap_in_context(
        device: &Device,
        context: ContextHandle,
        handle: StreamHandle,
        ownership: Ownership,
    ) -> Self {
        Self::from_parts(device.clone(), context, handle, true, ownership)
    }

    pub(crate) fn default_of(device: &Device) -> Result<Self> {
        Self::wrap(device, StreamHandle::DEFAULT, Ownership::Borrowed)
    }

    fn from_parts(
        device: Device,
        context: ContextHandle,
        handle: StreamHandle,
        synchronizes_with_default: bool,
        ownership: Ownership,
    ) -> Self {
        Self {
            device,
            context,
            slot: Slot::new(handle, ownership, "stream"),
            synchronizes_with_default,
            _not_sync: PhantomData,
        }
    }

    /// Device the stream belongs to.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Context the stream belongs to.
    #[inline]
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Raw handle.
    pub fn handle(&self) -> Result<StreamHandle> {
        self.slot.get()
    }

    /// Whether dropping this proxy destroys the stream.
    pub fn ownership(&self) -> Ownership {
        self.slot.ownership()
    }

    /// False once the proxy was released, taken from or relinquished.
    pub fn is_valid(&self) -> bool {
        self.slot.is_live()
    }

    /// True for the implicit default stream.
    pub fn is_default(&self) -> bool {
        matches!(self.slot.get(), Ok(StreamHandle::DEFAULT))
    }

    /// Whether work is ordered against the default stream.
    pub fn synchronizes_with_default(&self) -> bool {
        self.synchronizes_with_default
    }

    /// Make the stream's context current for the lifetime of the guard.
    pub(crate) fn scope(&self) -> Result<ScopedOverride> {
        ScopedOverride::context(&self.device, self.context)
    }

    /// Priority the stream runs at.
    pub fn priority(&self) -> Result<i32> {
        let handle = self.handle()?;
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .stream_priority(handle)
            .with_context(|| format!("Failed obtaining the priority of stream {}", handle))
    }

    /// Non-blocking poll: true when all enqueued work has completed.
    pub fn is_done(&self) -> Result<bool> {
        let handle = self.handle()?;
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .stream_query(handle)
            .with_context(|| format!("Failed querying stream {}", handle))
    }

    /// Block until all enqueued work has completed.
    pub fn synchronize(&self) -> Result<()> {
        let handle = self.handle()?;
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .stream_synchronize(handle)
            .with_context(|| format!("Failed synchronizing stream {}", handle))
    }

    /// Stream-ordered operations.
    pub fn enqueue(&self) -> Enqueue<'_> {
        Enqueue::new(self)
    }

    /// Move the stream (and ownership) into a new proxy, leaving this one released.
    #[must_use]
    pub fn take(&mut self) -> Stream {
        Self {
            device: self.device.clone(),
            context: self.context,
            slot: self.slot.take(),
            synchronizes_with_default: self.synchronizes_with_default,
            _not_sync: PhantomData,
        }
    }

    /// A non-owning proxy for the same stream.
    pub fn borrowed(&self) -> Result<Stream> {
        Ok(Self {
            device: self.device.clone(),
            context: self.context,
            slot: self.slot.borrowed()?,
            synchronizes_with_default: self.synchronizes_with_default,
            _not_sync: PhantomData,
        })
    }

    /// Destroy the stream now, reporting failures.
    pub fn release(&mut self) -> Result<()> {
        let device = &self.device;
        let context = self.context;
        self.slot
            .release_with(|handle| destroy(device, context, handle))
    }

    /// Give up ownership and return the raw handle.
    pub fn into_raw(mut self) -> Result<StreamHandle> {
        self.slot.relinquish()
    }
}

fn destroy(device: &Device, context: ContextHandle, handle: StreamHandle) -> Result<()> {
    let _scope = ScopedOverride::context(device, context)?;
    device
        .runtime()
        .platform()
        .stream_destroy(handle)
        .with_context(|| format!("Failed destroying stream {}", handle))?;
    debug!(device = device.id().0, stream = %handle, "stream destroyed");
    Ok(())
}

impl Drop for Stream {
    fn drop(&mut self) {
        let device = &self.device;
        let context = self.context;
        self.slot
            .drop_with(device.runtime(), |handle| destroy(device, context, handle));
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device.id().0)
            .field("handle", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sim;

    #[test]
    fn test_create_and_drop_destroys_once() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        {
            let stream = Stream::create(&device, StreamConfig::default()).unwrap();
            assert!(stream.ownership().is_owned());
            assert!(stream.is_done().unwrap());
        }
        assert_eq!(sim.call_count("stream_destroy"), 1);
    }

    #[test]
    fn test_take_transfers_ownership() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let mut original = Stream::create(&device, StreamConfig::default()).unwrap();
        let handle = original.handle().unwrap();

        let moved = original.take();
        assert_eq!(moved.handle().unwrap(), handle);

        let calls = sim.total_calls();
        assert!(matches!(
            original.synchronize(),
            Err(Error::UseAfterRelease { resource: "stream" })
        ));
        assert!(matches!(original.is_done(), Err(Error::UseAfterRelease { .. })));
        assert_eq!(sim.total_calls(), calls);

        drop(original);
        assert_eq!(sim.call_count("stream_destroy"), 0);
        drop(moved);
        assert_eq!(sim.call_count("stream_destroy"), 1);
    }

    #[test]
    fn test_release_reports_and_empties() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let mut stream = Stream::create(&device, StreamConfig::default()).unwrap();

        stream.release().unwrap();
        assert!(!stream.is_valid());
        assert!(stream.release().is_err());
        drop(stream);
        assert_eq!(sim.call_count("stream_destroy"), 1);
    }

    #[test]
    fn test_drop_swallows_release_failure() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = Stream::create(&device, StreamConfig::default()).unwrap();

        sim.fail_calls("stream_destroy", crate::error::Status::INVALID_HANDLE);
        drop(stream);
        assert_eq!(sim.call_count("stream_destroy"), 1);
    }

    #[test]
    fn test_default_stream_is_borrowed() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = device.default_stream().unwrap();

        assert!(stream.is_default());
        assert_eq!(stream.ownership(), Ownership::Borrowed);
        stream.synchronize().unwrap();
        drop(stream);
        assert_eq!(sim.call_count("stream_destroy"), 0);
    }

    #[test]
    fn test_priority_defaults_from_runtime_config() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();

        let default = Stream::create(&device, StreamConfig::default()).unwrap();
        assert_eq!(default.priority().unwrap(), 0);

        let urgent = Stream::create(&device, StreamConfig::with_priority(-1)).unwrap();
        assert_eq!(urgent.priority().unwrap(), -1);
        assert!(!urgent.synchronizes_with_default());
    }

    #[test]
    fn test_create_in_uses_scope_device() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        let device = runtime.device(1).unwrap();
        let scope = ScopedOverride::device(&device).unwrap();

        let stream = Stream::create_in(&scope, StreamConfig::non_blocking()).unwrap();
        assert_eq!(stream.device(), &device);
    }

    #[test]
    fn test_into_raw_skips_destroy() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = Stream::create(&device, StreamConfig::default()).unwrap();

        let raw = stream.into_raw().unwrap();
        assert_eq!(sim.call_count("stream_destroy"), 0);

        let mut adopted = Stream::wrap(&device, raw, Ownership::Owned).unwrap();
        adopted.release().unwrap();
        assert_eq!(sim.call_count("stream_destroy"), 1);
    }
}

//! Synchronization markers.
//!
//! An [`Event`] recorded on a stream is reached once all work enqueued on
//! that stream before the record has completed. Being reached is monotonic
//! until the event is recorded again, which re-arms it. An event that was
//! never recorded counts as reached.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use tracing::debug;

use crate::current::ScopedOverride;
use crate::device::Device;
use crate::error::{AffinityOperation, Error, Result, StatusExt};
use crate::handle::{Ownership, Slot};
use crate::platform::{ContextHandle, EventHandle, RawEventFlags};
use crate::stream::Stream;

/// Event creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFlags {
    /// Host waits block on an OS primitive instead of spinning.
    pub blocking_sync: bool,
    /// Record timestamps usable with [`Event::elapsed_time`].
    pub timing: bool,
    /// Shareable with other processes through [`ipc`].
    pub interprocess: bool,
}

impl Default for EventFlags {
    fn default() -> Self {
        Self {
            blocking_sync: false,
            timing: true,
            interprocess: false,
        }
    }
}

impl EventFlags {
    /// Start a builder from defaults.
    #[must_use]
    pub fn builder() -> EventFlagsBuilder {
        EventFlagsBuilder::default()
    }

    /// Events used purely for ordering; cheapest to record and query.
    #[must_use]
    pub fn sync_only() -> Self {
        Self {
            blocking_sync: false,
            timing: false,
            interprocess: false,
        }
    }

    /// Events that can be exported to another process.
    #[must_use]
    pub fn interprocess() -> Self {
        Self {
            blocking_sync: false,
            timing: false,
            interprocess: true,
        }
    }

    /// Reject combinations the platform does not support.
    pub fn validate(&self) -> Result<()> {
        if self.interprocess && self.timing {
            return Err(Error::invalid_argument(
                "interprocess events cannot record timing",
            ));
        }
        Ok(())
    }

    fn raw(self) -> RawEventFlags {
        RawEventFlags {
            blocking_sync: self.blocking_sync,
            timing: self.timing,
            interprocess: self.interprocess,
        }
    }
}

/// Builder for EventFlags.
#[derive(Debug, Default)]
pub struct EventFlagsBuilder {
    flags: EventFlags,
}

impl EventFlagsBuilder {
    /// Sets blocking host waits.
    #[must_use]
    pub fn with_blocking_sync(mut self, enabled: bool) -> Self {
        self.flags.blocking_sync = enabled;
        self
    }

    /// Enables or disables timing.
    #[must_use]
    pub fn with_timing(mut self, enabled: bool) -> Self {
        self.flags.timing = enabled;
        self
    }

    /// Enables or disables inter-process sharing.
    #[must_use]
    pub fn with_interprocess(mut self, enabled: bool) -> Self {
        self.flags.interprocess = enabled;
        self
    }

    /// Builds and validates the flags.
    pub fn build(self) -> Result<EventFlags> {
        self.flags.validate()?;
        Ok(self.flags)
    }
}

/// Proxy for a platform event.
pub struct Event {
    device: Device,
    context: ContextHandle,
    slot: Slot<EventHandle>,
    flags: EventFlags,
    _not_sync: PhantomData<Cell<()>>,
}

impl Event {
    /// Create an owning event on `device`.
    pub fn create(device: &Device, flags: EventFlags) -> Result<Self> {
        flags.validate()?;
        let scope = ScopedOverride::device(device)?;
        Self::create_in(&scope, flags)
    }

    /// Create an owning event on the device made current by `scope`.
    pub fn create_in(scope: &ScopedOverride, flags: EventFlags) -> Result<Self> {
        flags.validate()?;
        let device = scope.target_device();
        let handle = device
            .runtime()
            .platform()
            .event_create(flags.raw())
            .with_context(|| format!("Failed creating an event on {}", device.id()))?;
        debug!(device = device.id().0, event = %handle, ?flags, "event created");
        Ok(Self::from_parts(
            device.clone(),
            scope.target_context(),
            handle,
            flags,
            Ownership::Owned,
        ))
    }

    /// Wrap an existing event of `device`'s primary context.
    pub fn wrap(
        device: &Device,
        handle: EventHandle,
        flags: EventFlags,
        ownership: Ownership,
    ) -> Result<Self> {
        let context = device.primary_context()?;
        Ok(Self::from_parts(device.clone(), context, handle, flags, ownership))
    }

    fn from_parts(
        device: Device,
        context: ContextHandle,
        handle: EventHandle,
        flags: EventFlags,
        ownership: Ownership,
    ) -> Self {
        Self {
            device,
            context,
            slot: Slot::new(handle, ownership, "event"),
            flags,
            _not_sync: PhantomData,
        }
    }

    /// Device the event belongs to.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Creation flags.
    #[inline]
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Raw handle.
    pub fn handle(&self) -> Result<EventHandle> {
        self.slot.get()
    }

    /// Whether dropping this proxy destroys the event.
    pub fn ownership(&self) -> Ownership {
        self.slot.ownership()
    }

    /// False once the proxy was released, taken from or relinquished.
    pub fn is_valid(&self) -> bool {
        self.slot.is_live()
    }

    fn scope(&self) -> Result<ScopedOverride> {
        ScopedOverride::context(&self.device, self.context)
    }

    /// Record on `stream`.
    pub fn record(&self, stream: &Stream) -> Result<()> {
        stream.enqueue().record(self)
    }

    /// Record on `stream`, then block until the stream is idle.
    pub fn fire(&self, stream: &Stream) -> Result<()> {
        self.record(stream)?;
        stream.synchronize()
    }

    /// Non-blocking poll: true once all work before the latest record completed.
    pub fn query(&self) -> Result<bool> {
        let handle = self.handle()?;
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .event_query(handle)
            .with_context(|| format!("Failed querying event {}", handle))
    }

    /// Alias of [`Event::query`].
    pub fn is_satisfied(&self) -> Result<bool> {
        self.query()
    }

    /// Block the host thread until the event is reached.
    pub fn synchronize(&self) -> Result<()> {
        let handle = self.handle()?;
        let _scope = self.scope()?;
        self.device
            .runtime()
            .platform()
            .event_synchronize(handle)
            .with_context(|| format!("Failed waiting for event {}", handle))
    }

    /// Time between two reached events.
    ///
    /// Both events must have been created with timing enabled on the same device.
    pub fn elapsed_time(start: &Event, end: &Event) -> Result<Duration> {
        if !start.flags.timing || !end.flags.timing {
            return Err(Error::TimingNotEnabled);
        }
        if start.device != end.device {
            return Err(Error::DeviceMismatch {
                operation: AffinityOperation::ElapsedTime,
                expected: start.device.id(),
                actual: end.device.id(),
            });
        }
        let start_raw = start.handle()?;
        let end_raw = end.handle()?;
        let _scope = start.scope()?;
        let ms = start
            .device
            .runtime()
            .platform()
            .event_elapsed(start_raw, end_raw)
            .with_context(|| {
                format!(
                    "Failed determining elapsed time between events {} and {}",
                    start_raw, end_raw
                )
            })?;
        Ok(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1000.0))
    }

    /// Move the event (and ownership) into a new proxy, leaving this one released.
    #[must_use]
    pub fn take(&mut self) -> Event {
        Self {
            device: self.device.clone(),
            context: self.context,
            slot: self.slot.take(),
            flags: self.flags,
            _not_sync: PhantomData,
        }
    }

    /// A non-owning proxy for the same event.
    pub fn borrowed(&self) -> Result<Event> {
        Ok(Self {
            device: self.device.clone(),
            context: self.context,
            slot: self.slot.borrowed()?,
            flags: self.flags,
            _not_sync: PhantomData,
        })
    }

    /// Destroy the event now, reporting failures.
    pub fn release(&mut self) -> Result<()> {
        let device = &self.device;
        let context = self.context;
        self.slot
            .release_with(|handle| destroy(device, context, handle))
    }

    /// Give up ownership and return the raw handle.
    pub fn into_raw(mut self) -> Result<EventHandle> {
        self.slot.relinquish()
    }
}

fn destroy(device: &Device, context: ContextHandle, handle: EventHandle) -> Result<()> {
    let _scope = ScopedOverride::context(device, context)?;
    device
        .runtime()
        .platform()
        .event_destroy(handle)
        .with_context(|| format!("Failed destroying event {}", handle))?;
    debug!(device = device.id().0, event = %handle, "event destroyed");
    Ok(())
}

impl Drop for Event {
    fn drop(&mut self) {
        let device = &self.device;
        let context = self.context;
        self.slot
            .drop_with(device.runtime(), |handle| destroy(device, context, handle));
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device.id().0)
            .field("handle", &self.slot)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Sharing events between processes.
pub mod ipc {
    use super::*;
    use crate::platform::IPC_HANDLE_SIZE;

    /// Serializable token naming an event in another process.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IpcEventHandle([u8; IPC_HANDLE_SIZE]);

    impl IpcEventHandle {
        /// Rebuild from bytes received from another process.
        pub fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
            Self(bytes)
        }

        /// Bytes to send to another process.
        pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
            &self.0
        }
    }

    impl fmt::Debug for IpcEventHandle {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "IpcEventHandle(")?;
            for byte in &self.0[..8] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "..)")
        }
    }

    /// Export `event` for use by another process.
    pub fn export(event: &Event) -> Result<IpcEventHandle> {
        if !event.flags.interprocess {
            return Err(Error::invalid_argument(
                "only events created with the interprocess flag can be exported",
            ));
        }
        let handle = event.handle()?;
        let _scope = event.scope()?;
        let bytes = event
            .device
            .runtime()
            .platform()
            .ipc_event_handle(handle)
            .with_context(|| format!("Failed exporting event {}", handle))?;
        Ok(IpcEventHandle(bytes))
    }

    /// Open an event exported by another process. The result does not own it.
    pub fn import(device: &Device, handle: &IpcEventHandle) -> Result<Event> {
        let scope = ScopedOverride::device(device)?;
        let raw = device
            .runtime()
            .platform()
            .ipc_open_event(&handle.0)
            .context("Failed importing an inter-process event")?;
        debug!(device = device.id().0, event = %raw, "inter-process event imported");
        Ok(Event::from_parts(
            device.clone(),
            scope.target_context(),
            raw,
            EventFlags::interprocess(),
            Ownership::Borrowed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::sim;
    use crate::stream::StreamConfig;

    #[test]
    fn test_flags_validation() {
        assert!(EventFlags::builder()
            .with_interprocess(true)
            .with_timing(true)
            .build()
            .is_err());
        assert!(EventFlags::builder()
            .with_interprocess(true)
            .with_timing(false)
            .build()
            .is_ok());
    }

    #[test]
    fn test_unrecorded_event_is_satisfied() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let event = Event::create(&runtime.device(0).unwrap(), EventFlags::default()).unwrap();
        assert!(event.query().unwrap());
    }

    #[test]
    fn test_record_then_reached_monotonically() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = Stream::create(&device, StreamConfig::non_blocking()).unwrap();
        let mut region = memory::device::allocate(&device, 4096).unwrap();

        stream.enqueue().zero(&mut region, 4096).unwrap();
        let event = stream.enqueue().event(EventFlags::sync_only()).unwrap();
        assert!(!event.query().unwrap());

        event.synchronize().unwrap();
        assert!(event.query().unwrap());
        stream.enqueue().set(&mut region, 1, 4096).unwrap();
        assert!(event.query().unwrap());
    }

    #[test]
    fn test_elapsed_time_requires_timing() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = device.default_stream().unwrap();
        let untimed = Event::create(&device, EventFlags::sync_only()).unwrap();
        let timed = Event::create(&device, EventFlags::default()).unwrap();
        untimed.fire(&stream).unwrap();
        timed.fire(&stream).unwrap();

        let calls = sim.total_calls();
        assert!(matches!(
            Event::elapsed_time(&untimed, &timed),
            Err(Error::TimingNotEnabled)
        ));
        assert_eq!(sim.total_calls(), calls);
    }

    #[test]
    fn test_elapsed_time_between_timed_events() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let stream = device.default_stream().unwrap();
        let start = Event::create(&device, EventFlags::default()).unwrap();
        let end = Event::create(&device, EventFlags::default()).unwrap();

        start.record(&stream).unwrap();
        end.fire(&stream).unwrap();
        let elapsed = Event::elapsed_time(&start, &end).unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_elapsed_time_across_devices_is_rejected() {
        let (runtime, sim) = sim::simulated_runtime(2).unwrap();
        let d0 = runtime.device(0).unwrap();
        let d1 = runtime.device(1).unwrap();
        let start = Event::create(&d0, EventFlags::default()).unwrap();
        let end = Event::create(&d1, EventFlags::default()).unwrap();
        start.fire(&d0.default_stream().unwrap()).unwrap();
        end.fire(&d1.default_stream().unwrap()).unwrap();

        let calls = sim.total_calls();
        let err = Event::elapsed_time(&start, &end).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceMismatch {
                operation: AffinityOperation::ElapsedTime,
                ..
            }
        ));
        assert_eq!(sim.total_calls(), calls);
    }

    #[test]
    fn test_ipc_round_trip_is_non_owning() {
        let (runtime, sim) = sim::simulated_runtime(1).unwrap();
        let device = runtime.device(0).unwrap();
        let exported = Event::create(&device, EventFlags::interprocess()).unwrap();

        let token = ipc::export(&exported).unwrap();
        let imported = ipc::import(&device, &token).unwrap();
        assert_eq!(imported.ownership(), Ownership::Borrowed);

        drop(imported);
        assert_eq!(sim.call_count("event_destroy"), 0);
        drop(exported);
        assert_eq!(sim.call_count("event_destroy"), 1);
    }

    #[test]
    fn test_export_requires_interprocess_flag() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let event = Event::create(&runtime.device(0).unwrap(), EventFlags::default()).unwrap();
        assert!(matches!(ipc::export(&event), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_moved_from_event_reports_use_after_release() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let mut event = Event::create(&runtime.device(0).unwrap(), EventFlags::default()).unwrap();
        let moved = event.take();

        assert!(matches!(event.query(), Err(Error::UseAfterRelease { resource: "event" })));
        assert!(moved.query().unwrap());
    }
}

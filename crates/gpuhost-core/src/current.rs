//! The ambient ("current") device/context of the calling thread.
//!
//! The driver keeps one current context per host thread. Nothing in this
//! crate writes that state directly; every switch goes through a
//! [`ScopedOverride`], which remembers what was current before and puts it
//! back when dropped, including when the guarded code returned early with an
//! error.
//!
//! Guards form a per-thread stack. Dropping them in reverse order is the
//! normal case; if a guard is dropped while newer guards are still alive, it
//! hands the value it saved to the next-newer guard, so the outermost scope
//! still restores what was current before it.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{trace, warn};

use crate::device::Device;
use crate::error::{Error, Result, Status, StatusExt};
use crate::platform::{ContextHandle, DeviceId};
use crate::runtime::Runtime;

struct Frame {
    id: u64,
    platform: usize,
    saved: Option<ContextHandle>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// Makes a device/context current until dropped.
///
/// The guard is `!Send`: it must be dropped on the thread that created it.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct ScopedOverride {
    device: Device,
    context: ContextHandle,
    frame: u64,
    _not_send: PhantomData<*const ()>,
}

impl ScopedOverride {
    /// Make the primary context of `device` current.
    pub fn device(device: &Device) -> Result<Self> {
        let context = device
            .primary_context()
            .map_err(|e| selection_failed(device.id(), &e))?;
        Self::install(device, context)
    }

    /// Make `context` current.
    ///
    /// Fails with [`Error::DeviceSelectionFailed`] unless the context belongs
    /// to `device`; nothing is switched in that case.
    pub fn context(device: &Device, context: ContextHandle) -> Result<Self> {
        let owner = device
            .runtime()
            .platform()
            .context_device(context)
            .map_err(|status| Error::DeviceSelectionFailed {
                device: device.id(),
                status,
            })?;
        if owner != device.id() {
            return Err(Error::DeviceSelectionFailed {
                device: device.id(),
                status: Status::INVALID_CONTEXT,
            });
        }
        Self::install(device, context)
    }

    fn install(device: &Device, context: ContextHandle) -> Result<Self> {
        let runtime = device.runtime();
        let platform = runtime.platform();
        let select_err = |status| Error::DeviceSelectionFailed {
            device: device.id(),
            status,
        };

        let saved = platform.current_context().map_err(select_err)?;
        if saved != Some(context) {
            platform.set_current_context(Some(context)).map_err(select_err)?;
        }

        let frame = NEXT_FRAME.fetch_add(1, Ordering::Relaxed);
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                id: frame,
                platform: runtime.platform_key(),
                saved,
            })
        });
        trace!(device = device.id().0, context = %context, "ambient context override installed");

        Ok(Self {
            device: device.clone(),
            context,
            frame,
            _not_send: PhantomData,
        })
    }

    /// The device made current.
    #[inline]
    pub fn target_device(&self) -> &Device {
        &self.device
    }

    /// The context made current.
    #[inline]
    pub fn target_context(&self) -> ContextHandle {
        self.context
    }
}

fn selection_failed(device: DeviceId, error: &Error) -> Error {
    Error::DeviceSelectionFailed {
        device,
        status: error.status().unwrap_or(Status::UNKNOWN),
    }
}

impl Drop for ScopedOverride {
    fn drop(&mut self) {
        let restore = FRAMES
            .try_with(|frames| {
                let mut frames = frames.borrow_mut();
                let pos = frames.iter().position(|f| f.id == self.frame)?;
                let frame = frames.remove(pos);
                match frames[pos..]
                    .iter_mut()
                    .find(|f| f.platform == frame.platform)
                {
                    Some(newer) => {
                        newer.saved = frame.saved;
                        None
                    }
                    None => Some(frame.saved),
                }
            })
            .ok()
            .flatten();

        if let Some(saved) = restore {
            if saved == Some(self.context) {
                return;
            }
            if let Err(status) = self.device.runtime().platform().set_current_context(saved) {
                warn!(device = self.device.id().0, %status, "failed restoring the ambient context");
            }
        }
    }
}

impl fmt::Debug for ScopedOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedOverride")
            .field("device", &self.device.id().0)
            .field("context", &self.context)
            .finish()
    }
}

/// The context current on this thread, if any.
pub fn context(runtime: &Runtime) -> Result<Option<ContextHandle>> {
    runtime
        .platform()
        .current_context()
        .context("Failed obtaining the current context")
}

/// The device current on this thread.
///
/// With no current context this is the configured default device, matching
/// the implicit device of the runtime API.
pub fn device(runtime: &Runtime) -> Result<Device> {
    match context(runtime)? {
        Some(context) => {
            let id = runtime
                .platform()
                .context_device(context)
                .context("Failed obtaining the device of the current context")?;
            Ok(Device::new_unchecked(runtime.clone(), id))
        }
        None => Device::get(runtime, runtime.config().default_device()),
    }
}

/// Number of overrides alive on this thread.
pub fn override_depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    #[test]
    fn test_override_restores_previous() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        let d0 = runtime.device(0).unwrap();
        let d1 = runtime.device(1).unwrap();

        assert_eq!(context(&runtime).unwrap(), None);
        {
            let _outer = ScopedOverride::device(&d1).unwrap();
            assert_eq!(device(&runtime).unwrap(), d1);
            {
                let _inner = ScopedOverride::device(&d0).unwrap();
                assert_eq!(device(&runtime).unwrap(), d0);
                assert_eq!(override_depth(), 2);
            }
            assert_eq!(device(&runtime).unwrap(), d1);
        }
        assert_eq!(context(&runtime).unwrap(), None);
        assert_eq!(override_depth(), 0);
    }

    #[test]
    fn test_restored_on_error_path() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        let d1 = runtime.device(1).unwrap();

        let failing = || -> Result<()> {
            let _scope = ScopedOverride::device(&d1)?;
            Err(Error::invalid_argument("inside the scope"))
        };
        assert!(failing().is_err());
        assert_eq!(context(&runtime).unwrap(), None);
    }

    #[test]
    fn test_out_of_order_drop_keeps_outer_restoration() {
        let (runtime, _sim) = sim::simulated_runtime(3).unwrap();
        let d0 = runtime.device(0).unwrap();
        let d1 = runtime.device(1).unwrap();
        let d2 = runtime.device(2).unwrap();

        let base = ScopedOverride::device(&d0).unwrap();
        let outer = ScopedOverride::device(&d1).unwrap();
        let inner = ScopedOverride::device(&d2).unwrap();

        drop(outer);
        assert_eq!(device(&runtime).unwrap(), d2);
        drop(inner);
        assert_eq!(device(&runtime).unwrap(), d0);
        drop(base);
        assert_eq!(context(&runtime).unwrap(), None);
    }

    #[test]
    fn test_selection_failure_leaves_state_unchanged() {
        let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
        let d0 = runtime.device(0).unwrap();
        let _scope = ScopedOverride::device(&d0).unwrap();

        let err = ScopedOverride::context(&d0, ContextHandle(0xdead)).unwrap_err();
        assert!(matches!(err, Error::DeviceSelectionFailed { .. }));
        assert_eq!(device(&runtime).unwrap(), d0);
        assert_eq!(override_depth(), 1);
    }

    #[test]
    fn test_context_of_another_device_is_rejected() {
        let (runtime, sim) = sim::simulated_runtime(2).unwrap();
        let d0 = runtime.device(0).unwrap();
        let d1 = runtime.device(1).unwrap();
        let foreign = d1.primary_context().unwrap();

        let switches = sim.call_count("set_current_context");
        let err = ScopedOverride::context(&d0, foreign).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceSelectionFailed {
                device: DeviceId(0),
                status: Status::INVALID_CONTEXT,
            }
        ));
        assert_eq!(sim.call_count("set_current_context"), switches);
        assert_eq!(context(&runtime).unwrap(), None);
        assert_eq!(override_depth(), 0);
    }

    #[test]
    fn test_default_device_when_nothing_current() {
        let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
        assert_eq!(device(&runtime).unwrap().id(), DeviceId(0));
    }
}

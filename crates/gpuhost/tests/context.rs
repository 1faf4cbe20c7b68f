//! Integration tests for the ambient context stack.

use gpuhost::prelude::*;
use gpuhost::sim;
use gpuhost::DeviceId;
use proptest::prelude::*;

fn ambient(runtime: &Runtime) -> Option<DeviceId> {
    current::context(runtime)
        .unwrap()
        .map(|_| current::device(runtime).unwrap().id())
}

#[test]
fn test_nothing_current_reports_default_device() {
    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();

    assert_eq!(current::context(&runtime).unwrap(), None);
    assert_eq!(current::device(&runtime).unwrap().id(), DeviceId(0));
    assert_eq!(current::override_depth(), 0);
}

#[test]
fn test_nested_overrides_restore_in_order() {
    let (runtime, _sim) = sim::simulated_runtime(3).unwrap();
    let devices = runtime.devices().unwrap();

    {
        let _a = ScopedOverride::device(&devices[2]).unwrap();
        assert_eq!(ambient(&runtime), Some(DeviceId(2)));
        {
            let _b = devices[1].scope().unwrap();
            assert_eq!(ambient(&runtime), Some(DeviceId(1)));
            assert_eq!(current::override_depth(), 2);
        }
        assert_eq!(ambient(&runtime), Some(DeviceId(2)));
    }
    assert_eq!(ambient(&runtime), None);
    assert_eq!(current::override_depth(), 0);
}

#[test]
fn test_override_restored_on_error_path() {
    fn failing(device: &Device) -> Result<()> {
        let _scope = device.scope()?;
        Err(Error::invalid_argument("bail out"))
    }

    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();

    let _outer = d0.scope().unwrap();
    assert!(failing(&d1).is_err());
    assert_eq!(ambient(&runtime), Some(DeviceId(0)));
    assert_eq!(current::override_depth(), 1);
}

#[test]
fn test_operations_restore_ambient_device() {
    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();

    let _outer = d0.scope().unwrap();
    let stream = d1.create_stream(StreamConfig::default()).unwrap();
    let mut region = memory::device::allocate(&d1, 256).unwrap();
    stream.enqueue().set(&mut region, 3, 256).unwrap();
    stream.synchronize().unwrap();
    d1.synchronize().unwrap();

    assert_eq!(ambient(&runtime), Some(DeviceId(0)));
    assert_eq!(current::override_depth(), 1);
}

#[test]
fn test_out_of_order_drop_keeps_outer_restore() {
    let (runtime, _sim) = sim::simulated_runtime(3).unwrap();
    let devices = runtime.devices().unwrap();

    let outer = devices[0].scope().unwrap();
    let middle = devices[1].scope().unwrap();
    let inner = devices[2].scope().unwrap();

    drop(middle);
    assert_eq!(ambient(&runtime), Some(DeviceId(2)));
    drop(outer);
    assert_eq!(ambient(&runtime), Some(DeviceId(2)));
    drop(inner);
    assert_eq!(ambient(&runtime), None);
}

#[test]
fn test_failed_selection_leaves_state_untouched() {
    let (runtime, sim) = sim::simulated_runtime(2).unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();
    let _outer = d0.scope().unwrap();
    d1.primary_context().unwrap();

    sim.fail_calls("set_current_context", Status::INVALID_CONTEXT);
    let err = d1.scope().unwrap_err();
    sim.clear_failures();

    assert!(matches!(
        err,
        Error::DeviceSelectionFailed {
            device: DeviceId(1),
            status: Status::INVALID_CONTEXT,
        }
    ));
    assert_eq!(current::override_depth(), 1);
    assert_eq!(ambient(&runtime), Some(DeviceId(0)));
}

#[test]
fn test_scope_taking_entry_points() {
    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
    let d1 = runtime.device(1).unwrap();

    let scope = d1.scope().unwrap();
    let stream = Stream::create_in(&scope, StreamConfig::non_blocking()).unwrap();
    let region = memory::device::allocate_in(&scope, 512).unwrap();
    let event = Event::create_in(&scope, EventFlags::sync_only()).unwrap();

    assert_eq!(stream.device(), &d1);
    assert_eq!(region.device(), &d1);
    assert_eq!(event.device(), &d1);
    assert!(!stream.synchronizes_with_default());
}

#[test]
fn test_ambient_context_is_per_thread() {
    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
    let d1 = runtime.device(1).unwrap();
    let _scope = d1.scope().unwrap();

    let other = runtime.clone();
    let seen = std::thread::spawn(move || {
        (
            current::context(&other).unwrap(),
            current::override_depth(),
        )
    })
    .join()
    .unwrap();

    assert_eq!(seen, (None, 0));
    assert_eq!(ambient(&runtime), Some(DeviceId(1)));
}

#[test]
fn test_proxies_move_between_threads() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::default()).unwrap();
    let mut region = memory::device::allocate(&device, 64).unwrap();

    let (stream, region) = std::thread::spawn(move || {
        stream.enqueue().set(&mut region, 9, 64).unwrap();
        stream.synchronize().unwrap();
        (stream, region)
    })
    .join()
    .unwrap();

    let mut host = vec![0u8; 64];
    memory::copy(&mut host, &region, 64).unwrap();
    assert!(host.iter().all(|b| *b == 9));
    drop(stream);
}

proptest! {
    #[test]
    fn prop_nested_overrides_restore(ids in prop::collection::vec(0u32..3, 1..8)) {
        let (runtime, _sim) = sim::simulated_runtime(3).unwrap();
        let mut guards = Vec::new();

        for id in &ids {
            guards.push(runtime.device(*id).unwrap().scope().unwrap());
            prop_assert_eq!(ambient(&runtime), Some(DeviceId(*id)));
        }
        prop_assert_eq!(current::override_depth(), ids.len());

        for depth in (0..ids.len()).rev() {
            drop(guards.pop());
            let expected = depth.checked_sub(1).map(|i| DeviceId(ids[i]));
            prop_assert_eq!(ambient(&runtime), expected);
        }
        prop_assert_eq!(current::override_depth(), 0);
    }

    #[test]
    fn prop_any_drop_order_follows_newest_live_guard(
        ids in prop::collection::vec(0u32..3, 1..8),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 8),
    ) {
        let (runtime, _sim) = sim::simulated_runtime(3).unwrap();
        let mut live: Vec<(u32, ScopedOverride)> = ids
            .iter()
            .map(|id| (*id, runtime.device(*id).unwrap().scope().unwrap()))
            .collect();

        for pick in picks.iter().take(ids.len()) {
            let index = pick.index(live.len());
            drop(live.remove(index));
            let expected = live.last().map(|(id, _)| DeviceId(*id));
            prop_assert_eq!(ambient(&runtime), expected);
        }
        prop_assert!(live.is_empty());
        prop_assert_eq!(current::override_depth(), 0);
    }
}

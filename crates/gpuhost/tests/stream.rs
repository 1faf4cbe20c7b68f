//! Integration tests for stream ordering and stream-ordered operations.

use gpuhost::prelude::*;
use gpuhost::sim::{self, SimConfig, SimDeviceConfig, SimKernelSpec};
use gpuhost::{AffinityOperation, DeviceId, StreamConfigBuilder};

fn read(region: &Region) -> Vec<u8> {
    let mut host = vec![0u8; region.size()];
    memory::copy(&mut host, region, region.size()).unwrap();
    host
}

#[test]
fn test_work_is_deferred_until_synchronize() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut region = memory::device::allocate(&device, 1024).unwrap();

    assert!(stream.is_done().unwrap());
    stream.enqueue().set(&mut region, 0x11, 1024).unwrap();
    assert!(!stream.is_done().unwrap());

    stream.synchronize().unwrap();
    assert!(stream.is_done().unwrap());
    assert!(read(&region).iter().all(|b| *b == 0x11));
}

#[test]
fn test_operations_on_one_stream_run_in_order() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::default()).unwrap();
    let mut a = memory::device::allocate(&device, 256).unwrap();
    let mut b = memory::device::allocate(&device, 256).unwrap();

    let q = stream.enqueue();
    q.set(&mut a, 1, 256).unwrap();
    q.copy(&mut b, &a, 256).unwrap();
    q.set(&mut a, 2, 128).unwrap();
    stream.synchronize().unwrap();

    assert!(read(&b).iter().all(|v| *v == 1));
    let a_host = read(&a);
    assert!(a_host[..128].iter().all(|v| *v == 2));
    assert!(a_host[128..].iter().all(|v| *v == 1));
}

#[test]
fn test_event_wait_orders_two_streams() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let producer = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let consumer = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut src = memory::device::allocate(&device, 4096).unwrap();
    let mut dst = memory::device::allocate(&device, 4096).unwrap();

    producer.enqueue().set(&mut src, 0x7E, 4096).unwrap();
    let ready = producer.enqueue().event(EventFlags::sync_only()).unwrap();
    consumer.enqueue().wait(&ready).unwrap();
    consumer.enqueue().copy(&mut dst, &src, 4096).unwrap();

    // Only the consumer is synchronized; the wait pulls the producer along.
    consumer.synchronize().unwrap();
    assert!(ready.query().unwrap());
    assert!(read(&dst).iter().all(|v| *v == 0x7E));
}

#[test]
fn test_blocking_stream_ordered_against_default_stream() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let default = device.default_stream().unwrap();
    let blocking = device.create_stream(StreamConfig::default()).unwrap();
    let mut region = memory::device::allocate(&device, 64).unwrap();

    default.enqueue().set(&mut region, 1, 64).unwrap();
    blocking.enqueue().set(&mut region, 2, 64).unwrap();
    blocking.synchronize().unwrap();

    assert!(default.is_done().unwrap());
    assert!(read(&region).iter().all(|v| *v == 2));
}

#[test]
fn test_synchronous_copy_waits_for_legacy_streams() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let blocking = device.create_stream(StreamConfig::default()).unwrap();
    let mut region = memory::device::allocate(&device, 32).unwrap();

    blocking.enqueue().set(&mut region, 0x42, 32).unwrap();
    assert!(read(&region).iter().all(|v| *v == 0x42));
    assert!(blocking.is_done().unwrap());
}

#[test]
fn test_device_synchronize_drains_every_stream() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let s1 = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let s2 = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut a = memory::device::allocate(&device, 16).unwrap();
    let mut b = memory::device::allocate(&device, 16).unwrap();

    s1.enqueue().set(&mut a, 1, 16).unwrap();
    s2.enqueue().set(&mut b, 2, 16).unwrap();
    device.synchronize().unwrap();

    assert!(s1.is_done().unwrap());
    assert!(s2.is_done().unwrap());
}

#[test]
fn test_run_pending_completes_work() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut region = memory::device::allocate(&device, 16).unwrap();

    stream.enqueue().zero(&mut region, 16).unwrap();
    sim.run_pending();
    assert!(stream.is_done().unwrap());
}

#[test]
fn test_eager_mode_runs_at_enqueue() {
    let (runtime, _sim) =
        sim::simulated_runtime_with_config(SimConfig::default().eager(true)).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut region = memory::device::allocate(&device, 16).unwrap();

    stream.enqueue().set(&mut region, 5, 16).unwrap();
    assert!(stream.is_done().unwrap());
}

#[test]
fn test_fault_is_sticky_until_reported() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let function = sim
        .register_kernel(DeviceId(0), SimKernelSpec::new("trap"), |_| {
            Err(Status::UNKNOWN)
        })
        .unwrap();
    let kernel = Kernel::wrap(&device, function).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();

    unsafe {
        stream
            .enqueue()
            .kernel_launch(&kernel, LaunchConfig::new(1, 1), &KernelArgs::new())
            .unwrap();
    }
    let err = stream.synchronize().unwrap_err();
    assert_eq!(err.status(), Some(Status::UNKNOWN));
    stream.synchronize().unwrap();
}

#[test]
fn test_priority_clamped_to_device_range() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let range = device.stream_priority_range().unwrap();

    assert!(range.greatest <= range.least);
    assert!(!range.is_trivial());

    let urgent = device
        .create_stream(StreamConfig::with_priority(range.greatest - 10))
        .unwrap();
    assert_eq!(urgent.priority().unwrap(), range.greatest);
    assert!(!urgent.synchronizes_with_default());

    let config = StreamConfigBuilder::new().with_priority(range.least).build();
    let relaxed = device.create_stream(config).unwrap();
    assert_eq!(relaxed.priority().unwrap(), range.least);
    assert!(relaxed.synchronizes_with_default());
}

#[test]
fn test_stream_ordered_allocation() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();

    let mut region = stream.enqueue().allocate(2048).unwrap();
    assert_eq!(region.kind(), RegionKind::Device);
    assert_eq!(region.size(), 2048);
    stream.enqueue().set(&mut region, 0xCC, 2048).unwrap();
    stream.synchronize().unwrap();
    assert!(read(&region).iter().all(|v| *v == 0xCC));

    stream.enqueue().free(region).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(sim.call_count("mem_free_async"), 1);
    assert_eq!(sim.call_count("mem_free"), 0);

    let empty = stream.enqueue().allocate(0).unwrap();
    assert!(empty.is_empty());
    assert_eq!(sim.call_count("mem_alloc_async"), 1);
}

#[test]
fn test_async_host_copies() {
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let mut region = memory::device::allocate(&device, 8).unwrap();

    let input = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let mut output = [0u8; 8];
    unsafe {
        stream.enqueue().copy_from_host(&mut region, &input).unwrap();
        stream.enqueue().copy_to_host(&mut output, &region).unwrap();
    }
    stream.synchronize().unwrap();
    assert_eq!(output, input);

    let mut too_small = [0u8; 16];
    let err = unsafe { stream.enqueue().copy_to_host(&mut too_small, &region) };
    assert!(matches!(err, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_cross_device_record_and_wait_rejected() {
    let (runtime, sim) = sim::simulated_runtime_with(vec![
        SimDeviceConfig::default(),
        SimDeviceConfig::default(),
    ])
    .unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();
    let stream = d0.create_stream(StreamConfig::default()).unwrap();
    let foreign = d1.create_event(EventFlags::sync_only()).unwrap();
    let mut foreign_region = memory::device::allocate(&d1, 64).unwrap();

    let calls = sim.total_calls();
    let record = stream.enqueue().record(&foreign).unwrap_err();
    assert!(matches!(
        record,
        Error::DeviceMismatch {
            operation: AffinityOperation::EventRecord,
            ..
        }
    ));

    let wait = stream.enqueue().wait(&foreign).unwrap_err();
    assert!(matches!(
        wait,
        Error::CrossDeviceDependency {
            event_device: DeviceId(1),
            stream_device: DeviceId(0),
        }
    ));
    assert!(wait.is_device_mismatch());
    assert_eq!(sim.total_calls(), calls);

    let free = stream.enqueue().free(foreign_region.take()).unwrap_err();
    assert!(matches!(
        free,
        Error::DeviceMismatch {
            operation: AffinityOperation::StreamMemoryOperation,
            ..
        }
    ));
    assert_eq!(sim.call_count("mem_free_async"), 0);
}

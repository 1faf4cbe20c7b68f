//! Host-side overhead of the proxy layer.
//!
//! Measures what gpuhost adds on top of the driver: ambient context
//! switches, affinity checks, argument packing and stream-ordered enqueue.
//! Runs against the simulated platform so the numbers exclude hardware time.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gpuhost::prelude::*;
use gpuhost::sim::{self, SimConfig, SimDeviceConfig, SimKernelSpec};

/// Benchmark scoped context overrides
fn bench_scoped_override(c: &mut Criterion) {
    let mut group = c.benchmark_group("context/override");
    let (runtime, _sim) = sim::simulated_runtime(2).unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();
    d0.primary_context().unwrap();
    d1.primary_context().unwrap();

    group.bench_function("same_device", |b| {
        let _outer = d0.scope().unwrap();
        b.iter(|| {
            let scope = d0.scope().unwrap();
            black_box(&scope);
        });
    });

    group.bench_function("switch_device", |b| {
        let _outer = d0.scope().unwrap();
        b.iter(|| {
            let scope = d1.scope().unwrap();
            black_box(&scope);
        });
    });

    group.bench_function("nested_4", |b| {
        b.iter(|| {
            let s1 = d0.scope().unwrap();
            let s2 = d1.scope().unwrap();
            let s3 = d0.scope().unwrap();
            let s4 = d1.scope().unwrap();
            black_box((&s1, &s2, &s3, &s4));
        });
    });

    group.finish();
}

/// Benchmark stream-ordered memset and copy enqueue
fn bench_memory_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream/memory");
    let config = SimConfig::with_devices(vec![SimDeviceConfig::default()]).eager(true);
    let (runtime, _sim) = sim::simulated_runtime_with_config(config).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();

    for size in [64usize, 4096, 1 << 20] {
        let mut src = memory::device::allocate(&device, size).unwrap();
        let mut dst = memory::device::allocate(&device, size).unwrap();
        stream.enqueue().zero(&mut src, size).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("set", size), &size, |b, &size| {
            b.iter(|| stream.enqueue().set(&mut dst, 0xAB, size).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("copy", size), &size, |b, &size| {
            b.iter(|| stream.enqueue().copy(&mut dst, &src, size).unwrap());
        });
    }

    group.finish();
}

/// Benchmark event record and query
fn bench_events(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream/event");
    let (runtime, _sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let event = device.create_event(EventFlags::sync_only()).unwrap();

    group.bench_function("record_synchronize", |b| {
        b.iter(|| {
            stream.enqueue().record(&event).unwrap();
            event.synchronize().unwrap();
        });
    });

    group.bench_function("create_destroy", |b| {
        b.iter(|| {
            let event = device.create_event(EventFlags::sync_only()).unwrap();
            black_box(event);
        });
    });

    group.finish();
}

/// Benchmark kernel argument packing and launch
fn bench_launch(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel/launch");
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let function = sim
        .register_kernel(device.id(), SimKernelSpec::new("noop"), |_| Ok(()))
        .unwrap();
    let kernel = Kernel::wrap(&device, function).unwrap();
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();

    group.bench_function("pack_args", |b| {
        b.iter(|| {
            let args = kernel_args![DevicePtr(0x1000), 1024u32, 2.5f32, -1i64];
            black_box(args);
        });
    });

    let args = kernel_args![DevicePtr(0x1000), 1024u32];
    group.bench_function("enqueue_and_sync", |b| {
        b.iter(|| {
            unsafe {
                stream
                    .enqueue()
                    .kernel_launch(&kernel, LaunchConfig::for_elements(1024, 256), &args)
                    .unwrap();
            }
            stream.synchronize().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_scoped_override,
    bench_memory_enqueue,
    bench_events,
    bench_launch,
);

criterion_main!(benches);

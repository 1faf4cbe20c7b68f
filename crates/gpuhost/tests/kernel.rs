//! Integration tests for kernel proxies, occupancy and launches.

use gpuhost::prelude::*;
use gpuhost::sim::{self, SimKernelSpec, SimPlatform};
use gpuhost::{AffinityOperation, BlockUsage, DeviceId};

/// Registers `scale`: multiplies `count` u32 values at `data` by `factor`.
fn register_scale(sim: &SimPlatform, device: &Device, spec: SimKernelSpec) -> Kernel {
    let function = sim
        .register_kernel(device.id(), spec, |launch| {
            let data: DevicePtr = launch.arg(0)?;
            let count: u32 = launch.arg(1)?;
            let factor: u32 = launch.arg(2)?;
            let scaled: Vec<u32> = launch
                .read::<u32>(data, count as usize)?
                .into_iter()
                .map(|v| v * factor)
                .collect();
            launch.write(data, &scaled)
        })
        .unwrap();
    Kernel::wrap(device, function).unwrap()
}

fn upload(device: &Device, values: &[u32]) -> Region {
    let bytes = std::mem::size_of_val(values);
    let mut region = memory::device::allocate(device, bytes).unwrap();
    memory::copy(&mut region, values, bytes).unwrap();
    region
}

fn download(region: &Region) -> Vec<u32> {
    let mut values = vec![0u32; region.size() / 4];
    memory::copy(&mut values, region, region.size()).unwrap();
    values
}

#[test]
fn test_launch_on_stream() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));
    let stream = device.create_stream(StreamConfig::non_blocking()).unwrap();
    let data = upload(&device, &[1, 2, 3, 4]);

    let args = kernel_args![data.device_ptr().unwrap(), 4u32, 10u32];
    unsafe {
        stream
            .enqueue()
            .kernel_launch(&kernel, LaunchConfig::new(1, 4), &args)
            .unwrap();
    }
    assert_eq!(sim.launch_count(), 0);
    stream.synchronize().unwrap();
    assert_eq!(sim.launch_count(), 1);
    assert_eq!(download(&data), vec![10, 20, 30, 40]);
}

#[test]
fn test_launch_on_default_stream() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));
    let data = upload(&device, &[5; 256]);

    let args = KernelArgs::new()
        .arg(data.device_ptr().unwrap())
        .arg(256u32)
        .arg(2u32);
    unsafe { kernel.launch(LaunchConfig::for_elements(256, 128), &args).unwrap() };

    // The synchronous copy waits for the default stream.
    assert_eq!(download(&data), vec![10; 256]);
}

#[test]
fn test_raw_function_launches_in_scope() {
    let (runtime, sim) = sim::simulated_runtime(2).unwrap();
    let d1 = runtime.device(1).unwrap();
    let kernel = register_scale(&sim, &d1, SimKernelSpec::new("scale"));
    let raw = RawFunction::new(kernel.handle());
    let data = upload(&d1, &[3, 3]);

    let scope = d1.scope().unwrap();
    let args = kernel_args![data.device_ptr().unwrap(), 2u32, 3u32];
    unsafe { raw.launch_in(&scope, LaunchConfig::new(1, 2), &args).unwrap() };
    d1.synchronize().unwrap();
    drop(scope);

    assert_eq!(download(&data), vec![9, 9]);
}

#[test]
fn test_device_mismatch_makes_no_platform_call() {
    let (runtime, sim) = sim::simulated_runtime(2).unwrap();
    let d0 = runtime.device(0).unwrap();
    let d1 = runtime.device(1).unwrap();
    let kernel = register_scale(&sim, &d0, SimKernelSpec::new("scale"));
    let stream = d1.create_stream(StreamConfig::default()).unwrap();

    let calls = sim.total_calls();
    let err = unsafe {
        stream
            .enqueue()
            .kernel_launch(&kernel, LaunchConfig::new(1, 1), &KernelArgs::new())
            .unwrap_err()
    };
    assert!(matches!(
        err,
        Error::DeviceMismatch {
            operation: AffinityOperation::KernelLaunch,
            expected: DeviceId(1),
            actual: DeviceId(0),
        }
    ));
    assert!(err.is_device_mismatch());
    assert_eq!(sim.total_calls(), calls);
    assert_eq!(sim.call_count("launch_kernel"), 0);
}

#[test]
fn test_invalid_launch_config_rejected_before_platform() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));

    for config in [LaunchConfig::new(0, 32), LaunchConfig::new(1, (32, 0, 1))] {
        let err = unsafe { kernel.launch(config, &KernelArgs::new()).unwrap_err() };
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
    assert_eq!(sim.call_count("launch_kernel"), 0);
}

#[test]
fn test_oversized_block_reported_by_platform() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(
        &sim,
        &device,
        SimKernelSpec::new("bounded").with_max_threads_per_block(128),
    );

    let err = unsafe { kernel.launch(LaunchConfig::new(1, 256), &KernelArgs::new()).unwrap_err() };
    assert_eq!(err.status(), Some(Status::INVALID_VALUE));
    assert_eq!(sim.call_count("launch_kernel"), 1);
}

#[test]
fn test_attributes_reflect_resource_usage() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(
        &sim,
        &device,
        SimKernelSpec::new("heavy")
            .with_registers(128)
            .with_static_shared_memory(4096)
            .with_versions(75, 86),
    );
    let limits = device.architecture_limits().unwrap();

    let attrs = kernel.attributes().unwrap();
    assert_eq!(attrs.num_regs, 128);
    assert_eq!(attrs.shared_size_bytes, 4096);
    assert_eq!(attrs.max_threads_per_block, limits.max_threads_for_registers(128));
    assert_eq!(attrs.ptx_version, ComputeCapability::new(7, 5));
    assert_eq!(attrs.binary_version, ComputeCapability::new(8, 6));
    assert_eq!(attrs.preferred_shared_memory_carveout, None);
    assert_eq!(kernel.max_threads_per_block().unwrap(), attrs.max_threads_per_block);
}

#[test]
fn test_carveout_validation() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));

    assert!(matches!(
        kernel.set_shared_memory_carveout(101),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(sim.call_count("set_function_attribute"), 0);

    kernel.set_shared_memory_carveout(50).unwrap();
    assert_eq!(
        kernel.attribute(FunctionAttribute::PreferredSharedMemoryCarveout).unwrap(),
        50
    );
    kernel.reset_shared_memory_carveout().unwrap();
    assert_eq!(kernel.attributes().unwrap().preferred_shared_memory_carveout, None);
}

#[test]
fn test_read_only_attribute_rejected() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));

    assert!(matches!(
        kernel.set_attribute(FunctionAttribute::NumRegs, 16),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(sim.call_count("set_function_attribute"), 0);
}

#[test]
fn test_cache_and_bank_settings() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let kernel = register_scale(&sim, &device, SimKernelSpec::new("scale"));

    kernel.set_cache_preference(CachePreference::PreferShared).unwrap();
    kernel
        .set_shared_memory_bank_size(SharedMemoryBankSize::EightBytes)
        .unwrap();
    kernel.set_max_dynamic_shared_memory(16 * 1024).unwrap();
    assert_eq!(
        kernel.attributes().unwrap().max_dynamic_shared_size_bytes,
        16 * 1024
    );
}

#[test]
fn test_occupancy_search() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let limits = device.architecture_limits().unwrap();
    let kernel = register_scale(
        &sim,
        &device,
        SimKernelSpec::new("scale").with_registers(32),
    );

    let params = kernel.min_grid_params_for_max_occupancy(0, 0, false).unwrap();
    assert!(params.block_size > 0);
    assert_eq!(params.block_size % limits.warp_size, 0);
    assert!(params.block_size <= kernel.max_threads_per_block().unwrap());

    let blocks = kernel
        .max_active_blocks_per_multiprocessor(params.block_size, 0, false)
        .unwrap();
    assert_eq!(params.min_grid_size, blocks * limits.sm_count);

    let capped = kernel.min_grid_params_for_max_occupancy(0, 64, false).unwrap();
    assert!(capped.block_size <= 64);

    let with_smem = kernel
        .min_grid_params_for_max_occupancy_with(|block| block as usize * 16, 0, false)
        .unwrap();
    assert!(with_smem.block_size > 0);
}

#[test]
fn test_occupancy_matches_calculator() {
    let (runtime, sim) = sim::simulated_runtime(1).unwrap();
    let device = runtime.device(0).unwrap();
    let limits = device.architecture_limits().unwrap();
    let kernel = register_scale(
        &sim,
        &device,
        SimKernelSpec::new("scale")
            .with_registers(64)
            .with_static_shared_memory(8 * 1024),
    );

    for block_size in [64, 128, 256, 512] {
        let expected = limits.active_blocks_per_sm(&BlockUsage {
            block_size,
            registers_per_thread: 64,
            static_shared_memory: 8 * 1024,
            dynamic_shared_memory: 1024,
        });
        let reported = kernel
            .max_active_blocks_per_multiprocessor(block_size, 1024, false)
            .unwrap();
        assert_eq!(reported, expected, "block size {}", block_size);
    }
}

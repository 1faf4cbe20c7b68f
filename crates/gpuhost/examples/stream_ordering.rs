//! Stream Ordering Example
//!
//! Two non-blocking streams share a buffer. The consumer waits on an event
//! recorded by the producer, so the copy always sees the fill.
//!
//! Run with `RUST_LOG=gpuhost_core=debug` to see every driver call.

use gpuhost::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = RuntimeBuilder::new().backend(Backend::Auto).build()?;
    println!("Runtime platform: {}", runtime.platform().name());

    let device = runtime.device(0)?;
    println!("Using {} ({})", device, device.name()?);

    const BYTES: usize = 1 << 16;

    let producer = Stream::create(&device, StreamConfig::non_blocking())?;
    let consumer = Stream::create(&device, StreamConfig::non_blocking())?;

    let mut source = memory::device::allocate(&device, BYTES)?;
    let mut target = memory::device::allocate(&device, BYTES)?;

    let start = producer.enqueue().event(EventFlags::default())?;
    producer.enqueue().set(&mut source, 0x5A, BYTES)?;
    let filled = producer.enqueue().event(EventFlags::default())?;

    consumer.enqueue().wait(&filled)?;
    consumer.enqueue().copy(&mut target, &source, BYTES)?;
    consumer.synchronize()?;

    let mut host = vec![0u8; BYTES];
    memory::copy(&mut host, &target, BYTES)?;
    let matching = host.iter().filter(|b| **b == 0x5A).count();
    println!("Copied {} bytes, {} match the fill", BYTES, matching);

    println!(
        "Fill took {:?} on the producer stream",
        Event::elapsed_time(&start, &filled)?
    );

    Ok(())
}

//! Deferred stream execution for the simulated platform.
//!
//! Enqueued work is held per stream and only runs when something forces it:
//! a stream, event or context synchronisation, a synchronous copy, a wait on
//! another stream's event, or [`SimPlatform::run_pending`](super::SimPlatform::run_pending).
//! Every operation carries a global sequence number; legacy default-stream
//! ordering is derived from it at execution time.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::trace;

use crate::error::{PlatformResult, Status};
use crate::launch::{KernelArgs, LaunchConfig};
use crate::platform::{DeviceId, Location, RawEventFlags};
use crate::sim::kernel::SimLaunch;
use crate::sim::memory::AllocationKind;
use crate::sim::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StreamKey {
    Default(DeviceId),
    Created(u64),
}

pub(crate) enum Op {
    Copy { dst: u64, src: u64, bytes: usize },
    Fill { dst: u64, value: u8, bytes: usize },
    Launch { function: u64, config: LaunchConfig, args: KernelArgs },
    Record { event: u64 },
    Wait { stream: StreamKey, seq: u64 },
    Free { address: u64 },
    Prefetch { address: u64, bytes: usize, destination: Location },
}

pub(crate) struct SimStream {
    pub(crate) device: DeviceId,
    pub(crate) blocking: bool,
    pub(crate) priority: i32,
    queue: VecDeque<(u64, Op)>,
    completed: u64,
    fault: Option<Status>,
}

impl SimStream {
    pub(crate) fn new(device: DeviceId, blocking: bool, priority: i32) -> Self {
        Self {
            device,
            blocking,
            priority,
            queue: VecDeque::new(),
            completed: 0,
            fault: None,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Report and clear the first failure of executed work.
    pub(crate) fn take_fault(&mut self) -> Option<Status> {
        self.fault.take()
    }
}

pub(crate) struct SimEvent {
    pub(crate) device: DeviceId,
    pub(crate) flags: RawEventFlags,
    pub(crate) recorded: Option<(StreamKey, u64)>,
    pub(crate) reached_at: Option<Instant>,
}

impl State {
    /// Append `op` to a stream and return its sequence number.
    pub(crate) fn push(&mut self, key: StreamKey, op: Op) -> PlatformResult<u64> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let stream = self.streams.get_mut(&key).ok_or(Status::INVALID_HANDLE)?;
        stream.queue.push_back((seq, op));
        Ok(seq)
    }

    /// Run freshly pushed work right away when the platform is eager.
    pub(crate) fn settle(&mut self, key: StreamKey, seq: u64) {
        if self.eager {
            self.drain(key, seq);
        }
    }

    /// Execute queued work of `key` with sequence numbers up to `upto`.
    pub(crate) fn drain(&mut self, key: StreamKey, upto: u64) {
        loop {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            match stream.queue.front() {
                Some((seq, _)) if *seq <= upto => {}
                _ => return,
            }
            let Some((seq, op)) = stream.queue.pop_front() else {
                return;
            };
            let (device, blocking) = (stream.device, stream.blocking);

            match key {
                StreamKey::Default(_) => {
                    for other in self.blocking_streams(device) {
                        self.drain(other, seq - 1);
                    }
                }
                StreamKey::Created(_) if blocking => {
                    self.drain(StreamKey::Default(device), seq - 1);
                }
                StreamKey::Created(_) => {}
            }

            let result = self.execute(seq, op);
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.completed = seq;
                if let Err(status) = result {
                    trace!(?key, seq, %status, "simulated operation failed");
                    stream.fault.get_or_insert(status);
                }
            }
        }
    }

    fn blocking_streams(&self, device: DeviceId) -> Vec<StreamKey> {
        self.streams
            .iter()
            .filter(|(key, stream)| {
                matches!(key, StreamKey::Created(_)) && stream.blocking && stream.device == device
            })
            .map(|(key, _)| *key)
            .collect()
    }

    /// Streams a synchronous copy on `device` must wait for.
    pub(crate) fn drain_legacy(&mut self, device: DeviceId) {
        for key in self.blocking_streams(device) {
            self.drain(key, u64::MAX);
        }
        self.drain(StreamKey::Default(device), u64::MAX);
    }

    /// Drain every stream of `device` and return the first recorded fault.
    pub(crate) fn drain_device(&mut self, device: DeviceId) -> PlatformResult<()> {
        let keys: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.device == device)
            .map(|(key, _)| *key)
            .collect();
        let mut first = Ok(());
        for key in keys {
            if let Err(status) = self.synchronize_stream(key) {
                first = first.and(Err(status));
            }
        }
        first
    }

    /// Drain everything, on every device.
    pub(crate) fn drain_all(&mut self) {
        let keys: Vec<StreamKey> = self.streams.keys().copied().collect();
        for key in keys {
            self.drain(key, u64::MAX);
        }
    }

    /// Drain `key` completely and report (then clear) any fault.
    pub(crate) fn synchronize_stream(&mut self, key: StreamKey) -> PlatformResult<()> {
        self.drain(key, u64::MAX);
        match self.streams.get_mut(&key).and_then(SimStream::take_fault) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    /// True when the latest record of `event` has executed.
    pub(crate) fn event_reached(&self, event: &SimEvent) -> bool {
        match event.recorded {
            None => true,
            Some((key, seq)) => self
                .streams
                .get(&key)
                .map_or(true, |stream| stream.completed >= seq),
        }
    }

    fn execute(&mut self, seq: u64, op: Op) -> PlatformResult<()> {
        match op {
            Op::Copy { dst, src, bytes } => self.memory.copy(dst, src, bytes),
            Op::Fill { dst, value, bytes } => self.memory.fill(dst, value, bytes),
            Op::Launch {
                function,
                config,
                args,
            } => {
                let body = self
                    .functions
                    .get(&function)
                    .map(|f| f.body.clone())
                    .ok_or(Status::INVALID_HANDLE)?;
                self.launches += 1;
                let launch = SimLaunch {
                    config: &config,
                    args: &args,
                    memory: &self.memory,
                };
                body(&launch)
            }
            Op::Record { event } => {
                if let Some(state) = self.events.get_mut(&event) {
                    if matches!(state.recorded, Some((_, recorded)) if recorded == seq) {
                        state.reached_at = Some(Instant::now());
                    }
                }
                Ok(())
            }
            Op::Wait { stream, seq } => {
                self.drain(stream, seq);
                Ok(())
            }
            Op::Free { address } => self.memory.free(address, AllocationKind::Device),
            Op::Prefetch {
                address,
                bytes,
                destination,
            } => {
                self.memory.managed_mut(address, bytes)?.resident = Some(destination);
                Ok(())
            }
        }
    }
}

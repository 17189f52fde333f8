use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{Callstack, Event};

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed on the host since the first call in this process.
pub fn host_now() -> i64 {
    PROCESS_EPOCH.elapsed().as_nanos() as i64
}

/// Receiver of profiling events.
///
/// Events of one context arrive in the order they were produced. Implementations
/// must be cheap when the collector isn't listening: contexts and zones ask
/// [`is_connected`](Profiler::is_connected) before doing any work.
pub trait Profiler: Send + Sync {
    /// Whether somebody is collecting events right now.
    fn is_connected(&self) -> bool;

    /// Current host time in nanoseconds.
    fn now(&self) -> i64 {
        host_now()
    }

    /// Identity of the calling thread.
    fn thread_id(&self) -> u32 {
        thread_id::get() as u32
    }

    fn emit(&self, event: Event);

    /// Captures up to `depth` return addresses of the calling thread.
    fn capture_callstack(&self, _depth: u8) -> Callstack {
        Callstack::new()
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    bytes: Vec<u8>,
    /// Contexts announced so far, replayed to every new collector.
    deferred: Vec<Event>,
}

/// In-process event channel: an ordered stream of serialized events.
///
/// While no collector is connected events are discarded, except for context
/// announcements which are kept and replayed on [`connect`], so a collector
/// joining late can still interpret the ticks of existing contexts.
///
/// [`connect`]: EventChannel::connect
#[derive(Debug)]
pub struct EventChannel {
    connected: AtomicBool,
    state: Mutex<ChannelState>,
}

impl EventChannel {
    /// Creates a channel with a connected collector.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Creates a channel that waits for a collector.
    pub fn disconnected() -> Self {
        Self {
            connected: AtomicBool::new(false),
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn connect(&self) {
        let mut state = self.state.lock();
        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }
        let ChannelState {
            ref mut bytes,
            ref deferred,
        } = *state;
        for event in deferred {
            event.encode(bytes);
        }
        log::debug!("Collector connected, replayed {} contexts", deferred.len());
    }

    /// Stops recording. Events that weren't drained yet are kept.
    pub fn disconnect(&self) {
        let _state = self.state.lock();
        self.connected.store(false, Ordering::Release);
    }

    /// Takes everything recorded so far.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().bytes)
    }
}

impl Profiler for EventChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn emit(&self, event: Event) {
        let mut state = self.state.lock();
        if let Event::NewContext { .. } = event {
            state.deferred.push(event.clone());
        }
        if self.connected.load(Ordering::Acquire) {
            event.encode(&mut state.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventReader, QueryId, QueueKind};

    fn new_context(context: u8) -> Event {
        Event::NewContext {
            host_time: 10,
            device_time: 20,
            thread: 0,
            period: 1.0,
            context,
            accuracy_bits: 0,
            queue_kind: QueueKind::Direct,
        }
    }

    fn gpu_time(query: u64) -> Event {
        Event::GpuTime {
            device_time: 1,
            query_id: QueryId(query),
            context: 0,
        }
    }

    fn decode(bytes: &[u8]) -> Vec<Event> {
        EventReader::new(bytes)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn records_in_order() {
        let channel = EventChannel::new();
        channel.emit(new_context(0));
        channel.emit(gpu_time(0));
        channel.emit(gpu_time(1));
        assert_eq!(
            decode(&channel.drain()),
            [new_context(0), gpu_time(0), gpu_time(1)]
        );
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn replays_contexts_on_connect() {
        let channel = EventChannel::disconnected();
        assert!(!channel.is_connected());
        channel.emit(new_context(3));
        channel.emit(gpu_time(0));
        assert!(channel.drain().is_empty());

        channel.connect();
        channel.emit(gpu_time(1));
        assert_eq!(decode(&channel.drain()), [new_context(3), gpu_time(1)]);

        // Reconnecting while connected doesn't replay again.
        channel.connect();
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn host_clock_is_monotonic() {
        let first = host_now();
        let second = host_now();
        assert!(first >= 0);
        assert!(second >= first);
    }
}

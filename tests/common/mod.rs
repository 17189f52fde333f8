//! Test utilities for the gpu-timeline test suite.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use gpu_timeline::{
    soft, Callstack, ContextDescriptor, CreateContextError, Event, Profiler, QueryId,
    QueueContext, QueueKind, TimestampCapabilities,
};
use parking_lot::Mutex;

/// Profiler double recording every event it receives.
#[derive(Debug)]
pub struct RecordingProfiler {
    connected: AtomicBool,
    events: Mutex<Vec<Event>>,
}

impl RecordingProfiler {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Query ids and device times of the `GpuTime` events received so far.
    pub fn gpu_times(&self) -> Vec<(QueryId, i64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match *event {
                Event::GpuTime {
                    query_id,
                    device_time,
                    ..
                } => Some((query_id, device_time)),
                _ => None,
            })
            .collect()
    }
}

impl Profiler for RecordingProfiler {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn capture_callstack(&self, depth: u8) -> Callstack {
        (1..=u64::from(depth)).collect()
    }
}

/// Parameters of the device, queue and context a test runs against.
#[derive(Clone, Debug)]
pub struct TestParameters {
    pub capabilities: TimestampCapabilities,
    pub max_query_count: u32,
    pub queue_kind: QueueKind,
    pub frequency: u64,
    pub clock_start: u64,
    pub clock_step: u64,
    pub connected: bool,
    pub query_capacity: u32,
    pub callstack_depth: u8,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            capabilities: TimestampCapabilities::all(),
            max_query_count: u32::MAX,
            queue_kind: QueueKind::Direct,
            frequency: 1_000_000_000,
            clock_start: 1_000,
            clock_step: 10,
            connected: true,
            query_capacity: 64,
            callstack_depth: 0,
        }
    }
}

impl TestParameters {
    pub fn capabilities(mut self, capabilities: TimestampCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn max_query_count(mut self, count: u32) -> Self {
        self.max_query_count = count;
        self
    }

    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    pub fn frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn clock(mut self, start: u64, step: u64) -> Self {
        self.clock_start = start;
        self.clock_step = step;
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub fn query_capacity(mut self, capacity: u32) -> Self {
        self.query_capacity = capacity;
        self
    }

    pub fn callstack_depth(mut self, depth: u8) -> Self {
        self.callstack_depth = depth;
        self
    }
}

pub struct TestingContext {
    pub device: Arc<soft::Device>,
    pub queue: soft::Queue,
    pub profiler: Arc<RecordingProfiler>,
    pub params: TestParameters,
}

impl TestingContext {
    pub fn create_context(&self) -> Result<QueueContext<soft::Api>, CreateContextError> {
        let desc = ContextDescriptor {
            label: Some("test"),
            query_capacity: self.params.query_capacity,
            callstack_depth: self.params.callstack_depth,
        };
        QueueContext::new(
            Arc::clone(&self.device),
            &self.queue,
            Arc::clone(&self.profiler) as Arc<dyn Profiler>,
            &desc,
        )
    }

    /// Creates the context, failing the test if that's not possible.
    pub fn context(&self) -> QueueContext<soft::Api> {
        match self.create_context() {
            Ok(context) => context,
            Err(err) => panic!("Failed to create a context: {}", err),
        }
    }
}

pub fn initialize_test(params: TestParameters, test_function: impl FnOnce(TestingContext)) {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = soft::Device::new()
        .with_capabilities(params.capabilities)
        .with_max_query_count(params.max_query_count);
    let queue = soft::Queue::new(params.queue_kind)
        .with_frequency(params.frequency)
        .with_clock(params.clock_start, params.clock_step);
    let profiler = Arc::new(RecordingProfiler::new(params.connected));

    test_function(TestingContext {
        device: Arc::new(device),
        queue,
        profiler,
        params,
    });
}

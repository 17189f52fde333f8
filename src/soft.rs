//! Software backend.
//!
//! Timestamps come from a [`DeviceClock`] owned by the queue, which advances by
//! a fixed step every time a timestamp executes. Commands recorded into a
//! [`CommandEncoder`] run when the encoder is handed to [`Queue::submit`].
//!
//! The device can be configured to refuse large query sets, copy queue
//! timestamps or buffer mapping, and the queue to fail calibration, which
//! makes the backend suitable for exercising the failure paths of contexts.

use std::{
    ops::Range,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    host_now, BufferAddress, BufferDescriptor, BufferUses, ClockCalibration, DeviceError,
    MemoryRange, QuerySetDescriptor, QueryType, QueueKind, TimestampCapabilities, QUERY_SIZE,
};

type DeviceResult<T> = Result<T, DeviceError>;
type Storage = Arc<[AtomicU64]>;

fn allocate_storage(len: usize) -> Storage {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

#[derive(Clone, Debug)]
pub struct Api;

impl crate::Api for Api {
    type Device = Device;
    type Queue = Queue;
    type CommandEncoder = CommandEncoder;

    type QuerySet = QuerySet;
    type Buffer = Buffer;
}

#[derive(Debug)]
pub struct QuerySet {
    values: Storage,
}

#[derive(Debug)]
pub struct Buffer {
    usage: BufferUses,
    size: BufferAddress,
    words: Storage,
}

#[derive(Debug)]
pub struct Device {
    capabilities: TimestampCapabilities,
    max_query_count: u32,
    fail_map: AtomicBool,
    query_set_attempts: Mutex<Vec<u32>>,
    query_sets: Mutex<Vec<(QueryType, u32)>>,
    buffers: Mutex<Vec<(BufferAddress, BufferUses)>>,
    live_query_sets: AtomicUsize,
    live_buffers: AtomicUsize,
}

impl Device {
    /// Creates a device with timestamps on every queue kind and no limit on
    /// the size of query sets.
    pub fn new() -> Self {
        Self {
            capabilities: TimestampCapabilities::all(),
            max_query_count: u32::MAX,
            fail_map: AtomicBool::new(false),
            query_set_attempts: Mutex::new(Vec::new()),
            query_sets: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            live_query_sets: AtomicUsize::new(0),
            live_buffers: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(self, capabilities: TimestampCapabilities) -> Self {
        Self {
            capabilities,
            ..self
        }
    }

    /// Makes query sets larger than `count` fail with [`DeviceError::OutOfMemory`].
    pub fn with_max_query_count(self, count: u32) -> Self {
        Self {
            max_query_count: count,
            ..self
        }
    }

    /// Makes [`map_buffer`](crate::Device::map_buffer) fail with [`DeviceError::Lost`].
    pub fn set_map_failure(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::Relaxed);
    }

    /// Sizes of all query sets requested so far, in order, successful or not.
    pub fn query_set_attempts(&self) -> Vec<u32> {
        self.query_set_attempts.lock().clone()
    }

    /// Type and size of every query set created so far.
    pub fn created_query_sets(&self) -> Vec<(QueryType, u32)> {
        self.query_sets.lock().clone()
    }

    /// Size and usage of every buffer created so far.
    pub fn created_buffers(&self) -> Vec<(BufferAddress, BufferUses)> {
        self.buffers.lock().clone()
    }

    pub fn live_query_sets(&self) -> usize {
        self.live_query_sets.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }
}

impl crate::Device<Api> for Device {
    unsafe fn timestamp_capabilities(&self) -> TimestampCapabilities {
        self.capabilities
    }

    unsafe fn create_query_set(&self, desc: &QuerySetDescriptor) -> DeviceResult<QuerySet> {
        self.query_set_attempts.lock().push(desc.count);
        if desc.ty == QueryType::CopyQueueTimestamp
            && !self.capabilities.contains(TimestampCapabilities::COPY_QUEUE)
        {
            return Err(DeviceError::Unsupported);
        }
        if desc.count > self.max_query_count {
            return Err(DeviceError::OutOfMemory);
        }
        self.query_sets.lock().push((desc.ty, desc.count));
        self.live_query_sets.fetch_add(1, Ordering::Relaxed);
        Ok(QuerySet {
            values: allocate_storage(desc.count as usize),
        })
    }
    unsafe fn destroy_query_set(&self, _set: QuerySet) {
        self.live_query_sets.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn create_buffer(&self, desc: &BufferDescriptor) -> DeviceResult<Buffer> {
        let words = (desc.size + QUERY_SIZE - 1) / QUERY_SIZE;
        self.buffers.lock().push((desc.size, desc.usage));
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer {
            usage: desc.usage,
            size: desc.size,
            words: allocate_storage(words as usize),
        })
    }
    unsafe fn destroy_buffer(&self, _buffer: Buffer) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }
    unsafe fn map_buffer(&self, buffer: &Buffer, range: MemoryRange) -> DeviceResult<NonNull<u8>> {
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(DeviceError::Lost);
        }
        if !buffer.usage.contains(BufferUses::MAP_READ)
            || range.end > buffer.size
            || range.start % QUERY_SIZE != 0
        {
            return Err(DeviceError::Unsupported);
        }
        let word = (range.start / QUERY_SIZE) as usize;
        let ptr = buffer.words[word..].as_ptr() as *mut u8;
        NonNull::new(ptr).ok_or(DeviceError::Lost)
    }
    unsafe fn unmap_buffer(&self, _buffer: &Buffer) {}
}

/// Tick counter of a simulated device.
#[derive(Debug)]
pub struct DeviceClock {
    ticks: AtomicU64,
    step: u64,
}

impl DeviceClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
            step,
        }
    }

    /// Current tick count, without advancing the clock.
    pub fn read(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Returns the current tick count and advances the clock by one step.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(self.step, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct Queue {
    kind: QueueKind,
    frequency: u64,
    clock: DeviceClock,
    fail_calibration: AtomicBool,
}

impl Queue {
    /// Creates a queue ticking at 1 GHz, starting from tick 0 and advancing
    /// by 1 per executed timestamp.
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            frequency: 1_000_000_000,
            clock: DeviceClock::new(0, 1),
            fail_calibration: AtomicBool::new(false),
        }
    }

    /// Reported timestamp frequency. Zero is accepted and reported as is.
    pub fn with_frequency(self, frequency: u64) -> Self {
        Self { frequency, ..self }
    }

    pub fn with_clock(self, start: u64, step: u64) -> Self {
        Self {
            clock: DeviceClock::new(start, step),
            ..self
        }
    }

    /// Makes frequency and calibration queries fail with [`DeviceError::Lost`].
    pub fn set_calibration_failure(&self, fail: bool) {
        self.fail_calibration.store(fail, Ordering::Relaxed);
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    /// Executes the commands of `encoders`, in order.
    pub fn submit<I: IntoIterator<Item = CommandEncoder>>(&self, encoders: I) {
        profiling::scope!("soft::Queue::submit");
        for encoder in encoders {
            for command in encoder.commands {
                self.execute(command);
            }
        }
    }

    fn execute(&self, command: Command) {
        match command {
            Command::WriteTimestamp { values, index } => match values.get(index as usize) {
                Some(value) => value.store(self.clock.tick(), Ordering::Release),
                None => log::warn!("Timestamp written to missing query {}", index),
            },
            Command::ResolveQueries {
                values,
                range,
                words,
                offset,
            } => {
                let first = (offset / QUERY_SIZE) as usize;
                for (i, index) in range.enumerate() {
                    let value = match values.get(index as usize) {
                        Some(value) => value.load(Ordering::Acquire),
                        None => {
                            log::warn!("Resolved missing query {}", index);
                            continue;
                        }
                    };
                    if let Some(word) = words.get(first + i) {
                        word.store(value, Ordering::Release);
                    }
                }
            }
        }
    }
}

impl crate::Queue<Api> for Queue {
    unsafe fn kind(&self) -> QueueKind {
        self.kind
    }

    unsafe fn timestamp_frequency(&self) -> DeviceResult<u64> {
        if self.fail_calibration.load(Ordering::Relaxed) {
            return Err(DeviceError::Lost);
        }
        Ok(self.frequency)
    }

    unsafe fn clock_calibration(&self) -> DeviceResult<ClockCalibration> {
        if self.fail_calibration.load(Ordering::Relaxed) {
            return Err(DeviceError::Lost);
        }
        Ok(ClockCalibration {
            gpu_timestamp: self.clock.read(),
            cpu_timestamp: host_now() as u64,
        })
    }
}

#[derive(Debug)]
enum Command {
    WriteTimestamp {
        values: Storage,
        index: u32,
    },
    ResolveQueries {
        values: Storage,
        range: Range<u32>,
        words: Storage,
        offset: BufferAddress,
    },
}

/// Recorded commands, executed on [`Queue::submit`].
#[derive(Debug, Default)]
pub struct CommandEncoder {
    commands: Vec<Command>,
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Query indices of the recorded timestamp writes.
    pub fn timestamps(&self) -> Vec<u32> {
        self.commands
            .iter()
            .filter_map(|command| match *command {
                Command::WriteTimestamp { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    /// Query ranges and buffer offsets of the recorded resolves.
    pub fn resolves(&self) -> Vec<(Range<u32>, BufferAddress)> {
        self.commands
            .iter()
            .filter_map(|command| match *command {
                Command::ResolveQueries {
                    ref range, offset, ..
                } => Some((range.clone(), offset)),
                _ => None,
            })
            .collect()
    }
}

impl crate::CommandEncoder<Api> for CommandEncoder {
    unsafe fn write_timestamp(&mut self, set: &QuerySet, index: u32) {
        self.commands.push(Command::WriteTimestamp {
            values: Arc::clone(&set.values),
            index,
        });
    }

    unsafe fn resolve_queries(
        &mut self,
        set: &QuerySet,
        range: Range<u32>,
        buffer: &Buffer,
        offset: BufferAddress,
    ) {
        self.commands.push(Command::ResolveQueries {
            values: Arc::clone(&set.values),
            range,
            words: Arc::clone(&buffer.words),
            offset,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandEncoder as _, Device as _, Queue as _};

    #[test]
    fn clock_advances_per_timestamp() {
        let clock = DeviceClock::new(100, 7);
        assert_eq!(clock.read(), 100);
        assert_eq!(clock.tick(), 100);
        assert_eq!(clock.tick(), 107);
        assert_eq!(clock.read(), 114);
    }

    #[test]
    fn resolve_copies_timestamps() {
        let device = Device::new();
        let queue = Queue::new(QueueKind::Direct).with_clock(50, 5);
        let set = unsafe {
            device.create_query_set(&QuerySetDescriptor {
                label: None,
                ty: QueryType::Timestamp,
                count: 4,
            })
        }
        .unwrap();
        let buffer = unsafe {
            device.create_buffer(&BufferDescriptor {
                label: None,
                size: 4 * QUERY_SIZE,
                usage: BufferUses::MAP_READ | BufferUses::COPY_DST,
            })
        }
        .unwrap();

        let mut encoder = CommandEncoder::new();
        unsafe {
            encoder.write_timestamp(&set, 2);
            encoder.write_timestamp(&set, 3);
            encoder.resolve_queries(&set, 2..4, &buffer, 2 * QUERY_SIZE);
        }
        assert_eq!(encoder.timestamps(), [2, 3]);
        assert_eq!(encoder.resolves(), [(2..4, 16)]);
        queue.submit(Some(encoder));

        let ptr = unsafe { device.map_buffer(&buffer, 0..4 * QUERY_SIZE) }.unwrap();
        let values = unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<u64>(), 4) };
        assert_eq!(values, [0, 0, 50, 55]);
        unsafe {
            device.unmap_buffer(&buffer);
            device.destroy_buffer(buffer);
            device.destroy_query_set(set);
        }
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_query_sets(), 0);
    }

    #[test]
    fn copy_queue_timestamps_need_capability() {
        let device = Device::new().with_capabilities(TimestampCapabilities::QUEUE);
        let desc = QuerySetDescriptor {
            label: None,
            ty: QueryType::CopyQueueTimestamp,
            count: 8,
        };
        let err = unsafe { device.create_query_set(&desc) }.unwrap_err();
        assert_eq!(err, DeviceError::Unsupported);
    }

    #[test]
    fn calibration_does_not_advance_clock() {
        let queue = Queue::new(QueueKind::Compute).with_clock(10, 3);
        let calibration = unsafe { queue.clock_calibration() }.unwrap();
        assert_eq!(calibration.gpu_timestamp, 10);
        assert_eq!(queue.clock().read(), 10);

        queue.set_calibration_failure(true);
        assert_eq!(
            unsafe { queue.timestamp_frequency() },
            Err(DeviceError::Lost)
        );
    }
}

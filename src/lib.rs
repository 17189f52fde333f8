/*! This library correlates GPU timestamps with CPU time for profiled zones.
 *
 *  A [`QueueContext`] owns a ring of timestamp query slots for one GPU queue.
 *  [`ZoneScope`]s write a timestamp into the ring when they open and close, and
 *  immediately report both ends to a [`Profiler`] with the host time attached.
 *  The raw device ticks are resolved by the GPU into a host-readable buffer and
 *  harvested in batches by [`QueueContext::collect`], which emits one
 *  [`Event::GpuTime`] per query. The collector pairs every tick with its zone
 *  end by query id and context id, and maps ticks to host time using the
 *  calibration reported once per context.
 *
 *  The graphics backend is consumed through the [`Api`] trait family:
 *  - Fully unsafe: zero overhead, zero validation.
 *  - Backend objects are passed by references and returned by value, without ids.
 *  - Mapping is persistent, with explicit synchronization.
 */

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    unsafe_op_in_unsafe_fn,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

#[macro_use]
mod macros;

mod calibration;
mod context;
pub mod event;
pub mod init;
mod profiler;
mod ring;
pub mod soft;
mod zone;

use std::{fmt, ops::Range, ptr::NonNull};

use bitflags::bitflags;
use thiserror::Error;

pub use calibration::CalibrationRecord;
pub use context::{ContextId, QueueContext};
pub use event::{Callstack, DecodeError, Event, EventReader, SourceLocation, MAX_CALLSTACK_DEPTH};
pub use profiler::{host_now, EventChannel, Profiler};
pub use ring::{QueryId, QueryRing};
pub use zone::ZoneScope;

/// Default number of query slots requested per queue.
///
/// Queries are begin and end markers, so a ring can hold half as many zones.
pub const MAX_QUERIES: u32 = 64 * 1024;
/// Smallest usable ring: one zone needs two slots.
pub const MIN_QUERIES: u32 = 2;
/// Size of one resolved timestamp in the readback buffer.
pub const QUERY_SIZE: BufferAddress = 8;

pub type Label<'a> = Option<&'a str>;
/// Integral type used for buffer offsets.
pub type BufferAddress = u64;
pub type MemoryRange = Range<BufferAddress>;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum DeviceError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device is lost")]
    Lost,
    #[error("operation is not supported")]
    Unsupported,
}

/// Error encountered while creating a [`QueueContext`].
#[derive(Clone, Debug, PartialEq, Error)]
pub enum CreateContextError {
    #[error("timestamp queries are not supported on {0:?} queues of this device")]
    DeviceUnsupported(QueueKind),
    #[error("failed to calibrate the queue clock")]
    CalibrationFailed(#[source] DeviceError),
    #[error("queue reported an invalid timestamp frequency of {0} Hz")]
    InvalidFrequency(u64),
    #[error("unable to create a timestamp query set, even after shrinking it from {requested} queries")]
    QuerySetCreation { requested: u32 },
    #[error("all GPU context ids of this process are in use")]
    TooManyContexts,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Error encountered while allocating a query slot.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum QueryError {
    #[error("submitted too many GPU queries: all {capacity} slots are waiting to be collected")]
    CapacityExceeded { capacity: u32 },
}

pub trait Api: Clone + Sized {
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type CommandEncoder: CommandEncoder<Self>;

    type QuerySet: fmt::Debug + Send + Sync;
    type Buffer: fmt::Debug + Send + Sync + 'static;
}

pub trait Device<A: Api> {
    /// Returns the queue types this device can write timestamps on.
    unsafe fn timestamp_capabilities(&self) -> TimestampCapabilities;

    unsafe fn create_query_set(
        &self,
        desc: &QuerySetDescriptor,
    ) -> Result<A::QuerySet, DeviceError>;
    unsafe fn destroy_query_set(&self, set: A::QuerySet);

    /// Creates a new buffer.
    unsafe fn create_buffer(&self, desc: &BufferDescriptor) -> Result<A::Buffer, DeviceError>;
    unsafe fn destroy_buffer(&self, buffer: A::Buffer);
    /// Maps `range` of a `MAP_READ` buffer for host reads.
    ///
    /// The returned pointer is aligned to [`QUERY_SIZE`] when `range.start` is.
    unsafe fn map_buffer(
        &self,
        buffer: &A::Buffer,
        range: MemoryRange,
    ) -> Result<NonNull<u8>, DeviceError>;
    unsafe fn unmap_buffer(&self, buffer: &A::Buffer);
}

pub trait Queue<A: Api> {
    unsafe fn kind(&self) -> QueueKind;
    /// Number of device clock ticks per second.
    unsafe fn timestamp_frequency(&self) -> Result<u64, DeviceError>;
    /// Samples the device and host clocks at the same moment.
    unsafe fn clock_calibration(&self) -> Result<ClockCalibration, DeviceError>;
}

pub trait CommandEncoder<A: Api> {
    /// Records the device clock into query `index` of `set` when the
    /// encoded work reaches this point.
    unsafe fn write_timestamp(&mut self, set: &A::QuerySet, index: u32);

    /// Copies the values of queries in `range` into `buffer`, starting at byte `offset`.
    ///
    /// Note: `buffer` has to be created with `BufferUses::COPY_DST`.
    unsafe fn resolve_queries(
        &mut self,
        set: &A::QuerySet,
        range: Range<u32>,
        buffer: &A::Buffer,
        offset: BufferAddress,
    );
}

bitflags!(
    /// Queue types a device supports timestamp queries on.
    pub struct TimestampCapabilities: u32 {
        /// Direct and compute queues.
        const QUEUE = 1;
        /// Copy queues, which need a dedicated query type.
        const COPY_QUEUE = 2;
    }
);

bitflags!(
    /// Ways a buffer is accessed.
    pub struct BufferUses: u32 {
        const MAP_READ = 1;
        const COPY_DST = 2;
    }
);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "trace", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

impl QueueKind {
    pub(crate) fn required_capability(self) -> TimestampCapabilities {
        match self {
            Self::Direct | Self::Compute => TimestampCapabilities::QUEUE,
            Self::Copy => TimestampCapabilities::COPY_QUEUE,
        }
    }

    pub(crate) fn query_type(self) -> QueryType {
        match self {
            Self::Direct | Self::Compute => QueryType::Timestamp,
            Self::Copy => QueryType::CopyQueueTimestamp,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum QueryType {
    Timestamp,
    CopyQueueTimestamp,
}

/// A simultaneous sample of the device and host clocks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockCalibration {
    pub gpu_timestamp: u64,
    pub cpu_timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct QuerySetDescriptor<'a> {
    pub label: Label<'a>,
    pub ty: QueryType,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: Label<'a>,
    pub size: BufferAddress,
    pub usage: BufferUses,
}

/// Describes a [`QueueContext`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "trace", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextDescriptor<'a> {
    /// Debug label of the context and its resources.
    #[cfg_attr(feature = "trace", serde(borrow))]
    pub label: Label<'a>,
    /// Number of query slots to ask the device for.
    ///
    /// The context may end up with fewer if the device can't provide them,
    /// but never with fewer than [`MIN_QUERIES`].
    pub query_capacity: u32,
    /// Depth of the call stack captured when a zone begins, 0 to disable.
    ///
    /// Clamped to [`MAX_CALLSTACK_DEPTH`].
    pub callstack_depth: u8,
}

impl Default for ContextDescriptor<'_> {
    fn default() -> Self {
        Self {
            label: None,
            query_capacity: MAX_QUERIES,
            callstack_depth: 0,
        }
    }
}

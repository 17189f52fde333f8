//! Events reported to the profiling collector, and their wire framing.
//!
//! Every record starts with a one byte tag, followed by the fields of the
//! event packed in little-endian order:
//!
//! | Tag | Event                | Fields                                                      |
//! |-----|----------------------|-------------------------------------------------------------|
//! | 0   | `NewContext`         | i64 host, i64 device, u32 thread, f32 period, u8 context, u8 accuracy bits, u8 queue kind |
//! | 1   | `ZoneBegin`          | i64 host, u32 thread, u16 query, u8 context, u64 source location |
//! | 2   | `ZoneBeginCallstack` | same as `ZoneBegin`                                         |
//! | 3   | `ZoneEnd`            | i64 host, u32 thread, u16 query, u8 context                 |
//! | 4   | `GpuTime`            | i64 device, u16 query, u8 context                           |
//! | 5   | `Callstack`          | u32 thread, u8 depth, `depth` × u64 frame                   |
//!
//! Query ids are truncated to 16 bits on the wire.

use std::convert::TryInto;

use arrayvec::ArrayVec;
use thiserror::Error;

use crate::{QueryId, QueueKind};

/// Deepest call stack that can be attached to a zone.
pub const MAX_CALLSTACK_DEPTH: usize = 62;

/// Return addresses of a captured call stack, innermost first.
pub type Callstack = ArrayVec<u64, MAX_CALLSTACK_DEPTH>;

/// Static description of where a zone is defined.
///
/// Created by the [`source_location!`](crate::source_location) and
/// [`zone!`](crate::zone) macros.
#[derive(Debug)]
pub struct SourceLocation {
    pub name: &'static str,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub color: u32,
}

impl SourceLocation {
    /// Opaque token identifying this location in begin events.
    pub fn token(&'static self) -> u64 {
        self as *const Self as usize as u64
    }
}

mod tag {
    pub const NEW_CONTEXT: u8 = 0;
    pub const ZONE_BEGIN: u8 = 1;
    pub const ZONE_BEGIN_CALLSTACK: u8 = 2;
    pub const ZONE_END: u8 = 3;
    pub const GPU_TIME: u8 = 4;
    pub const CALLSTACK: u8 = 5;
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "trace", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    /// Calibration of a new context. Sent once, before any other event of the context.
    NewContext {
        host_time: i64,
        device_time: i64,
        /// Always 0: calibration isn't attributed to a thread.
        thread: u32,
        /// Nanoseconds per device tick.
        period: f32,
        context: u8,
        accuracy_bits: u8,
        queue_kind: QueueKind,
    },
    ZoneBegin {
        host_time: i64,
        thread: u32,
        query_id: QueryId,
        context: u8,
        source_location: u64,
    },
    /// Same as `ZoneBegin`, announcing that a `Callstack` event follows.
    ZoneBeginCallstack {
        host_time: i64,
        thread: u32,
        query_id: QueryId,
        context: u8,
        source_location: u64,
    },
    ZoneEnd {
        host_time: i64,
        thread: u32,
        query_id: QueryId,
        context: u8,
    },
    /// Raw device ticks recorded by a query.
    GpuTime {
        device_time: i64,
        query_id: QueryId,
        context: u8,
    },
    Callstack { thread: u32, frames: Callstack },
}

/// Error encountered when decoding serialized events.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum DecodeError {
    #[error("unknown event tag {0}")]
    UnknownTag(u8),
    #[error("unknown queue kind {0}")]
    UnknownQueueKind(u8),
    #[error("callstack of depth {0} exceeds the maximum of {}", MAX_CALLSTACK_DEPTH)]
    CallstackTooDeep(u8),
    #[error("record ended after {available} bytes, {needed} more were expected")]
    UnexpectedEnd { available: usize, needed: usize },
}

fn queue_kind_to_raw(kind: QueueKind) -> u8 {
    match kind {
        QueueKind::Direct => 0,
        QueueKind::Compute => 1,
        QueueKind::Copy => 2,
    }
}

fn queue_kind_from_raw(raw: u8) -> Result<QueueKind, DecodeError> {
    Ok(match raw {
        0 => QueueKind::Direct,
        1 => QueueKind::Compute,
        2 => QueueKind::Copy,
        _ => return Err(DecodeError::UnknownQueueKind(raw)),
    })
}

impl Event {
    /// Appends the serialized record of this event to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::NewContext {
                host_time,
                device_time,
                thread,
                period,
                context,
                accuracy_bits,
                queue_kind,
            } => {
                out.push(tag::NEW_CONTEXT);
                out.extend_from_slice(&host_time.to_le_bytes());
                out.extend_from_slice(&device_time.to_le_bytes());
                out.extend_from_slice(&thread.to_le_bytes());
                out.extend_from_slice(&period.to_le_bytes());
                out.push(context);
                out.push(accuracy_bits);
                out.push(queue_kind_to_raw(queue_kind));
            }
            Self::ZoneBegin {
                host_time,
                thread,
                query_id,
                context,
                source_location,
            }
            | Self::ZoneBeginCallstack {
                host_time,
                thread,
                query_id,
                context,
                source_location,
            } => {
                out.push(match *self {
                    Self::ZoneBegin { .. } => tag::ZONE_BEGIN,
                    _ => tag::ZONE_BEGIN_CALLSTACK,
                });
                out.extend_from_slice(&host_time.to_le_bytes());
                out.extend_from_slice(&thread.to_le_bytes());
                out.extend_from_slice(&query_id.truncate().to_le_bytes());
                out.push(context);
                out.extend_from_slice(&source_location.to_le_bytes());
            }
            Self::ZoneEnd {
                host_time,
                thread,
                query_id,
                context,
            } => {
                out.push(tag::ZONE_END);
                out.extend_from_slice(&host_time.to_le_bytes());
                out.extend_from_slice(&thread.to_le_bytes());
                out.extend_from_slice(&query_id.truncate().to_le_bytes());
                out.push(context);
            }
            Self::GpuTime {
                device_time,
                query_id,
                context,
            } => {
                out.push(tag::GPU_TIME);
                out.extend_from_slice(&device_time.to_le_bytes());
                out.extend_from_slice(&query_id.truncate().to_le_bytes());
                out.push(context);
            }
            Self::Callstack { thread, ref frames } => {
                out.push(tag::CALLSTACK);
                out.extend_from_slice(&thread.to_le_bytes());
                out.push(frames.len() as u8);
                for frame in frames {
                    out.extend_from_slice(&frame.to_le_bytes());
                }
            }
        }
    }

    /// Decodes the record at the start of `bytes`.
    ///
    /// Returns the event and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut cursor = Cursor { bytes, offset: 0 };
        let event = match cursor.u8()? {
            tag::NEW_CONTEXT => Self::NewContext {
                host_time: cursor.i64()?,
                device_time: cursor.i64()?,
                thread: cursor.u32()?,
                period: f32::from_le_bytes(cursor.array()?),
                context: cursor.u8()?,
                accuracy_bits: cursor.u8()?,
                queue_kind: queue_kind_from_raw(cursor.u8()?)?,
            },
            raw @ tag::ZONE_BEGIN | raw @ tag::ZONE_BEGIN_CALLSTACK => {
                let host_time = cursor.i64()?;
                let thread = cursor.u32()?;
                let query_id = QueryId(u64::from(cursor.u16()?));
                let context = cursor.u8()?;
                let source_location = cursor.u64()?;
                if raw == tag::ZONE_BEGIN {
                    Self::ZoneBegin {
                        host_time,
                        thread,
                        query_id,
                        context,
                        source_location,
                    }
                } else {
                    Self::ZoneBeginCallstack {
                        host_time,
                        thread,
                        query_id,
                        context,
                        source_location,
                    }
                }
            }
            tag::ZONE_END => Self::ZoneEnd {
                host_time: cursor.i64()?,
                thread: cursor.u32()?,
                query_id: QueryId(u64::from(cursor.u16()?)),
                context: cursor.u8()?,
            },
            tag::GPU_TIME => Self::GpuTime {
                device_time: cursor.i64()?,
                query_id: QueryId(u64::from(cursor.u16()?)),
                context: cursor.u8()?,
            },
            tag::CALLSTACK => {
                let thread = cursor.u32()?;
                let depth = cursor.u8()?;
                if usize::from(depth) > MAX_CALLSTACK_DEPTH {
                    return Err(DecodeError::CallstackTooDeep(depth));
                }
                let mut frames = Callstack::new();
                for _ in 0..depth {
                    frames.push(cursor.u64()?);
                }
                Self::Callstack { thread, frames }
            }
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok((event, cursor.offset))
    }

    /// Context the event belongs to, if any.
    pub fn context(&self) -> Option<u8> {
        match *self {
            Self::NewContext { context, .. }
            | Self::ZoneBegin { context, .. }
            | Self::ZoneBeginCallstack { context, .. }
            | Self::ZoneEnd { context, .. }
            | Self::GpuTime { context, .. } => Some(context),
            Self::Callstack { .. } => None,
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let rest = &self.bytes[self.offset..];
        match rest.get(..N) {
            Some(slice) => {
                self.offset += N;
                // The length was checked by `get`.
                Ok(slice.try_into().unwrap_or([0; N]))
            }
            None => Err(DecodeError::UnexpectedEnd {
                available: self.bytes.len(),
                needed: N - rest.len(),
            }),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.array::<1>().map(|bytes| bytes[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.array().map(i64::from_le_bytes)
    }
}

/// Iterator over the events serialized in a byte stream.
///
/// Stops after the first malformed record.
#[derive(Debug)]
pub struct EventReader<'a> {
    bytes: &'a [u8],
    failed: bool,
}

impl<'a> EventReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            failed: false,
        }
    }
}

impl Iterator for EventReader<'_> {
    type Item = Result<Event, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.bytes.is_empty() {
            return None;
        }
        match Event::decode(self.bytes) {
            Ok((event, size)) => {
                self.bytes = &self.bytes[size..];
                Some(Ok(event))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

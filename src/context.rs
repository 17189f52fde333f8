use std::{
    fmt,
    mem::ManuallyDrop,
    ops::Range,
    slice,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    Api, BufferAddress, BufferDescriptor, BufferUses, CalibrationRecord, CommandEncoder as _,
    ContextDescriptor, CreateContextError, Device as _, DeviceError, Event, Profiler, QueryId,
    QueryRing, QuerySetDescriptor, Queue as _, QueueKind, SourceLocation, ZoneScope,
    MAX_CALLSTACK_DEPTH, MIN_QUERIES, QUERY_SIZE,
};

static NEXT_CONTEXT_ID: AtomicU8 = AtomicU8::new(0);

/// Process-wide identifier of a [`QueueContext`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContextId(u8);

impl ContextId {
    /// Takes the next id. Ids are never given back.
    fn allocate() -> Result<Self, CreateContextError> {
        Self::allocate_from(&NEXT_CONTEXT_ID)
    }

    fn allocate_from(counter: &AtomicU8) -> Result<Self, CreateContextError> {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map(ContextId)
            .map_err(|_| CreateContextError::TooManyContexts)
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// Timestamp query state of one GPU queue.
///
/// The context owns a query set and a host-readable buffer of the same number
/// of slots, used as a ring. [`ZoneScope`]s take slots from the ring and
/// [`collect`](QueueContext::collect) hands the resolved values to the
/// profiler, freeing the slots again.
///
/// Slots are only freed by `collect`, so it has to run often enough for the
/// ring not to fill up, and late enough that the GPU finished resolving the
/// queries it harvests (typically after waiting on the queue at a frame
/// boundary). A full ring makes zones fail with
/// [`QueryError::CapacityExceeded`](crate::QueryError::CapacityExceeded).
///
/// All command encoders passed to the zones of a context must belong to the
/// device the context was created with.
pub struct QueueContext<A: Api> {
    id: ContextId,
    label: String,
    queue_kind: QueueKind,
    calibration: CalibrationRecord,
    capacity: u32,
    callstack_depth: u8,
    pub(crate) ring: Mutex<QueryRing>,
    pub(crate) profiler: Arc<dyn Profiler>,
    query_set: ManuallyDrop<A::QuerySet>,
    readback: ManuallyDrop<A::Buffer>,
    device: Arc<A::Device>,
}

impl<A: Api> fmt::Debug for QueueContext<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueContext")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("queue_kind", &self.queue_kind)
            .field("capacity", &self.capacity)
            .field("ring", &self.ring)
            .finish()
    }
}

impl<A: Api> QueueContext<A> {
    /// Creates the timestamp query state for `queue` and announces the new
    /// context to the profiler.
    pub fn new(
        device: Arc<A::Device>,
        queue: &A::Queue,
        profiler: Arc<dyn Profiler>,
        desc: &ContextDescriptor,
    ) -> Result<Self, CreateContextError> {
        let queue_kind = unsafe { queue.kind() };
        let capabilities = unsafe { device.timestamp_capabilities() };
        if !capabilities.contains(queue_kind.required_capability()) {
            return Err(CreateContextError::DeviceUnsupported(queue_kind));
        }

        let id = ContextId::allocate()?;
        let calibration = unsafe { CalibrationRecord::sample::<A>(queue, &*profiler) }?;
        let (query_set, capacity) = unsafe { create_query_set::<A>(&device, queue_kind, desc) }?;

        let readback_desc = BufferDescriptor {
            label: desc.label,
            size: BufferAddress::from(capacity) * QUERY_SIZE,
            usage: BufferUses::MAP_READ | BufferUses::COPY_DST,
        };
        let readback = match unsafe { device.create_buffer(&readback_desc) } {
            Ok(buffer) => buffer,
            Err(err) => {
                unsafe { device.destroy_query_set(query_set) };
                return Err(err.into());
            }
        };

        profiler.emit(Event::NewContext {
            host_time: calibration.host_time,
            device_time: calibration.device_time,
            thread: 0,
            period: calibration.period,
            context: id.raw(),
            accuracy_bits: 0,
            queue_kind,
        });
        log::debug!(
            "Created GPU context {} {:?} on a {:?} queue with {} query slots",
            id.raw(),
            desc.label.unwrap_or(""),
            queue_kind,
            capacity,
        );

        Ok(Self {
            id,
            label: desc.label.unwrap_or_default().to_string(),
            queue_kind,
            calibration,
            capacity,
            callstack_depth: desc.callstack_depth.min(MAX_CALLSTACK_DEPTH as u8),
            ring: Mutex::new(QueryRing::new(capacity)),
            profiler,
            query_set: ManuallyDrop::new(query_set),
            readback: ManuallyDrop::new(readback),
            device,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    pub fn calibration(&self) -> &CalibrationRecord {
        &self.calibration
    }

    /// Number of query slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn callstack_depth(&self) -> u8 {
        self.callstack_depth
    }

    /// Number of queries issued since the last collection.
    pub fn pending(&self) -> u32 {
        self.ring.lock().pending()
    }

    /// Slot of the oldest query that wasn't collected yet.
    pub fn harvested_cursor(&self) -> u32 {
        self.ring.lock().harvested_cursor()
    }

    /// Opens a profiling zone on `encoder`. See [`ZoneScope::new`].
    pub fn zone<'a>(
        &'a self,
        encoder: &'a mut A::CommandEncoder,
        location: &'static SourceLocation,
        active: bool,
    ) -> Result<ZoneScope<'a, A>, crate::QueryError> {
        ZoneScope::new(self, encoder, location, active)
    }

    /// Reports the values of all queries issued since the last collection.
    ///
    /// Emits one [`Event::GpuTime`] per query, in increasing query id order, and
    /// returns how many were emitted. If the profiler isn't connected the
    /// queries are dropped instead.
    ///
    /// The readback buffer is read as is: queries whose resolve didn't complete
    /// on the GPU yet are reported with stale values.
    pub fn collect(&self) -> Result<u32, DeviceError> {
        profiling::scope!("QueueContext::collect");

        let mut ring = self.ring.lock();
        let pending = ring.pending();
        if pending == 0 {
            return Ok(0);
        }

        if !self.profiler.is_connected() {
            log::debug!(
                "GPU context {}: no collector, dropping {} queries",
                self.id.raw(),
                pending
            );
            ring.discard();
            return Ok(0);
        }

        let size = BufferAddress::from(self.capacity) * QUERY_SIZE;
        let mapping = unsafe { self.device.map_buffer(&self.readback, 0..size) }?;
        let bytes = unsafe { slice::from_raw_parts(mapping.as_ptr(), size as usize) };
        for query_id in ring.pending_ids() {
            let offset = query_id.slot(self.capacity) as usize * QUERY_SIZE as usize;
            let raw: u64 = bytemuck::pod_read_unaligned(&bytes[offset..offset + 8]);
            self.profiler.emit(Event::GpuTime {
                device_time: raw as i64,
                query_id,
                context: self.id.raw(),
            });
        }
        unsafe { self.device.unmap_buffer(&self.readback) };

        ring.harvest();
        log::trace!(
            "GPU context {}: collected {} queries",
            self.id.raw(),
            pending
        );
        Ok(pending)
    }

    pub(crate) unsafe fn write_timestamp(&self, encoder: &mut A::CommandEncoder, id: QueryId) {
        unsafe { encoder.write_timestamp(&self.query_set, id.slot(self.capacity)) };
    }

    /// Copies the values of the `begin` and `end` queries of a zone to the
    /// readback buffer.
    pub(crate) unsafe fn resolve_zone(
        &self,
        encoder: &mut A::CommandEncoder,
        begin: QueryId,
        end: QueryId,
    ) {
        let first = begin.slot(self.capacity);
        let last = end.slot(self.capacity);
        if end.0 == begin.0 + 1 && last == first + 1 {
            unsafe { self.resolve_slots(encoder, first..last + 1) };
        } else {
            unsafe {
                self.resolve_slots(encoder, first..first + 1);
                self.resolve_slots(encoder, last..last + 1);
            }
        }
    }

    pub(crate) unsafe fn resolve_query(&self, encoder: &mut A::CommandEncoder, id: QueryId) {
        let slot = id.slot(self.capacity);
        unsafe { self.resolve_slots(encoder, slot..slot + 1) };
    }

    unsafe fn resolve_slots(&self, encoder: &mut A::CommandEncoder, slots: Range<u32>) {
        let offset = BufferAddress::from(slots.start) * QUERY_SIZE;
        unsafe { encoder.resolve_queries(&self.query_set, slots, &self.readback, offset) };
    }
}

impl<A: Api> Drop for QueueContext<A> {
    fn drop(&mut self) {
        let pending = self.ring.get_mut().pending();
        if pending != 0 {
            log::debug!(
                "GPU context {} destroyed with {} uncollected queries",
                self.id.raw(),
                pending
            );
        }
        unsafe {
            self.device
                .destroy_buffer(ManuallyDrop::take(&mut self.readback));
            self.device
                .destroy_query_set(ManuallyDrop::take(&mut self.query_set));
        }
    }
}

/// Creates the largest query set the device allows, up to the requested size.
///
/// Each failure halves the count, rounding up, until it drops below
/// [`MIN_QUERIES`].
unsafe fn create_query_set<A: Api>(
    device: &A::Device,
    queue_kind: QueueKind,
    desc: &ContextDescriptor,
) -> Result<(A::QuerySet, u32), CreateContextError> {
    let mut count = desc.query_capacity;
    while count >= MIN_QUERIES {
        let set_desc = QuerySetDescriptor {
            label: desc.label,
            ty: queue_kind.query_type(),
            count,
        };
        match unsafe { device.create_query_set(&set_desc) } {
            Ok(set) => {
                if count != desc.query_capacity {
                    log::warn!(
                        "Requested {} timestamp queries, the device only allowed {}",
                        desc.query_capacity,
                        count
                    );
                }
                return Ok((set, count));
            }
            Err(err) => {
                log::debug!("Failed to create a set of {} queries: {}", count, err);
                count = count / 2 + count % 2;
            }
        }
    }
    Err(CreateContextError::QuerySetCreation {
        requested: desc.query_capacity,
    })
}

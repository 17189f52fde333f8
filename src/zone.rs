use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use crate::{Api, Event, QueryError, QueryId, QueueContext, SourceLocation};

/// A profiled span of GPU work on one command encoder.
///
/// Opening the zone writes a begin timestamp into `encoder` and reports the
/// begin to the profiler; dropping it writes the end timestamp, reports the end
/// and resolves both queries into the readback buffer of the context.
///
/// The zone holds the encoder for its whole lifetime and dereferences to it, so
/// work is recorded into the zone itself. Nested zones borrow the encoder from
/// their parent, which makes them close in reverse order of opening.
///
/// ```ignore
/// let mut pass = context.zone(&mut encoder, source_location!("shadows"), true)?;
/// record_shadow_pass(&mut *pass);
/// {
///     let mut cascade = context.zone(&mut *pass, source_location!("cascade 0"), true)?;
///     record_cascade(&mut *cascade, 0);
/// }
/// drop(pass);
/// ```
pub struct ZoneScope<'a, A: Api> {
    context: &'a QueueContext<A>,
    encoder: &'a mut A::CommandEncoder,
    begin: Option<QueryId>,
}

impl<'a, A: Api> ZoneScope<'a, A> {
    /// Opens a zone described by `location`.
    ///
    /// The zone records nothing for its whole lifetime if `active` is false or
    /// the profiler isn't connected at this point.
    ///
    /// Fails if all query slots of the context are waiting to be collected.
    pub fn new(
        context: &'a QueueContext<A>,
        encoder: &'a mut A::CommandEncoder,
        location: &'static SourceLocation,
        active: bool,
    ) -> Result<Self, QueryError> {
        let profiler = &*context.profiler;
        if !active || !profiler.is_connected() {
            return Ok(Self {
                context,
                encoder,
                begin: None,
            });
        }

        let begin = context.ring.lock().allocate()?;
        unsafe { context.write_timestamp(encoder, begin) };

        let host_time = profiler.now();
        let thread = profiler.thread_id();
        let context_id = context.id().raw();
        let depth = context.callstack_depth();
        if depth == 0 {
            profiler.emit(Event::ZoneBegin {
                host_time,
                thread,
                query_id: begin,
                context: context_id,
                source_location: location.token(),
            });
        } else {
            profiler.emit(Event::ZoneBeginCallstack {
                host_time,
                thread,
                query_id: begin,
                context: context_id,
                source_location: location.token(),
            });
            let frames = profiler.capture_callstack(depth);
            profiler.emit(Event::Callstack { thread, frames });
        }

        Ok(Self {
            context,
            encoder,
            begin: Some(begin),
        })
    }

    /// Whether the zone records timestamps.
    pub fn is_active(&self) -> bool {
        self.begin.is_some()
    }

    /// Query written when the zone opened.
    pub fn begin_query(&self) -> Option<QueryId> {
        self.begin
    }

    /// Closes the zone. Same as dropping it.
    pub fn end(self) {}

    fn close(&mut self) {
        let begin = match self.begin.take() {
            Some(begin) => begin,
            None => return,
        };
        let context = self.context;
        let end = context.ring.lock().allocate();
        match end {
            Ok(end) => {
                unsafe { context.write_timestamp(self.encoder, end) };

                let profiler = &*context.profiler;
                profiler.emit(Event::ZoneEnd {
                    host_time: profiler.now(),
                    thread: profiler.thread_id(),
                    query_id: end,
                    context: context.id().raw(),
                });

                unsafe { context.resolve_zone(self.encoder, begin, end) };
            }
            Err(err) => {
                log::error!(
                    "GPU context {}: zone opened with query {} can't be closed: {}",
                    context.id().raw(),
                    begin.0,
                    err
                );
                unsafe { context.resolve_query(self.encoder, begin) };
            }
        }
    }
}

impl<A: Api> Deref for ZoneScope<'_, A> {
    type Target = A::CommandEncoder;

    fn deref(&self) -> &Self::Target {
        self.encoder
    }
}

impl<A: Api> DerefMut for ZoneScope<'_, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.encoder
    }
}

impl<A: Api> fmt::Debug for ZoneScope<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneScope")
            .field("context", &self.context.id())
            .field("begin", &self.begin)
            .finish()
    }
}

impl<A: Api> Drop for ZoneScope<'_, A> {
    fn drop(&mut self) {
        self.close();
    }
}

use std::ops::Range;

use crate::QueryError;

/// Identifier of a timestamp query.
///
/// Ids are handed out in increasing order and never wrap in practice; only the
/// ring slot an id lives in is reused, see [`QueryId::slot`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "trace", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryId(pub u64);

impl QueryId {
    /// Index of the query slot this id occupies in a ring of `capacity` slots.
    pub fn slot(self, capacity: u32) -> u32 {
        (self.0 % u64::from(capacity)) as u32
    }

    /// The id as it is carried by serialized events.
    pub fn truncate(self) -> u16 {
        self.0 as u16
    }
}

/// Circular allocator of query slots.
///
/// Slots are issued in order starting at the harvested cursor. Issued slots stay
/// pending until they are harvested, and a pending slot is never issued again:
/// once all of them are pending, [`allocate`] fails until the next harvest.
///
/// [`allocate`]: QueryRing::allocate
#[derive(Debug)]
pub struct QueryRing {
    capacity: u32,
    harvested: u64,
    pending: u32,
}

impl QueryRing {
    pub fn new(capacity: u32) -> Self {
        assert_ne!(capacity, 0, "Query ring must have at least one slot");
        Self {
            capacity,
            harvested: 0,
            pending: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots issued since the last harvest.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Slot of the oldest query that wasn't harvested yet.
    pub fn harvested_cursor(&self) -> u32 {
        self.next_harvest().slot(self.capacity)
    }

    /// Id of the oldest query that wasn't harvested yet.
    pub fn next_harvest(&self) -> QueryId {
        QueryId(self.harvested)
    }

    /// Ids of all pending queries, oldest first.
    pub fn pending_ids(&self) -> impl Iterator<Item = QueryId> {
        let Range { start, end } = self.pending_range();
        (start..end).map(QueryId)
    }

    fn pending_range(&self) -> Range<u64> {
        self.harvested..self.harvested + u64::from(self.pending)
    }

    pub fn allocate(&mut self) -> Result<QueryId, QueryError> {
        if self.pending == self.capacity {
            return Err(QueryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let id = QueryId(self.harvested + u64::from(self.pending));
        self.pending += 1;
        Ok(id)
    }

    /// Marks every pending query as harvested.
    pub fn harvest(&mut self) {
        self.harvested += u64::from(self.pending);
        self.pending = 0;
    }

    /// Forgets every pending query without harvesting it.
    ///
    /// The cursor stays where it is, so the discarded ids are issued again.
    pub fn discard(&mut self) {
        self.pending = 0;
    }
}

//! Fixed-capacity store of outstanding requests.
//!
//! Every entry owns its callbacks. Entries leave the table only by value
//! ([`RequestTable::take_by_id`], [`RequestTable::scan_expired`],
//! [`RequestTable::cancel`]), so a callback can be invoked at most once.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use super::attributes::AttributeKeys;
use crate::error::RequestError;

/// Correlation id carried in a request and echoed by its reply.
pub type RequestId = u32;

/// What an outstanding request is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// One RPC call, answered by one result.
    SingleRpc,
    /// One attribute query, answered by one key/value batch.
    AttributeBatch(AttributeKeys),
}

/// An outstanding request.
pub struct PendingRequest<S, T> {
    id: RequestId,
    kind: RequestKind,
    on_reply: S,
    on_timeout: Option<T>,
    deadline: Instant,
}

impl<S, T> PendingRequest<S, T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn has_timeout_callback(&self) -> bool {
        self.on_timeout.is_some()
    }

    /// Splits the entry, handing out ownership of both callbacks.
    pub fn into_parts(self) -> (RequestKind, S, Option<T>) {
        (self.kind, self.on_reply, self.on_timeout)
    }

    /// Consumes the entry and runs its timeout callback, if it has one.
    ///
    /// Returns whether a callback ran.
    pub fn fire_timeout(self) -> bool
    where
        T: FnOnce(),
    {
        match self.on_timeout {
            Some(on_timeout) => {
                on_timeout();
                true
            }
            None => false,
        }
    }
}

/// Outstanding requests, at most `N` at a time, kept in insertion order.
pub struct RequestTable<S, T, const N: usize> {
    entries: Vec<PendingRequest<S, T>, N>,
    next_id: RequestId,
}

impl<S, T, const N: usize> RequestTable<S, T, N> {
    pub fn new() -> Self {
        const { assert!(N > 0, "request table capacity must be non-zero") };
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Stores a request expiring `timeout` after `now`.
    ///
    /// A full table is left untouched and the callbacks are dropped unrun.
    pub fn insert(
        &mut self,
        kind: RequestKind,
        on_reply: S,
        on_timeout: Option<T>,
        now: Instant,
        timeout: Duration,
    ) -> Result<RequestId, RequestError> {
        if self.entries.is_full() {
            return Err(RequestError::CapacityExceeded);
        }
        let id = self.allocate_id();
        let entry = PendingRequest {
            id,
            kind,
            on_reply,
            on_timeout,
            deadline: now.checked_add(timeout).unwrap_or(Instant::MAX),
        };
        self.entries
            .push(entry)
            .map_err(|_| RequestError::CapacityExceeded)?;
        Ok(id)
    }

    /// Removes and returns the entry for `id`.
    ///
    /// `None` for ids that were never issued, already answered or expired.
    pub fn take_by_id(&mut self, id: RequestId) -> Option<PendingRequest<S, T>> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes every entry whose deadline is at or before `now`.
    pub fn scan_expired(&mut self, now: Instant) -> Vec<PendingRequest<S, T>, N> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deadline <= now {
                // Both vectors share the capacity `N`, so this cannot overflow.
                let _ = expired.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Drops the entry for `id` without running any callback.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        self.take_by_id(id).is_some()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// The earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            // Wrapping can only collide with a live id, and there are fewer
            // than `N` of those.
            if !self.contains(id) {
                return id;
            }
        }
    }
}

impl<S, T, const N: usize> Default for RequestTable<S, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    type Table<'a, const N: usize> = RequestTable<&'a dyn Fn(), &'a dyn Fn(), N>;

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn fills_to_capacity_then_refuses() {
        let noop = || {};
        let mut table: Table<'_, 5> = RequestTable::new();
        let mut ids = std::vec::Vec::new();
        for _ in 0..5 {
            ids.push(
                table
                    .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(10))
                    .unwrap(),
            );
        }
        let unique: std::collections::BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 5);

        let err = table.insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(10));
        assert_eq!(err.err(), Some(RequestError::CapacityExceeded));
        assert_eq!(table.len(), 5);
        for id in ids {
            assert!(table.contains(id));
        }
    }

    #[test]
    fn take_by_id_is_single_use() {
        let noop = || {};
        let mut table: Table<'_, 2> = RequestTable::new();
        let id = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .unwrap();
        let entry = table.take_by_id(id).unwrap();
        assert_eq!(entry.id(), id);
        assert!(table.take_by_id(id).is_none());
        assert!(table.take_by_id(id + 100).is_none());
    }

    #[test]
    fn expiry_returns_each_entry_once() {
        let noop = || {};
        let mut table: Table<'_, 4> = RequestTable::new();
        let early = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(10))
            .unwrap();
        let late = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(30))
            .unwrap();

        assert!(table.scan_expired(at(9)).is_empty());

        let expired = table.scan_expired(at(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), early);
        assert!(table.scan_expired(at(11)).is_empty());
        assert!(table.contains(late));
        assert_eq!(table.next_deadline(), Some(at(30)));
    }

    #[test]
    fn expiry_keeps_insertion_order() {
        let noop = || {};
        let mut table: Table<'_, 4> = RequestTable::new();
        let a = table
            .insert(RequestKind::SingleRpc, &noop, None, at(5), Duration::from_secs(1))
            .unwrap();
        let b = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .unwrap();
        let order: std::vec::Vec<_> = table.scan_expired(at(100)).iter().map(|e| e.id()).collect();
        assert_eq!(order, [a, b]);
    }

    #[test]
    fn timeout_callback_fires_once() {
        let hits = Cell::new(0);
        let on_timeout = || hits.set(hits.get() + 1);
        let noop = || {};
        let mut table: Table<'_, 1> = RequestTable::new();
        table
            .insert(RequestKind::SingleRpc, &noop, Some(&on_timeout), at(0), Duration::from_secs(10))
            .unwrap();

        for entry in table.scan_expired(at(11)) {
            assert!(entry.fire_timeout());
        }
        for entry in table.scan_expired(at(20)) {
            entry.fire_timeout();
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn cancel_fires_nothing_and_frees_slot() {
        let hits = Cell::new(0);
        let on_timeout = || hits.set(hits.get() + 1);
        let noop = || {};
        let mut table: Table<'_, 1> = RequestTable::new();
        let id = table
            .insert(RequestKind::SingleRpc, &noop, Some(&on_timeout), at(0), Duration::from_secs(1))
            .unwrap();
        assert!(table.cancel(id));
        assert!(!table.cancel(id));
        assert!(table.scan_expired(at(5)).is_empty());
        assert_eq!(hits.get(), 0);
        assert!(table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .is_ok());
    }

    #[test]
    fn ids_skip_live_entries_after_wrap() {
        let noop = || {};
        let mut table: Table<'_, 2> = RequestTable::new();
        table.next_id = RequestId::MAX;
        let last = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .unwrap();
        assert_eq!(last, RequestId::MAX);
        let wrapped = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .unwrap();
        assert_eq!(wrapped, 1);

        table.cancel(last);
        table.next_id = 1;
        let next = table
            .insert(RequestKind::SingleRpc, &noop, None, at(0), Duration::from_secs(1))
            .unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn huge_timeout_saturates() {
        let noop = || {};
        let mut table: Table<'_, 1> = RequestTable::new();
        table
            .insert(RequestKind::SingleRpc, &noop, None, at(10), Duration::MAX)
            .unwrap();
        assert_eq!(table.next_deadline(), Some(Instant::MAX));
    }
}

use crate::error::{Error, Result};
use kafka_protocol::messages::ApiKey;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// The correlation ID reserved for handshake requests (§4.4), so that post-handshake IDs start
/// cleanly at 0. `2^31 - 1`.
pub const RESERVED_HANDSHAKE_CORR_ID: i32 = (1 << 31) - 1;

/// Identity of whatever requested a response: a caller-supplied opaque reference plus the
/// `api`/`version` needed to decode the eventual response body.
#[derive(Debug)]
pub struct Waiter {
    pub reference: crate::types::RequestRef,
    pub api: ApiKey,
    pub version: i16,
    pub sent_at: Instant,
    /// The channel the connection actor delivers the response (or a fatal connection error)
    /// through. `None` once the caller has detached (e.g. its own timeout elapsed) — the entry
    /// is kept until a response arrives or the liveness tick evicts the whole connection, per §5.
    pub deliver: Option<tokio::sync::oneshot::Sender<Result<crate::types::Response>>>,
}

/// Ordered correlation-ID → [`Waiter`] table (C2). Insertion order is preserved so that the
/// oldest entry's age is O(1) to compute.
#[derive(Debug, Default)]
pub struct PendingTable {
    next_corr_id: i32,
    order: VecDeque<i32>,
    entries: HashMap<i32, Waiter>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            next_corr_id: 0,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Allocate the next correlation ID without registering a waiter. Used for `no_ack`
    /// requests: the ID is consumed on the wire but nothing awaits a response.
    pub fn increment(&mut self) -> Result<i32> {
        self.allocate()
    }

    /// Allocate the next correlation ID and register `waiter` against it.
    pub fn add(&mut self, waiter: Waiter) -> Result<i32> {
        let corr_id = self.allocate()?;
        self.order.push_back(corr_id);
        self.entries.insert(corr_id, waiter);
        Ok(corr_id)
    }

    fn allocate(&mut self) -> Result<i32> {
        let corr_id = self.next_corr_id;
        self.next_corr_id = match corr_id + 1 {
            RESERVED_HANDSHAKE_CORR_ID => 0,
            next => next,
        };
        if self.entries.contains_key(&corr_id) {
            return Err(Error::CorrelationIdCollision(corr_id));
        }
        Ok(corr_id)
    }

    pub fn get(&self, corr_id: i32) -> Option<&Waiter> {
        self.entries.get(&corr_id)
    }

    pub fn delete(&mut self, corr_id: i32) -> Option<Waiter> {
        let waiter = self.entries.remove(&corr_id);
        if waiter.is_some() {
            // Lazily compact `order`: drop IDs from the front that no longer have an entry.
            // Amortized O(1) since each ID is pushed once and popped at most once.
            while let Some(&front) = self.order.front() {
                if self.entries.contains_key(&front) {
                    break;
                }
                self.order.pop_front();
            }
        }
        waiter
    }

    /// Age of the oldest still-live entry, or `Duration::ZERO` if the table is empty.
    pub fn oldest_age(&self) -> std::time::Duration {
        self.order
            .front()
            .and_then(|id| self.entries.get(id))
            .map(|w| w.sent_at.elapsed())
            .unwrap_or_default()
    }

    /// The most recently allocated correlation ID, for debug output (§4.2).
    pub fn current_corr_id(&self) -> i32 {
        if self.next_corr_id == 0 {
            RESERVED_HANDSHAKE_CORR_ID - 1
        } else {
            self.next_corr_id - 1
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain all entries, for delivering `transport_down` to every outstanding waiter when the
    /// connection dies.
    pub fn drain(&mut self) -> Vec<Waiter> {
        self.order.clear();
        self.entries.drain().map(|(_, w)| w).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn waiter(reference: u64) -> Waiter {
        Waiter {
            reference,
            api: ApiKey::Metadata,
            version: 9,
            sent_at: Instant::now(),
            deliver: None,
        }
    }

    #[test]
    fn ids_allocate_in_order_and_skip_reserved() {
        let mut table = PendingTable::new();
        assert_eq!(table.add(waiter(1)).unwrap(), 0);
        assert_eq!(table.add(waiter(2)).unwrap(), 1);
        assert_eq!(table.current_corr_id(), 1);
    }

    #[test]
    fn no_ack_consumes_an_id_without_a_waiter() {
        let mut table = PendingTable::new();
        let id = table.increment().unwrap();
        assert_eq!(id, 0);
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn oldest_age_tracks_surviving_earliest_entry() {
        let mut table = PendingTable::new();
        let a = table.add(waiter(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let _b = table.add(waiter(2)).unwrap();

        let age_before = table.oldest_age();
        assert!(age_before >= Duration::from_millis(5));

        table.delete(a);
        // The remaining entry is younger, so oldest_age drops back down.
        assert!(table.oldest_age() < age_before);
    }

    #[test]
    fn empty_table_has_zero_age() {
        let table = PendingTable::new();
        assert_eq!(table.oldest_age(), Duration::ZERO);
    }

    #[test]
    fn delete_compacts_order_queue() {
        let mut table = PendingTable::new();
        let a = table.add(waiter(1)).unwrap();
        let b = table.add(waiter(2)).unwrap();
        table.delete(a);
        assert_eq!(table.order.front(), Some(&b));
    }

    #[test]
    fn wrap_around_skips_reserved_id_and_detects_collision() {
        let mut table = PendingTable::new();
        table.next_corr_id = RESERVED_HANDSHAKE_CORR_ID - 1;
        let id = table.add(waiter(1)).unwrap();
        assert_eq!(id, RESERVED_HANDSHAKE_CORR_ID - 1);
        assert_eq!(table.next_corr_id, 0);

        let wrapped = table.add(waiter(2)).unwrap();
        assert_eq!(wrapped, 0);

        // Forcing a collision: entry at id 0 is still live.
        table.next_corr_id = 0;
        let err = table.add(waiter(3)).unwrap_err();
        assert!(matches!(err, Error::CorrelationIdCollision(0)));
    }
}

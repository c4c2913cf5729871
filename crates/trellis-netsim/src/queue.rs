//! Arena-indexed per-path packet queues.
//!
//! Every in-flight packet belongs to exactly one path and sits in that
//! path's FIFO. The records live in one slab arena ([`PacketStore`]) and
//! link to their neighbors by slot key instead of by pointer, which keeps
//! insert/remove O(1) while making the linkage impossible to dangle.
//!
//! [`PacketStore::verify`] is a structural diagnostic used by the test
//! suite: any mismatch it reports is a logic bug, never a recoverable
//! condition.

use slab::Slab;
use thiserror::Error;

/// Stable handle to a packet record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(usize);

/// One in-flight packet.
#[derive(Debug)]
pub struct PacketRecord {
    /// Monotonic per-path transmission number.
    pub path_packet_number: u64,
    /// Bytes this packet put on the wire.
    pub wire_len: usize,
    prev: Option<PacketId>,
    next: Option<PacketId>,
}

/// Head/tail of one path's in-flight FIFO.
#[derive(Debug, Default)]
pub struct PathQueue {
    head: Option<PacketId>,
    tail: Option<PacketId>,
    len: usize,
}

impl PathQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Structural corruption detected by [`PacketStore::verify`]. Fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueCorruption {
    #[error("element {position} in walk is not the expected packet")]
    IdentityMismatch { position: usize },
    #[error("element {position} has a stale back-link")]
    BackLinkMismatch { position: usize },
    #[error("walk found {found} elements, expected {expected}")]
    LengthMismatch { found: usize, expected: usize },
    #[error("recorded tail does not match the last walked element")]
    TailMismatch,
}

/// Shared arena for all paths' packet records.
#[derive(Debug, Default)]
pub struct PacketStore {
    slab: Slab<PacketRecord>,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet at the tail of `queue`. O(1).
    pub fn insert(
        &mut self,
        queue: &mut PathQueue,
        path_packet_number: u64,
        wire_len: usize,
    ) -> PacketId {
        let id = PacketId(self.slab.insert(PacketRecord {
            path_packet_number,
            wire_len,
            prev: queue.tail,
            next: None,
        }));
        match queue.tail {
            Some(tail) => self.slab[tail.0].next = Some(id),
            None => queue.head = Some(id),
        }
        queue.tail = Some(id);
        queue.len += 1;
        id
    }

    /// Remove an arbitrary element, patching its neighbors. The removed
    /// record comes back with its links cleared. O(1).
    pub fn remove(&mut self, queue: &mut PathQueue, id: PacketId) -> PacketRecord {
        let mut record = self.slab.remove(id.0);
        match record.prev {
            Some(prev) => self.slab[prev.0].next = record.next,
            None => queue.head = record.next,
        }
        match record.next {
            Some(next) => self.slab[next.0].prev = record.prev,
            None => queue.tail = record.prev,
        }
        record.prev = None;
        record.next = None;
        queue.len -= 1;
        record
    }

    /// Remove every element of `queue`, e.g. when its path is abandoned.
    pub fn drain(&mut self, queue: &mut PathQueue) {
        let mut cursor = queue.head;
        while let Some(id) = cursor {
            let record = self.slab.remove(id.0);
            cursor = record.next;
        }
        queue.head = None;
        queue.tail = None;
        queue.len = 0;
    }

    /// Oldest in-flight record of a path.
    pub fn front<'a>(&'a self, queue: &PathQueue) -> Option<(PacketId, &'a PacketRecord)> {
        queue.head.map(|id| (id, &self.slab[id.0]))
    }

    /// Walk `queue` head-to-tail and check it contains exactly `expected`,
    /// in order, with consistent back-links and a matching tail pointer.
    ///
    /// Diagnostic for tests: a failure here signals a structural bug.
    pub fn verify(&self, queue: &PathQueue, expected: &[PacketId]) -> Result<(), QueueCorruption> {
        let mut cursor = queue.head;
        let mut previous: Option<PacketId> = None;
        let mut position = 0;

        while let Some(id) = cursor {
            if position >= expected.len() {
                return Err(QueueCorruption::LengthMismatch {
                    found: position + 1,
                    expected: expected.len(),
                });
            }
            if id != expected[position] {
                return Err(QueueCorruption::IdentityMismatch { position });
            }
            let record = &self.slab[id.0];
            if record.prev != previous {
                return Err(QueueCorruption::BackLinkMismatch { position });
            }
            previous = Some(id);
            cursor = record.next;
            position += 1;
        }

        if position != expected.len() {
            return Err(QueueCorruption::LengthMismatch {
                found: position,
                expected: expected.len(),
            });
        }
        if queue.tail != previous {
            return Err(QueueCorruption::TailMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_remove_every_other_then_drain() {
        let mut store = PacketStore::new();
        let mut queue = PathQueue::new();

        let ids: Vec<PacketId> = (0..5).map(|n| store.insert(&mut queue, n, 100)).collect();
        store.verify(&queue, &ids).unwrap();

        // Remove indices 4, 2, 0 — every other element, from the end.
        let mut expected = ids.clone();
        for idx in [4usize, 2, 0] {
            store.remove(&mut queue, ids[idx]);
            expected.remove(idx);
            store.verify(&queue, &expected).unwrap();
        }
        assert_eq!(expected, vec![ids[1], ids[3]]);
        assert_eq!(queue.len(), 2);

        store.drain(&mut queue);
        store.verify(&queue, &[]).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn incremental_inserts_verify_at_each_step() {
        let mut store = PacketStore::new();
        let mut queue = PathQueue::new();
        let mut expected = Vec::new();
        for n in 0..5 {
            expected.push(store.insert(&mut queue, n, 64));
            store.verify(&queue, &expected).unwrap();
        }
    }

    #[test]
    fn verify_rejects_wrong_order() {
        let mut store = PacketStore::new();
        let mut queue = PathQueue::new();
        let a = store.insert(&mut queue, 0, 10);
        let b = store.insert(&mut queue, 1, 10);
        assert_eq!(
            store.verify(&queue, &[b, a]),
            Err(QueueCorruption::IdentityMismatch { position: 0 })
        );
        assert_eq!(
            store.verify(&queue, &[a]),
            Err(QueueCorruption::LengthMismatch {
                found: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn two_paths_share_one_arena() {
        let mut store = PacketStore::new();
        let mut q0 = PathQueue::new();
        let mut q1 = PathQueue::new();
        let a = store.insert(&mut q0, 0, 10);
        let b = store.insert(&mut q1, 0, 10);
        let c = store.insert(&mut q0, 1, 10);
        store.verify(&q0, &[a, c]).unwrap();
        store.verify(&q1, &[b]).unwrap();
        store.drain(&mut q0);
        store.verify(&q1, &[b]).unwrap();
    }

    proptest! {
        /// For any interleaving of inserts and removals, the surviving
        /// subsequence keeps its original relative order and the walk stays
        /// structurally sound.
        #[test]
        fn order_invariant_holds(ops in proptest::collection::vec(0u8..4, 1..200)) {
            let mut store = PacketStore::new();
            let mut queue = PathQueue::new();
            let mut expected: Vec<PacketId> = Vec::new();
            let mut next_number = 0u64;

            for op in ops {
                match op {
                    // Insert twice as often as each removal flavor.
                    0 | 1 => {
                        expected.push(store.insert(&mut queue, next_number, 32));
                        next_number += 1;
                    }
                    2 if !expected.is_empty() => {
                        // Remove from the middle.
                        let idx = expected.len() / 2;
                        store.remove(&mut queue, expected.remove(idx));
                    }
                    3 if !expected.is_empty() => {
                        // Remove the head.
                        store.remove(&mut queue, expected.remove(0));
                    }
                    _ => {}
                }
                prop_assert_eq!(store.verify(&queue, &expected), Ok(()));
                prop_assert_eq!(queue.len(), expected.len());
            }
        }
    }
}

//! The per-client playout queue: an arena of nodes indexed by small
//! integers rather than raw pointers (see the design notes on the
//! source's custom new/delete queue). Insertion-ordered by extended
//! sequence number; the network thread inserts and reclaims, the audio
//! thread marks nodes `used` and reads their payload.

use parking_lot::Mutex;

/// One received block of interleaved samples plus its playout bookkeeping.
pub struct QueuedPacket {
    pub extended_seq: u64,
    pub playout_time: u32,
    pub channels: usize,
    pub samples: Vec<f32>,
    pub used: bool,
}

struct Slot {
    packet: QueuedPacket,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Inner {
    fn alloc(&mut self, packet: QueuedPacket) -> usize {
        let slot = Slot { packet, next: None };
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(slot);
            index
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn free_node(&mut self, index: usize) {
        self.slots[index] = None;
        self.free.push(index);
    }
}

/// Thread-safe arena-backed ordered queue.
pub struct PlayoutQueue {
    inner: Mutex<Inner>,
}

impl PlayoutQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
        }
    }

    /// Network-thread side: drop any nodes already marked `used` from the
    /// head, then insert `packet` in ascending `extended_seq` order. Exact
    /// duplicates (same `extended_seq` as an existing node) are dropped.
    pub fn insert(&self, packet: QueuedPacket) {
        let mut inner = self.inner.lock();
        reclaim_locked(&mut inner);

        // Find insertion point, bailing out on an exact duplicate.
        let mut prev: Option<usize> = None;
        let mut cursor = inner.head;
        while let Some(index) = cursor {
            let node_seq = inner.slots[index].as_ref().unwrap().packet.extended_seq;
            if node_seq == packet.extended_seq {
                return;
            }
            if node_seq > packet.extended_seq {
                break;
            }
            prev = Some(index);
            cursor = inner.slots[index].as_ref().unwrap().next;
        }

        let new_index = inner.alloc(packet);
        inner.slots[new_index].as_mut().unwrap().next = cursor;
        match prev {
            Some(prev_index) => inner.slots[prev_index].as_mut().unwrap().next = Some(new_index),
            None => inner.head = Some(new_index),
        }
        if cursor.is_none() {
            inner.tail = Some(new_index);
        }
    }

    /// Audio-thread side: consume exactly one block's worth of samples for
    /// `play_clock`. Walks forward over any stale nodes (`playout_time <=
    /// play_clock`), flags them `used`, and returns the payload of the
    /// *last* such node (the freshest one still due). Returns `None` when
    /// no node is playable yet (caller should emit silence).
    pub fn take_block(&self, play_clock: u32) -> Option<(u64, Vec<f32>)> {
        let mut inner = self.inner.lock();

        let mut cursor = inner.head;
        let mut selected: Option<usize> = None;
        while let Some(index) = cursor {
            let node = inner.slots[index].as_ref().unwrap();
            if !wrapping_le(node.packet.playout_time, play_clock) {
                break;
            }
            selected = Some(index);
            cursor = node.next;
        }

        let selected_index = selected?;
        // Flag every node up to and including the selected one as used; the
        // caller's next insert() reclaims them.
        let mut walk = inner.head;
        loop {
            let index = walk.expect("selected index must be reachable from head");
            let node = inner.slots[index].as_mut().unwrap();
            node.packet.used = true;
            if index == selected_index {
                break;
            }
            walk = node.next;
        }

        let node = inner.slots[selected_index].as_ref().unwrap();
        Some((node.packet.extended_seq, node.packet.samples.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().head.is_none()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        let mut cursor = inner.head;
        while let Some(index) = cursor {
            count += 1;
            cursor = inner.slots[index].as_ref().unwrap().next;
        }
        count
    }
}

impl Default for PlayoutQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn reclaim_locked(inner: &mut Inner) {
    while let Some(index) = inner.head {
        let used = inner.slots[index].as_ref().unwrap().packet.used;
        if !used {
            break;
        }
        let next = inner.slots[index].as_ref().unwrap().next;
        inner.free_node(index);
        inner.head = next;
        if inner.head.is_none() {
            inner.tail = None;
        }
    }
}

/// Wrap-safe `a <= b` for 32-bit wrapping sample-clock values.
pub fn wrapping_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Wrap-safe `a < b`.
pub fn wrapping_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u64, playout: u32) -> QueuedPacket {
        QueuedPacket {
            extended_seq: seq,
            playout_time: playout,
            channels: 1,
            samples: vec![seq as f32],
            used: false,
        }
    }

    #[test]
    fn insert_orders_by_extended_sequence() {
        let queue = PlayoutQueue::new();
        queue.insert(packet(2, 200));
        queue.insert(packet(0, 0));
        queue.insert(packet(1, 100));
        assert_eq!(queue.len(), 3);
        let (seq, samples) = queue.take_block(50).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(samples, vec![0.0]);
    }

    #[test]
    fn duplicate_extended_sequence_is_dropped() {
        let queue = PlayoutQueue::new();
        queue.insert(packet(5, 0));
        queue.insert(packet(5, 0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn take_block_skips_stale_nodes_and_returns_freshest() {
        let queue = PlayoutQueue::new();
        queue.insert(packet(0, 0));
        queue.insert(packet(1, 10));
        queue.insert(packet(2, 20));
        let (seq, _) = queue.take_block(15).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn used_nodes_are_reclaimed_on_next_insert() {
        let queue = PlayoutQueue::new();
        queue.insert(packet(0, 0));
        let _ = queue.take_block(0).unwrap();
        assert_eq!(queue.len(), 1); // still counted until reclaim runs
        queue.insert(packet(1, 10));
        assert_eq!(queue.len(), 1); // node 0 reclaimed, node 1 remains
    }

    #[test]
    fn no_playable_node_returns_none() {
        let queue = PlayoutQueue::new();
        queue.insert(packet(0, 1000));
        assert!(queue.take_block(0).is_none());
    }

    #[test]
    fn wrap_safety_around_u32_max() {
        assert!(wrapping_lt(0xFFFF_FFFE, 0xFFFF_FFFF));
        assert!(wrapping_lt(0xFFFF_FFFF, 0));
        assert!(!wrapping_lt(0, 0xFFFF_FFFF));
    }
}

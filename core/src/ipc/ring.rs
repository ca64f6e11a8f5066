//! Messaging ring: the shared-memory SPSC queue of spec §4.2
//!
//! Layout and cache discipline follow spec §4.2/§6 exactly: a packed
//! `{head, tail, enabled, slots[capacity]}` window per (sender, receiver)
//! pair, the writer owning `head` and the reader owning `tail`, with
//! explicit cache-invalidate-before-read and cache-flush-after-write
//! instead of hardware coherence. The atomics-and-raw-pointer style (with
//! `SAFETY` comments at each unsafe site) is grounded on the teacher's
//! `sync::lockfree_queue` MPSC queue.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::message::{Message, MESSAGE_WIRE_SIZE};
use crate::cacheops;
use crate::window::{round_up_to_page, SharedWindow};

/// Cache-line-aligned slot size; the message itself is 36 bytes, the rest
/// is padding (spec §6: "slot size is the message struct padded and
/// aligned to a cache line (64 bytes)").
pub const SLOT_SIZE: usize = 64;

/// `head` (8) + `tail` (8) + `enabled` (1) + padding, rounded up to one
/// cache line so the first slot starts on its own line.
pub const HEADER_SIZE: usize = 64;

const _: () = assert!(MESSAGE_WIRE_SIZE <= SLOT_SIZE);

/// Outcome of [`RingWindow::send`] (spec §4.2 contract: `Ok | Dropped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The ring holds `capacity - 1` messages already.
    Dropped,
}

/// A single-producer/single-consumer ring window between one ordered
/// (sender, receiver) pair, materialized at `base_offset` inside a
/// [`SharedWindow`].
pub struct RingWindow {
    window: Arc<dyn SharedWindow>,
    base_offset: u64,
    capacity: u32,
}

/// Size in bytes this ring window occupies in the shared window, including
/// the stride padding up to the next page (spec §6: "Ring stride:
/// ceil(sizeof(window) / 4096) * 4096").
pub fn ring_window_stride(capacity: u32) -> u64 {
    round_up_to_page((HEADER_SIZE + capacity as usize * SLOT_SIZE) as u64)
}

impl RingWindow {
    pub fn new(window: Arc<dyn SharedWindow>, base_offset: u64, capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be power of two");
        Self {
            window,
            base_offset,
            capacity,
        }
    }

    fn head_offset(&self) -> u64 {
        self.base_offset
    }

    fn tail_offset(&self) -> u64 {
        self.base_offset + 8
    }

    fn enabled_offset(&self) -> u64 {
        self.base_offset + 16
    }

    fn slot_offset(&self, counter: u64) -> u64 {
        let index = (counter as u32) & (self.capacity - 1);
        self.base_offset + HEADER_SIZE as u64 + index as u64 * SLOT_SIZE as u64
    }

    /// SAFETY: callers must not retain the reference past the lifetime of
    /// `self.window`, which they don't (everything here is `&self`-scoped).
    unsafe fn atomic_u64_at(&self, offset: u64) -> &AtomicU64 {
        let ptr = self.window.as_mut_ptr().add(offset as usize) as *const AtomicU64;
        &*ptr
    }

    unsafe fn atomic_u8_at(&self, offset: u64) -> &AtomicU8 {
        let ptr = self.window.as_mut_ptr().add(offset as usize) as *const AtomicU8;
        &*ptr
    }

    /// Zero the header and mark the ring enabled. Spec §4.2:
    /// "Initialization performs a full two-sided flush."
    pub fn init(&self) {
        // SAFETY: offsets are within the window (asserted by the caller
        // sizing the window to fit `ring_window_stride`), and the atomics
        // are naturally aligned because `base_offset` is page-aligned and
        // head/tail/enabled are laid out at fixed sub-offsets.
        unsafe {
            self.atomic_u64_at(self.head_offset()).store(0, Ordering::Relaxed);
            self.atomic_u64_at(self.tail_offset()).store(0, Ordering::Relaxed);
            self.atomic_u8_at(self.enabled_offset()).store(1, Ordering::Relaxed);
        }
        let ptr = self.window.as_ptr();
        let len = HEADER_SIZE + self.capacity as usize * SLOT_SIZE;
        // SAFETY: `ptr + base_offset .. +len` lies within the window by
        // construction (see `ring_window_stride`).
        unsafe {
            cacheops::flush_range(ptr.add(self.base_offset as usize), len);
            cacheops::invalidate_range(ptr.add(self.base_offset as usize), len);
        }
    }

    pub fn is_enabled(&self) -> bool {
        // SAFETY: see `atomic_u8_at`.
        let flag = unsafe { self.atomic_u8_at(self.enabled_offset()) };
        flag.load(Ordering::Acquire) != 0
    }

    pub fn set_enabled(&self, enabled: bool) {
        // SAFETY: see `atomic_u8_at`.
        let flag = unsafe { self.atomic_u8_at(self.enabled_offset()) };
        flag.store(enabled as u8, Ordering::Release);
    }

    /// Current occupancy, `head - tail`. Testable property (spec §8):
    /// `tail <= head` and `head - tail <= capacity - 1` at all times.
    pub fn len(&self) -> u64 {
        // SAFETY: see `atomic_u64_at`.
        let head = unsafe { self.atomic_u64_at(self.head_offset()) }.load(Ordering::Relaxed);
        let tail = unsafe { self.atomic_u64_at(self.tail_offset()) }.load(Ordering::Relaxed);
        head - tail
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Writer side. Spec §4.2: "returns `Dropped` when the ring holds
    /// (capacity - 1) messages."
    pub fn send(&self, msg: &Message) -> SendOutcome {
        // SAFETY: see `atomic_u64_at`.
        let head_cell = unsafe { self.atomic_u64_at(self.head_offset()) };
        let tail_cell = unsafe { self.atomic_u64_at(self.tail_offset()) };

        cacheops::load_fence();
        let tail = tail_cell.load(Ordering::Acquire);
        let head = head_cell.load(Ordering::Relaxed); // writer owns head

        if head - tail >= self.capacity as u64 - 1 {
            return SendOutcome::Dropped;
        }

        let slot_off = self.slot_offset(head);
        let mut wire = [0u8; MESSAGE_WIRE_SIZE];
        msg.encode(&mut wire);
        self.window.write(slot_off, &wire);

        head_cell.store(head + 1, Ordering::Release);
        cacheops::store_fence();
        SendOutcome::Sent
    }

    /// Reader side. Spec §4.2: "dequeues exactly one message and advances
    /// tail."
    pub fn poll(&self) -> Option<Message> {
        // SAFETY: see `atomic_u64_at`.
        let head_cell = unsafe { self.atomic_u64_at(self.head_offset()) };
        let tail_cell = unsafe { self.atomic_u64_at(self.tail_offset()) };

        cacheops::load_fence();
        let head = head_cell.load(Ordering::Acquire);
        let tail = tail_cell.load(Ordering::Relaxed); // reader owns tail

        if tail == head {
            return None;
        }

        let slot_off = self.slot_offset(tail);
        let mut wire = [0u8; MESSAGE_WIRE_SIZE];
        self.window.read(slot_off, &mut wire);
        let msg = Message::decode(&wire);

        tail_cell.store(tail + 1, Ordering::Release);
        cacheops::store_fence();
        msg
    }
}

/// All `node_count * (node_count - 1)` rings for one process, indexed by
/// ordered (sender, receiver) pair (spec §4.2: "the layer materializes
/// N·(N-1) rings").
pub struct RingSet {
    node_count: u32,
    capacity: u32,
    rings: Vec<RingWindow>,
    /// Round-robin cursor for `poll()` (spec §4.2: "round-robins over
    /// receive rings").
    poll_cursor: std::sync::atomic::AtomicU32,
}

impl RingSet {
    /// Build every ring for `node_count` nodes inside `window`, starting
    /// at `ring_area_base`.
    pub fn new(
        window: Arc<dyn SharedWindow>,
        ring_area_base: u64,
        node_count: u32,
        capacity: u32,
    ) -> Self {
        let stride = ring_window_stride(capacity);
        let mut rings = Vec::with_capacity((node_count * node_count.saturating_sub(1)) as usize);
        let mut pair_index = 0u64;
        for s in 0..node_count {
            for r in 0..node_count {
                if s == r {
                    continue;
                }
                let base = ring_area_base + pair_index * stride;
                rings.push(RingWindow::new(window.clone(), base, capacity));
                pair_index += 1;
            }
        }
        Self {
            node_count,
            capacity,
            rings,
            poll_cursor: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn pair_index(&self, sender: u32, receiver: u32) -> usize {
        assert_ne!(sender, receiver);
        let mut idx = 0usize;
        for s in 0..self.node_count {
            for r in 0..self.node_count {
                if s == r {
                    continue;
                }
                if s == sender && r == receiver {
                    return idx;
                }
                idx += 1;
            }
        }
        unreachable!("sender/receiver within node_count always has a slot")
    }

    /// Initialize every ring (spec §4.2 init discipline).
    pub fn init_all(&self) {
        for ring in &self.rings {
            ring.init();
        }
    }

    pub fn ring(&self, sender: u32, receiver: u32) -> &RingWindow {
        &self.rings[self.pair_index(sender, receiver)]
    }

    /// Send to one destination from `self_node`.
    pub fn send(&self, self_node: u32, dest: u32, msg: &Message) -> SendOutcome {
        self.ring(self_node, dest).send(msg)
    }

    /// Broadcast from `self_node` to every other node, returning the first
    /// error encountered (spec §4.2: "reporting the first error").
    pub fn broadcast(&self, self_node: u32, msg: &Message) -> SendOutcome {
        let mut first_drop = None;
        for r in 0..self.node_count {
            if r == self_node {
                continue;
            }
            if self.send(self_node, r, msg) == SendOutcome::Dropped && first_drop.is_none() {
                first_drop = Some(SendOutcome::Dropped);
            }
        }
        first_drop.unwrap_or(SendOutcome::Sent)
    }

    /// Round-robin over every ring addressed to `self_node`, returning the
    /// first available message and the sender that produced it.
    pub fn poll(&self, self_node: u32) -> Option<(u32, Message)> {
        if self.node_count <= 1 {
            return None;
        }
        let senders: Vec<u32> = (0..self.node_count).filter(|&n| n != self_node).collect();
        let start = self.poll_cursor.fetch_add(1, Ordering::Relaxed) as usize % senders.len();
        for i in 0..senders.len() {
            let sender = senders[(start + i) % senders.len()];
            if let Some(msg) = self.ring(sender, self_node).poll() {
                return Some((sender, msg));
            }
        }
        None
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }
}

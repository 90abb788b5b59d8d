//-----------------------------------------------------------------------------
// Module queue
// Lock-minimal multi-producer / single-consumer transport queue.
//
// Multiple ECU threads (and the protocol layer, for command responses) each
// acquire a variable length entry, write the transport message payload, then
// commit it. A single consumer thread peeks the next ready segment - one or
// more consecutive committed entries concatenated up to MAX_SEGMENT_SIZE -
// sends it, then releases it.
//
// Producers only ever contend with each other for head advancement, behind a
// short parking_lot::Mutex - the simplest acceptable default. The payload
// write and the
// RESERVED -> COMMITTED transition are lock-free: commit is a release-store
// onto the entry's counter field, reinterpreted as an AtomicU16 over the raw
// ring bytes.

#![allow(clippy::missing_safety_doc)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use parking_lot::Mutex;

/// Messages are padded to this alignment.
pub const PACKET_ALIGNMENT: usize = 4;

/// Entry header size: 2-byte length (DLC) + 2-byte counter/state (CTR).
const ENTRY_HEADER_SIZE: usize = 4;

/// Sentinel CTR value while an entry's payload is still being written.
const CTR_RESERVED: u16 = 0xFFFF;

/// Sentinel CTR value once an entry is committed but not yet assigned a real
/// transport counter by the consumer.
const CTR_COMMITTED: u16 = 0xFFFE;

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bookkeeping guarded by the producer-side mutex.
struct QueueControl {
    head: u64, // bytes reserved so far (monotonically non-decreasing)
    max_entry_size: usize,
}

/// The shared, lock-minimal ring. Cloned handles (`Arc<Queue>`) are held by
/// every producer thread; exactly one `QueueConsumer` (not `Clone`) is created
/// alongside it and owns the consumption side.
pub struct Queue {
    buffer: UnsafeCell<Box<[u8]>>,
    queue_size: usize,
    control: Mutex<QueueControl>,
    published_head: AtomicU64, // head, published for the lock-free consumer scan
    tail: AtomicU64,           // freed-up-to point, advanced only by release()
    lost: AtomicU64,           // messages dropped since the last counter assignment
}

unsafe impl Sync for Queue {}

impl Queue {
    /// `queue_size` is the usable capacity in bytes. `max_entry_size` bounds
    /// the largest single transport message (header + payload, aligned) and
    /// sizes the trailing slack region so no entry ever wraps physically
    /// within the backing buffer: a trailing slack region equal to one
    /// maximum entry absorbs the worst case.
    pub fn new(queue_size: usize, max_entry_size: usize) -> (Arc<Queue>, QueueConsumer) {
        assert!(queue_size >= max_entry_size, "queue_size must be at least one max_entry_size");
        let max_entry_size = align_up(max_entry_size, PACKET_ALIGNMENT);
        let total = queue_size + max_entry_size;
        let queue = Arc::new(Queue {
            buffer: UnsafeCell::new(vec![0u8; total].into_boxed_slice()),
            queue_size,
            control: Mutex::new(QueueControl { head: 0, max_entry_size }),
            published_head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        });
        let consumer = QueueConsumer {
            queue: Arc::clone(&queue),
            scan_tail: 0,
            next_ctr: 0,
            pending_release: None,
        };
        (queue, consumer)
    }

    #[inline]
    fn buffer_ptr(&self) -> *mut u8 {
        unsafe { (*self.buffer.get()).as_mut_ptr() }
    }

    /// Current queue fill level in bytes; always `<= queue_size`.
    pub fn level(&self) -> usize {
        let head = self.published_head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    /// Reset the queue to empty. Only safe to call when no producer holds an
    /// un-committed entry and the consumer has no pending segment - i.e.
    /// between measurement sessions.
    pub fn clear(&self) {
        let mut ctrl = self.control.lock();
        ctrl.head = 0;
        self.published_head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.lost.store(0, Ordering::Relaxed);
    }

    /// Number of messages dropped since the last time a consumer picked up
    /// the counter; overruns increment it by the number of dropped messages.
    pub fn lost_count(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Acquire a queue entry large enough for `payload_len` bytes of
    /// transport message payload. Returns `None` on overrun (queue full),
    /// having incremented the lost-packet counter.
    pub fn acquire(&self, payload_len: usize) -> Option<QueueBuffer<'_>> {
        let total_len = align_up(ENTRY_HEADER_SIZE + payload_len, PACKET_ALIGNMENT);
        let offset;
        {
            let mut ctrl = self.control.lock();
            assert!(total_len <= ctrl.max_entry_size, "message exceeds max_entry_size");
            let tail = self.tail.load(Ordering::Acquire);
            let free = self.queue_size as u64 - (ctrl.head - tail);
            if free < total_len as u64 {
                drop(ctrl);
                self.lost.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            offset = (ctrl.head % self.queue_size as u64) as usize;
            ctrl.head += total_len as u64;

            // SAFETY: `offset..offset+total_len` was exclusively reserved for
            // this producer by the mutex held here, and is disjoint from
            // every other producer's region. The header is written and
            // becomes visible to the consumer only *after* this write,
            // because `published_head` (the consumer's scan bound) is not
            // stored until the line below, still inside this critical
            // section.
            unsafe {
                let base = self.buffer_ptr().add(offset);
                let dlc = payload_len as u16;
                base.write(dlc as u8);
                base.add(1).write((dlc >> 8) as u8);
                let ctr_word = base.add(2) as *const AtomicU16;
                (*ctr_word).store(CTR_RESERVED, Ordering::Relaxed);
            }

            // Publish only after the header above is durably written, so the
            // consumer's acquire-load at peek() never observes a region up
            // to `published_head` whose header has not been written yet.
            self.published_head.store(ctrl.head, Ordering::Release);
        }

        Some(QueueBuffer {
            queue: self,
            offset,
            len: payload_len,
        })
    }

    /// Marks an entry COMMITTED; `flush` is consulted by the consumer as a
    /// hint to drain immediately rather than wait for more data to batch.
    fn commit(&self, offset: usize, _flush: bool) {
        // SAFETY: `offset` was produced by `acquire` and this is the unique
        // commit call for that entry (QueueBuffer::commit consumes self).
        unsafe {
            let base = self.buffer_ptr().add(offset);
            let ctr_word = base.add(2) as *const AtomicU16;
            (*ctr_word).store(CTR_COMMITTED, Ordering::Release);
        }
    }
}

/// A reserved, not-yet-committed queue entry. Must be committed exactly
/// once: every acquire that returns a buffer is followed by exactly one
/// commit.
pub struct QueueBuffer<'q> {
    queue: &'q Queue,
    offset: usize,
    len: usize,
}

impl<'q> QueueBuffer<'q> {
    /// Mutable view of the payload region (excludes the transport header).
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: this region was exclusively reserved for this entry by
        // Queue::acquire and is not observed by the consumer until commit().
        unsafe {
            let base = self.queue.buffer_ptr().add(self.offset + ENTRY_HEADER_SIZE);
            std::slice::from_raw_parts_mut(base, self.len)
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commit the entry, making it visible to the consumer.
    pub fn commit(self, flush: bool) {
        self.queue.commit(self.offset, flush);
    }
}

/// A ready-to-send segment: one or more consecutive committed entries,
/// concatenated, with real transport counters already assigned.
pub struct QueueSegment {
    offset: usize,
    len: usize,
}

impl QueueSegment {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The single consumer side of the queue: owned by the transmit thread.
pub struct QueueConsumer {
    queue: Arc<Queue>,
    scan_tail: u64,
    next_ctr: u16,
    pending_release: Option<(u64, usize)>, // (scan_tail at peek time, segment len)
}

impl QueueConsumer {
    /// Look for the next segment of consecutive COMMITTED entries whose
    /// combined size fits within `max_segment_size` and does not wrap the
    /// ring; returns `None` if nothing is ready yet.
    pub fn peek(&mut self, max_segment_size: usize) -> Option<(QueueSegment, &[u8])> {
        assert!(self.pending_release.is_none(), "peek() called again before the previous segment was released");

        let head = self.queue.published_head.load(Ordering::Acquire);
        let start_tail = self.scan_tail;
        let start_offset = (start_tail % self.queue.queue_size as u64) as usize;
        let mut cursor = start_tail;
        let mut segment_len: usize = 0;

        while cursor < head {
            let offset = (cursor % self.queue.queue_size as u64) as usize;
            // SAFETY: reading a header that may still be RESERVED is fine -
            // the length field is always written before the entry is
            // published via `published_head`, and we only ever stop or act
            // on the CTR field after an acquire-load of it.
            let (dlc, ctr) = unsafe {
                let base = self.queue.buffer_ptr().add(offset);
                let dlc = base.read() as u16 | ((base.add(1).read() as u16) << 8);
                let ctr_word = base.add(2) as *const AtomicU16;
                let ctr = (*ctr_word).load(Ordering::Acquire);
                (dlc, ctr)
            };

            if ctr == CTR_RESERVED {
                break; // producer still writing; stop consolidating here
            }
            debug_assert_eq!(ctr, CTR_COMMITTED, "consumer re-scanned an already-assigned entry");

            let entry_total = align_up(ENTRY_HEADER_SIZE + dlc as usize, PACKET_ALIGNMENT);
            if segment_len + entry_total > max_segment_size {
                break;
            }
            // `offset` must be physically contiguous with the bytes already
            // folded into this segment, i.e. exactly `start_offset +
            // segment_len`. The slack region lets a single entry straddle the
            // `queue_size` boundary without wrapping its own bytes, but the
            // *next* entry's offset is `(cursor % queue_size)`, which snaps
            // back to a low address once `cursor` itself crosses a multiple
            // of `queue_size` - not a continuation of the previous entry's
            // spill into slack. Stop here and let the next `peek()` start a
            // fresh, genuinely contiguous run at that (wrapped) offset.
            if offset != start_offset + segment_len {
                break;
            }

            // Assign the real transport counter now, folding in any overrun
            // gap observed since the last assignment.
            let lost = self.queue.lost.swap(0, Ordering::Relaxed);
            self.next_ctr = self.next_ctr.wrapping_add(1u16.wrapping_add(lost as u16));
            unsafe {
                let base = self.queue.buffer_ptr().add(offset);
                let ctr_word = base.add(2) as *mut u16;
                ctr_word.write(self.next_ctr);
            }

            segment_len += entry_total;
            cursor += entry_total as u64;
        }

        if segment_len == 0 {
            return None;
        }

        self.pending_release = Some((start_tail, segment_len));
        self.scan_tail = cursor;

        // SAFETY: [start_offset, start_offset+segment_len) was, by
        // construction above, made entirely of entries that are now fully
        // assigned (CTR written), and the slack region guarantees this range
        // never runs off the end of the backing allocation.
        let slice = unsafe { std::slice::from_raw_parts(self.queue.buffer_ptr().add(start_offset), segment_len) };
        Some((QueueSegment { offset: start_offset, len: segment_len }, slice))
    }

    /// Release a segment previously returned by `peek`, freeing its space for
    /// producers.
    pub fn release(&mut self, segment: QueueSegment) {
        let (start_tail, len) = self.pending_release.take().expect("release() without a matching peek()");
        assert_eq!(segment.len, len);
        let new_tail = start_tail + len as u64;
        self.queue.tail.store(new_tail, Ordering::Release);
    }

    pub fn level(&self) -> usize {
        self.queue.level()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.scan_tail = 0;
        self.next_ctr = 0;
        self.pending_release = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_message(queue: &Queue, payload: &[u8]) {
        let mut buf = queue.acquire(payload.len()).expect("acquire");
        buf.payload_mut().copy_from_slice(payload);
        buf.commit(false);
    }

    #[test]
    fn acquire_commit_peek_release_roundtrip() {
        let (queue, mut consumer) = Queue::new(1024, 64);
        write_message(&queue, b"hello");
        let (seg, bytes) = consumer.peek(2048).expect("segment ready");
        assert_eq!(bytes.len(), 8); // 4 header + 5 payload, aligned to 8
        assert_eq!(&bytes[4..9], b"hello");
        consumer.release(seg);
        assert_eq!(consumer.level(), 0);
    }

    #[test]
    fn level_never_exceeds_queue_size_and_clear_resets_to_zero() {
        let (queue, mut consumer) = Queue::new(256, 32);
        for i in 0..20u8 {
            if queue.acquire(8).is_some() {
                let mut buf = queue.acquire(8).unwrap();
                buf.payload_mut().copy_from_slice(&[i; 8]);
                buf.commit(false);
            }
            assert!(consumer.level() <= 256);
        }
        consumer.clear();
        assert_eq!(consumer.level(), 0);
    }

    #[test]
    fn overrun_increments_lost_counter_and_returns_none() {
        let (queue, _consumer) = Queue::new(16, 16);
        // First entry fits exactly (16 header+payload aligned == queue_size).
        let buf = queue.acquire(12).expect("first message fits");
        buf.commit(false);
        assert!(queue.acquire(4).is_none(), "queue should be full");
        assert_eq!(queue.lost_count(), 1);
    }

    #[test]
    fn transport_counter_increments_by_message_count_plus_overruns() {
        let (queue, mut consumer) = Queue::new(64, 16);
        write_message(&queue, b"a");
        let (seg, _) = consumer.peek(1024).unwrap();
        consumer.release(seg);
        let first_ctr = consumer.next_ctr;

        // Force an overrun: fill then fail one acquire before sending the next message.
        {
            let mut bufs = Vec::new();
            while let Some(b) = queue.acquire(12) {
                bufs.push(b);
            }
            assert!(queue.acquire(12).is_none());
            for b in bufs {
                b.commit(false);
            }
        }
        let (seg, _) = consumer.peek(1024).unwrap();
        consumer.release(seg);
        assert!(consumer.next_ctr.wrapping_sub(first_ctr) >= 2, "counter must skip over the dropped message");
    }

    #[test]
    fn peek_consolidates_consecutive_committed_entries_into_one_segment() {
        let (queue, mut consumer) = Queue::new(1024, 64);
        write_message(&queue, b"one");
        write_message(&queue, b"two");
        write_message(&queue, b"three");
        let (seg, bytes) = consumer.peek(2048).expect("segment ready");
        assert_eq!(seg.len(), bytes.len());
        // Three headers + payloads, aligned.
        assert_eq!(seg.len(), 8 + 8 + 8);
        consumer.release(seg);
    }

    #[test]
    fn peek_stops_at_reserved_entry_without_blocking() {
        let (queue, mut consumer) = Queue::new(1024, 64);
        write_message(&queue, b"ready");
        let _held = queue.acquire(4).expect("reserve without committing");
        let (seg, bytes) = consumer.peek(2048).expect("first segment still available");
        assert_eq!(&bytes[4..9], b"ready");
        consumer.release(seg);
        assert!(consumer.peek(2048).is_none(), "reserved entry must not be surfaced");
    }

    #[test]
    fn peek_does_not_consolidate_across_a_ring_wrap() {
        // queue_size=32, max_entry_size=16: push the ring right up against
        // the boundary, then commit one entry that spills into the slack and
        // a follow-up entry that wraps back to a low real offset. A naive
        // consolidation would read the second entry's bytes from the wrong
        // physical location.
        let (queue, mut consumer) = Queue::new(32, 16);
        write_message(&queue, b"1234567890123"); // 13 bytes -> 17 aligned to 20, offset 0..20
        {
            let (seg, _) = consumer.peek(2048).unwrap();
            consumer.release(seg);
        }
        // Next acquire starts at offset 20 (head=20, 20 % 32 == 20); a 13-byte
        // payload (20 bytes total) would span [20, 40), spilling 8 bytes past
        // queue_size=32 into the 16-byte slack - allowed for one entry.
        write_message(&queue, b"AAAAAAAAAAAAA");
        // Head is now 40; 40 % 32 == 8, a low real offset that does not
        // continue where the previous entry's bytes end (40), so this entry
        // must start a fresh segment rather than consolidate with the one
        // above.
        write_message(&queue, b"BBBBBBBB");

        let (seg1, bytes1) = consumer.peek(2048).expect("first segment");
        assert_eq!(&bytes1[4..17], b"AAAAAAAAAAAAA", "must not include the wrapped entry's garbage region");
        consumer.release(seg1);

        let (seg2, bytes2) = consumer.peek(2048).expect("second segment after wrap");
        assert_eq!(&bytes2[4..12], b"BBBBBBBB");
        consumer.release(seg2);
    }
}

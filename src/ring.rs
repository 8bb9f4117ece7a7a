//! Memory-mapped frame ring shared by one producer and two readers.
//!
//! The ring is a contiguous anonymous mapping holding variable-size frame
//! records. Offsets are monotonically increasing byte counts; the physical
//! position of an offset is `offset % capacity`. Two guarantees hold for every
//! record and are relied on by the pipeline and by host code walking mapped
//! regions:
//!
//! 1. every record starts at an 8-byte aligned offset (and address), and
//! 2. consumed byte counts are always multiples of 8.
//!
//! Records never straddle the physical end of the region: a reservation that
//! would cross it publishes a *pad* (skip) region covering the remainder of
//! the lap and the record starts at the next lap. Readers resolve pads
//! transparently inside `map_read`.
//!
//! Reader 0 is the storage consumer and gates the writer: a reservation that
//! would overtake it fails and the producer drops the frame. Reader 1 is the
//! monitor tap and never gates the writer; if the writer gets more than one
//! capacity ahead, the monitor cursor snaps forward to the write head and the
//! skipped bytes are counted. Monitor regions are handed to the host as
//! copies (see [`MappedFrames`]) so the writer can never race host-held
//! memory; the in-process consumer reads zero-copy under the gating
//! guarantee.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::RingError;
use crate::frame::{align_up, MappedFrames, FRAME_ALIGN};

/// Reader slot of the storage consumer. Gates the writer.
pub const READER_CONSUMER: usize = 0;
/// Reader slot of the live monitor. Never gates the writer.
pub const READER_MONITOR: usize = 1;

const READER_COUNT: usize = 2;

/// Marker for "no pad region published".
const NO_SKIP: u64 = u64::MAX;

/// One published pad (skip) region, keyed by its absolute start offset.
///
/// Two slots indexed by lap parity are enough: a reader is never more than
/// one capacity behind the writer (the consumer by gating, the monitor by
/// snapping), so the pads it can encounter always come from two adjacent
/// laps, which never share parity. Offsets are monotonic, so a stale entry
/// can never falsely match a reader's cursor.
struct SkipSlot {
    start: AtomicU64,
    len: AtomicU64,
}

impl Default for SkipSlot {
    fn default() -> Self {
        Self {
            start: AtomicU64::new(NO_SKIP),
            len: AtomicU64::new(0),
        }
    }
}

/// Counters for ring behavior, mirrored into snapshots for observers.
#[derive(Debug, Default)]
struct RingStats {
    frames_committed: AtomicU64,
    bytes_committed: AtomicU64,
    reservation_failures: AtomicU64,
    pad_records: AtomicU64,
    monitor_snaps: AtomicU64,
}

/// Point-in-time view of [`RingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStatsSnapshot {
    pub frames_committed: u64,
    pub bytes_committed: u64,
    pub reservation_failures: u64,
    pub pad_records: u64,
    pub monitor_snaps: u64,
}

/// Bounded, 8-byte-aligned, variable-record frame ring.
pub struct FrameRing {
    _map: MmapMut,
    base: *mut u8,
    capacity: u64,
    /// Committed monotonic offset. Written by the writer (release), read by
    /// everyone (acquire).
    write_head: AtomicU64,
    /// Pad regions by lap parity, written by the writer before the commit
    /// that publishes them.
    skips: [SkipSlot; 2],
    /// Monotonic reader cursors. Advanced by their reader (release); the
    /// writer reads the consumer cursor (acquire) before reusing space.
    cursors: [AtomicU64; READER_COUNT],
    /// Length of each reader's outstanding mapped region; bounds unmap.
    mapped: [AtomicU64; READER_COUNT],
    writer_taken: AtomicBool,
    running: AtomicBool,
    stats: RingStats,
    /// Signalled on every commit; the consumer parks here when empty.
    readable: Condvar,
    readable_lock: Mutex<()>,
}

// The raw base pointer is only dereferenced under the writer/reader cursor
// protocol above; the mapping itself is plain anonymous memory.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Create a ring sized for frames of at most `max_frame_bytes`, holding a
    /// power-of-two number of slots of at least `queue_depth`.
    pub fn with_frame_size(max_frame_bytes: usize, queue_depth: usize) -> Result<Arc<Self>, RingError> {
        let slot = align_up(max_frame_bytes.max(FRAME_ALIGN), FRAME_ALIGN);
        let slots = queue_depth.max(2).next_power_of_two();
        let capacity = slot * slots;

        let mut map = MmapMut::map_anon(capacity).map_err(|source| RingError::Map {
            capacity,
            source,
        })?;
        let base = map.as_mut_ptr();

        debug!(
            "Mapped frame ring: {} slots of {} bytes ({} bytes total)",
            slots, slot, capacity
        );

        Ok(Arc::new(Self {
            _map: map,
            base,
            capacity: capacity as u64,
            write_head: AtomicU64::new(0),
            skips: Default::default(),
            cursors: Default::default(),
            mapped: Default::default(),
            writer_taken: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: RingStats::default(),
            readable: Condvar::new(),
            readable_lock: Mutex::new(()),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn stats(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            frames_committed: self.stats.frames_committed.load(Ordering::Relaxed),
            bytes_committed: self.stats.bytes_committed.load(Ordering::Relaxed),
            reservation_failures: self.stats.reservation_failures.load(Ordering::Relaxed),
            pad_records: self.stats.pad_records.load(Ordering::Relaxed),
            monitor_snaps: self.stats.monitor_snaps.load(Ordering::Relaxed),
        }
    }

    /// Claim the single writer token.
    ///
    /// Panics if a writer is already outstanding; the pipeline creates exactly
    /// one per acquisition and drops it when the producer exits.
    pub fn writer(self: &Arc<Self>) -> RingWriter {
        assert!(
            !self.writer_taken.swap(true, Ordering::AcqRel),
            "frame ring already has a writer"
        );
        RingWriter {
            ring: Arc::clone(self),
            reservation: None,
        }
    }

    /// Mark the start of an acquisition: the monitor cursor is moved to the
    /// write head so the host only observes frames of the new run.
    pub fn begin(&self) {
        let head = self.write_head.load(Ordering::Acquire);
        self.cursors[READER_MONITOR].store(head, Ordering::Release);
        self.mapped[READER_MONITOR].store(0, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    /// Mark the end of an acquisition and wake any parked reader.
    pub fn end(&self) {
        self.running.store(false, Ordering::Release);
        self.readable.notify_all();
    }

    /// Move every cursor to the write head, discarding unread records.
    /// Only meaningful once the writer has exited (after an abort).
    pub fn discard_all(&self) {
        let head = self.write_head.load(Ordering::Acquire);
        for cursor in &self.cursors {
            cursor.store(head, Ordering::Release);
        }
        for mapped in &self.mapped {
            mapped.store(0, Ordering::Relaxed);
        }
    }

    /// Rewind every cursor and the write head to zero.
    ///
    /// Rejected while an acquisition is running; the ring must be empty and
    /// stopped before cursors may move backwards.
    pub fn reset(&self) -> Result<(), RingError> {
        if self.running.load(Ordering::Acquire) || self.writer_taken.load(Ordering::Acquire) {
            return Err(RingError::NotStopped);
        }
        self.write_head.store(0, Ordering::Release);
        for skip in &self.skips {
            skip.start.store(NO_SKIP, Ordering::Relaxed);
            skip.len.store(0, Ordering::Relaxed);
        }
        for cursor in &self.cursors {
            cursor.store(0, Ordering::Release);
        }
        for mapped in &self.mapped {
            mapped.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Block until the consumer has something to read, the timeout elapses,
    /// or the acquisition stops. Returns whether data is readable.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let readable = |ring: &Self| {
            ring.write_head.load(Ordering::Acquire)
                != ring.cursors[READER_CONSUMER].load(Ordering::Relaxed)
        };
        if readable(self) {
            return true;
        }
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.readable_lock.lock();
        if readable(self) {
            return true;
        }
        self.readable.wait_for(&mut guard, timeout);
        readable(self)
    }

    /// Map the consumer's readable slice, zero-copy.
    ///
    /// The returned region only ever covers committed records; the gating in
    /// `map_write` guarantees the writer cannot touch it until the consumer
    /// acknowledges it via [`FrameRing::consumer_unmap`].
    pub fn consumer_map(&self) -> &[u8] {
        let (phys, len) = self.readable_region(READER_CONSUMER);
        self.mapped[READER_CONSUMER].store(len, Ordering::Relaxed);
        unsafe { std::slice::from_raw_parts(self.base.add(phys as usize), len as usize) }
    }

    /// Advance the consumer cursor by `nbytes` of a previously mapped region.
    pub fn consumer_unmap(&self, nbytes: usize) -> Result<(), RingError> {
        self.unmap(READER_CONSUMER, nbytes)
    }

    /// Copy the monitor's readable slice out of the ring.
    pub fn monitor_map(&self) -> MappedFrames {
        let (phys, len) = self.readable_region(READER_MONITOR);
        self.mapped[READER_MONITOR].store(len, Ordering::Relaxed);
        if len == 0 {
            return MappedFrames::default();
        }
        let region =
            unsafe { std::slice::from_raw_parts(self.base.add(phys as usize), len as usize) };
        MappedFrames::copy_of(region)
    }

    /// Advance the monitor cursor by `nbytes` of a previously mapped region.
    pub fn monitor_unmap(&self, nbytes: usize) -> Result<(), RingError> {
        self.unmap(READER_MONITOR, nbytes)
    }

    fn unmap(&self, reader: usize, nbytes: usize) -> Result<(), RingError> {
        if nbytes % FRAME_ALIGN != 0 {
            return Err(RingError::MisalignedUnmap { nbytes });
        }
        let mapped = self.mapped[reader].load(Ordering::Relaxed);
        if nbytes as u64 > mapped {
            return Err(RingError::UnmapOverrun {
                nbytes,
                readable: mapped as usize,
            });
        }
        self.mapped[reader].store(mapped - nbytes as u64, Ordering::Relaxed);
        // Release: the writer may only reuse this span after our reads.
        self.cursors[reader].fetch_add(nbytes as u64, Ordering::Release);
        Ok(())
    }

    /// Resolve pads and overruns for `reader`, returning the physical offset
    /// and length of its contiguous readable region.
    fn readable_region(&self, reader: usize) -> (u64, u64) {
        let head = self.write_head.load(Ordering::Acquire);
        let mut cursor = self.cursors[reader].load(Ordering::Relaxed);

        // The monitor never gates the writer; when lapped, it skips ahead.
        if reader == READER_MONITOR && head - cursor > self.capacity {
            trace!("Monitor reader lapped; snapping cursor ahead by {} bytes", head - cursor);
            self.stats.monitor_snaps.fetch_add(1, Ordering::Relaxed);
            cursor = head;
            self.cursors[reader].store(cursor, Ordering::Release);
        }

        // Step over a pad region published at the cursor.
        let slot = &self.skips[self.lap_parity(cursor)];
        let skip_start = slot.start.load(Ordering::Relaxed);
        let skip_len = slot.len.load(Ordering::Relaxed);
        if skip_len > 0 && cursor == skip_start && head > skip_start {
            cursor += skip_len;
            self.cursors[reader].store(cursor, Ordering::Release);
        }

        // Stop short of the nearest pad region ahead of the cursor.
        let mut end = head;
        for slot in &self.skips {
            let start = slot.start.load(Ordering::Relaxed);
            if slot.len.load(Ordering::Relaxed) > 0 && start >= cursor && start < end {
                end = start;
            }
        }

        // Clamp to the physical end of the mapping; a record can end exactly
        // on the lap boundary without a pad.
        let phys = cursor % self.capacity;
        let len = (end - cursor).min(self.capacity - phys);
        (phys, len)
    }

    fn lap_parity(&self, offset: u64) -> usize {
        ((offset / self.capacity) & 1) as usize
    }
}

/// Pending reservation of the single writer.
struct Reservation {
    /// Monotonic offset where the record data begins (after any pad).
    data_start: u64,
    /// Reserved record length, already aligned.
    len: u64,
}

/// The single writer token of a [`FrameRing`].
pub struct RingWriter {
    ring: Arc<FrameRing>,
    reservation: Option<Reservation>,
}

impl RingWriter {
    /// Reserve space for a record of up to `nbytes` bytes.
    ///
    /// Returns `None` when the slowest gating reader has not drained enough
    /// space; the producer drops the frame rather than blocking. On success
    /// the returned slice is the full aligned reservation.
    pub fn map_write(&mut self, nbytes: usize) -> Option<&mut [u8]> {
        debug_assert!(self.reservation.is_none(), "commit_write before remapping");
        let ring = &*self.ring;
        let len = align_up(nbytes, FRAME_ALIGN) as u64;
        if len > ring.capacity {
            warn!("Record of {} bytes cannot fit a {} byte ring", nbytes, ring.capacity);
            ring.stats.reservation_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let head = ring.write_head.load(Ordering::Relaxed);
        let phys = head % ring.capacity;
        let contiguous = ring.capacity - phys;
        let pad = if len > contiguous { contiguous } else { 0 };

        // Gate on the storage consumer only.
        let consumer = ring.cursors[READER_CONSUMER].load(Ordering::Acquire);
        if head - consumer + pad + len > ring.capacity {
            ring.stats.reservation_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slot = &ring.skips[ring.lap_parity(head)];
        if pad > 0 {
            // Published to readers by the release store in commit_write.
            slot.start.store(head, Ordering::Relaxed);
            slot.len.store(pad, Ordering::Relaxed);
            ring.stats.pad_records.fetch_add(1, Ordering::Relaxed);
        } else if slot.start.load(Ordering::Relaxed) == head {
            // A record now starts where an abandoned pad was once recorded.
            slot.start.store(NO_SKIP, Ordering::Relaxed);
            slot.len.store(0, Ordering::Relaxed);
        }

        let data_start = head + pad;
        self.reservation = Some(Reservation { data_start, len });
        let offset = (data_start % ring.capacity) as usize;
        Some(unsafe { std::slice::from_raw_parts_mut(ring.base.add(offset), len as usize) })
    }

    /// Publish the reserved record, padded to 8 bytes.
    pub fn commit_write(&mut self, nbytes: usize) {
        let Reservation { data_start, len } = self
            .reservation
            .take()
            .expect("commit_write without a reservation");
        let committed = align_up(nbytes, FRAME_ALIGN) as u64;
        assert!(committed <= len, "committed more than was reserved");

        // Zero the alignment tail so mapped regions are deterministic.
        if committed as usize > nbytes {
            let offset = (data_start % self.ring.capacity) as usize + nbytes;
            unsafe {
                std::ptr::write_bytes(self.ring.base.add(offset), 0, committed as usize - nbytes);
            }
        }

        self.ring
            .write_head
            .store(data_start + committed, Ordering::Release);
        self.ring.stats.frames_committed.fetch_add(1, Ordering::Relaxed);
        self.ring
            .stats
            .bytes_committed
            .fetch_add(committed, Ordering::Relaxed);
        self.ring.readable.notify_all();
    }

    /// Discard an un-committed reservation.
    pub fn abandon_write(&mut self) {
        self.reservation = None;
    }

    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.ring.writer_taken.store(false, Ordering::Release);
        self.ring.readable.notify_all();
    }
}

//! Producer handle over a ring segment.
//!
//! # Protocol
//!
//! **Reserve:**
//! 1. Place the slot at `head`, skipping to the next lap if it would straddle
//!    the physical end
//! 2. Make sure `tail` is far enough ahead, reclaiming old slots if the
//!    readers (or the overwrite policy) allow it
//! 3. Hand the payload bytes to the caller; nothing is visible yet
//!
//! **Commit:**
//! 1. Write the wrap marker, if any, then the length prefix (release)
//! 2. Advance `head` (release) and wake sleeping readers
//!
//! Only one thread may drive a producer handle. Several handles on the same
//! segment (in one or several processes) must serialise their
//! reserve/commit pairs externally.

use crate::error::{SegmentError, WriteError, WriteStatus};
use crate::reader::ShadowRing;
use crate::region::Region;
use crate::ring::{
    OverflowPolicy, PREFIX_LEN, RingOptions, WRAP_MARK, next_lap, place, position_to_offset,
    reclaim_target, slot_len,
};
use crate::segment::{self, OpenMode, SegmentIdent};
use crate::shm_layout::{MAX_READERS, SLOT_ACTIVE, STATE_DESTROYED, STATE_EOF};
use crate::stats::RingStats;
use crate::wait::{PlatformWaiter, WaitConfig, WaitOutcome, WaitWord};
use lithos_mmap::ShmFile;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reserved but not yet committed slot.
#[derive(Debug, Clone, Copy)]
struct Pending {
    start: u64,
    end: u64,
    wrap_at: Option<u64>,
    len: usize,
}

/// The producer side of a ring segment.
pub struct RingBuffer {
    region: Arc<Region>,
    options: RingOptions,
    mask: u64,
    pending: Option<Pending>,
    /// Lowest reader cursor seen at the last scan of the reader table.
    gate: u64,
    /// `attach_epoch` at the last scan.
    seen_epoch: u64,
    last_failure: Option<WriteStatus>,
    overflow_warned: bool,
    closed: bool,
    /// Runs between publishing a new tail and the epoch re-check.
    #[cfg(test)]
    after_tail_store: Option<Box<dyn FnMut(&Region) + Send + Sync>>,
}

impl RingBuffer {
    /// Create a new named segment. Fails if the name is taken.
    pub fn create(ident: &SegmentIdent, options: RingOptions) -> Result<Self, SegmentError> {
        Self::open(ident, OpenMode::CreateNew, options)
    }

    pub fn open(
        ident: &SegmentIdent,
        mode: OpenMode,
        options: RingOptions,
    ) -> Result<Self, SegmentError> {
        options.validate()?;
        let region = match mode {
            OpenMode::CreateNew => segment::create(ident, &options)?,
            OpenMode::OpenExisting => Self::join(ident, &options)?,
            OpenMode::CreateOrOpen => Self::create_or_join(ident, &options)?,
        };
        Ok(Self::from_region(Arc::new(region), options))
    }

    /// A heap-backed ring with the same semantics, for in-process use.
    pub fn in_memory(options: RingOptions) -> Result<Self, SegmentError> {
        options.validate()?;
        let region = segment::in_memory(&options)?;
        Ok(Self::from_region(Arc::new(region), options))
    }

    fn join(ident: &SegmentIdent, options: &RingOptions) -> Result<Region, SegmentError> {
        let region = segment::map_existing(ident)?;
        segment::check_compatible(&region, options)?;
        let producers = segment::join_producer(&region)?;
        info!(segment = %ident, producers, "joined ring segment");
        Ok(region)
    }

    fn create_or_join(ident: &SegmentIdent, options: &RingOptions) -> Result<Region, SegmentError> {
        const ATTEMPTS: u32 = 100;
        let mut last = SegmentError::Destroyed;
        for _ in 0..ATTEMPTS {
            match segment::create(ident, options) {
                Ok(region) => return Ok(region),
                Err(e) if e.io_kind() == Some(io::ErrorKind::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
            match Self::join(ident, options) {
                Ok(region) => return Ok(region),
                // The last producer is tearing the segment down; its file
                // disappears shortly and the next create succeeds.
                Err(e @ SegmentError::Destroyed) => last = e,
                Err(e) if e.io_kind() == Some(io::ErrorKind::NotFound) => last = e,
                Err(e) => return Err(e),
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(last)
    }

    fn from_region(region: Arc<Region>, options: RingOptions) -> Self {
        Self {
            mask: options.mask(),
            region,
            options,
            pending: None,
            gate: 0,
            seen_epoch: 0,
            last_failure: None,
            overflow_warned: false,
            closed: false,
            #[cfg(test)]
            after_tail_store: None,
        }
    }

    /// Reserve room for a `len`-byte payload and return it for writing.
    ///
    /// Never blocks. A pending reservation is dropped. Nothing becomes visible
    /// to readers until [`commit`](Self::commit).
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], WriteError> {
        self.pending = None;
        let state = self.region.header().state();
        if state & STATE_DESTROYED != 0 {
            return Err(self.fail(WriteError::Destroyed));
        }
        if state & STATE_EOF != 0 {
            return Err(self.fail(WriteError::Closed));
        }
        let slot = slot_len(len);
        if slot > self.options.max_slot() {
            return Err(WriteError::TooLarge {
                requested: len,
                max: self.options.max_payload(),
            });
        }
        if self.options.require_readers && self.reader_count() == 0 {
            return Err(self.fail(WriteError::NoReaders));
        }

        let head = self.region.header().producer.head.load(Ordering::Acquire);
        let at = place(head, slot, self.options.capacity);
        if self.make_room(reclaim_target(at.end, self.options.capacity)).is_err() {
            return Err(self.overflow());
        }

        self.last_failure = None;
        self.pending = Some(Pending {
            start: at.start,
            end: at.end,
            wrap_at: at.wrap_at,
            len,
        });
        let offset = position_to_offset(at.start, self.mask) + PREFIX_LEN as usize;
        // SAFETY: [start, end) lies above every reader's cursor (make_room)
        // and above `head`, so no reader can observe it until commit.
        Ok(unsafe { self.region.bytes_mut(offset, len) })
    }

    /// Publish the pending reservation.
    pub fn commit(&mut self) -> Result<(), WriteError> {
        let p = self.pending.take().ok_or(WriteError::NoReservation)?;
        let region = &self.region;
        let h = region.header();
        if let Some(wrap_at) = p.wrap_at {
            region
                .prefix(position_to_offset(wrap_at, self.mask))
                .store(WRAP_MARK, Ordering::Relaxed);
        }
        region
            .prefix(position_to_offset(p.start, self.mask))
            .store(p.len as u32, Ordering::Release);
        h.producer.head.store(p.end, Ordering::Release);
        h.producer.records_in.fetch_add(1, Ordering::Relaxed);
        h.producer
            .bytes_in
            .fetch_add(p.len as u64, Ordering::Relaxed);
        WaitWord::<PlatformWaiter>::new(&h.data_wait.word).wake();
        Ok(())
    }

    /// Drop the pending reservation without publishing it.
    pub fn abort(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Terminal states first, then the outcome of the last reservation.
    pub fn write_status(&self) -> WriteStatus {
        let state = self.region.header().state();
        if state & STATE_DESTROYED != 0 {
            WriteStatus::Destroyed
        } else if state & STATE_EOF != 0 {
            WriteStatus::Closed
        } else if self.options.require_readers && self.reader_count() == 0 {
            WriteStatus::NoReaders
        } else {
            self.last_failure.unwrap_or(WriteStatus::Ready)
        }
    }

    /// Block until a `len`-byte payload would fit, the stream ends, or the
    /// configured timeout elapses.
    pub fn wait_for_space(&self, len: usize, cfg: &WaitConfig) -> WaitOutcome {
        let slot = slot_len(len);
        if slot > self.options.max_slot() {
            return WaitOutcome::Ready;
        }
        let region = &*self.region;
        let options = self.options;
        WaitWord::<PlatformWaiter>::new(&region.header().space_wait.word)
            .wait_until(cfg, || has_space(region, &options, slot))
    }

    /// Mark the end of the stream. Readers drain what was committed and then
    /// see end-of-stream. Idempotent.
    pub fn signal_end_of_stream(&mut self) {
        self.pending = None;
        let h = self.region.header();
        let prev = h.lifecycle.state.fetch_or(STATE_EOF, Ordering::AcqRel);
        if prev & STATE_EOF == 0 {
            info!(
                head = h.producer.head.load(Ordering::Relaxed),
                records = h.producer.records_in.load(Ordering::Relaxed),
                "end of stream signalled"
            );
        }
        WaitWord::<PlatformWaiter>::new(&h.data_wait.word).wake();
        WaitWord::<PlatformWaiter>::new(&h.space_wait.word).wake();
    }

    /// A consumer-side view over the same memory.
    pub fn shadow(&self) -> ShadowRing {
        ShadowRing::from_region(Arc::clone(&self.region))
    }

    pub fn stats(&self) -> RingStats {
        RingStats::read(self.region.header())
    }

    pub fn options(&self) -> &RingOptions {
        &self.options
    }

    pub fn max_payload(&self) -> usize {
        self.options.max_payload()
    }

    pub fn ident(&self) -> Option<&SegmentIdent> {
        self.region.ident()
    }

    /// Release this producer reference. The last one destroys the segment.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;

        let region = &self.region;
        if !segment::leave_producer(region) {
            debug!(segment = ?region.ident().map(|i| i.to_string()), "producer handle closed");
            return;
        }

        let h = region.header();
        h.lifecycle
            .state
            .fetch_or(STATE_DESTROYED, Ordering::AcqRel);
        if let Some(ident) = region.ident() {
            match ShmFile::unlink(&ident.namespace, &ident.name) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(segment = %ident, error = %e, "failed to unlink segment"),
            }
            info!(segment = %ident, "destroyed ring segment");
        }
        WaitWord::<PlatformWaiter>::new(&h.data_wait.word).wake();
        WaitWord::<PlatformWaiter>::new(&h.space_wait.word).wake();
    }

    fn reader_count(&self) -> u32 {
        self.region
            .header()
            .lifecycle
            .reader_count
            .load(Ordering::Acquire)
    }

    fn fail(&mut self, e: WriteError) -> WriteError {
        self.last_failure = match e {
            WriteError::Full => Some(WriteStatus::Full),
            WriteError::NoReaders => Some(WriteStatus::NoReaders),
            WriteError::Closed => Some(WriteStatus::Closed),
            WriteError::Destroyed => Some(WriteStatus::Destroyed),
            _ => self.last_failure,
        };
        e
    }

    fn overflow(&mut self) -> WriteError {
        let h = self.region.header();
        let total = h.producer.overflows.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.overflow_warned {
            self.overflow_warned = true;
            warn!(
                head = h.producer.head.load(Ordering::Relaxed),
                tail = h.producer.tail.load(Ordering::Relaxed),
                total,
                "ring full, reservation rejected"
            );
        }
        self.fail(WriteError::Full)
    }

    /// Move `tail` to at least `need`, if readers allow it.
    fn make_room(&mut self, need: u64) -> Result<(), WriteError> {
        let h = self.region.header();
        let tail = h.producer.tail.load(Ordering::Acquire);
        if need <= tail {
            return Ok(());
        }

        let epoch = &h.lifecycle.attach_epoch;
        if need > self.gate || epoch.load(Ordering::SeqCst) != self.seen_epoch {
            (self.seen_epoch, self.gate) = scan_gate(&self.region, self.options.policy);
        }
        if need > self.gate {
            return Err(WriteError::Full);
        }

        let new_tail = reclaim(&self.region, tail, need, self.mask);
        h.producer.tail.store(new_tail, Ordering::SeqCst);
        // Payload writes below must not become visible before the new tail.
        fence(Ordering::Release);

        #[cfg(test)]
        if let Some(hook) = self.after_tail_store.as_mut() {
            hook(&self.region);
        }

        // A reader that attached during the scan either sees the new tail and
        // moves past it, or is caught by this re-scan. Nothing was written
        // into [tail, new_tail) yet, so handing it back keeps it intact for
        // that reader.
        if epoch.load(Ordering::SeqCst) != self.seen_epoch {
            (self.seen_epoch, self.gate) = scan_gate(&self.region, self.options.policy);
            if need > self.gate {
                h.producer.tail.store(tail, Ordering::SeqCst);
                return Err(WriteError::Full);
            }
        }
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lowest cursor among attached readers, with the epoch it was read at.
fn scan_gate(region: &Region, policy: OverflowPolicy) -> (u64, u64) {
    let epoch = region
        .header()
        .lifecycle
        .attach_epoch
        .load(Ordering::SeqCst);
    if policy == OverflowPolicy::Overwrite {
        return (epoch, u64::MAX);
    }
    let gate = (0..MAX_READERS)
        .map(|i| region.reader_slot(i))
        .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_ACTIVE)
        .map(|slot| slot.cursor.load(Ordering::Acquire))
        .min()
        .unwrap_or(u64::MAX);
    (epoch, gate)
}

/// Walk committed slots from `tail` until reaching `need`.
fn reclaim(region: &Region, tail: u64, need: u64, mask: u64) -> u64 {
    let mut pos = tail;
    while pos < need {
        let len = region
            .prefix(position_to_offset(pos, mask))
            .load(Ordering::Relaxed);
        pos = if len == WRAP_MARK {
            next_lap(pos, mask)
        } else {
            pos + slot_len(len as usize)
        };
    }
    pos
}

fn has_space(region: &Region, options: &RingOptions, slot: u64) -> bool {
    let h = region.header();
    if h.state() != 0 {
        return true;
    }
    if options.require_readers && h.lifecycle.reader_count.load(Ordering::Acquire) == 0 {
        return false;
    }
    let head = h.producer.head.load(Ordering::Acquire);
    let need = reclaim_target(place(head, slot, options.capacity).end, options.capacity);
    need <= h.producer.tail.load(Ordering::Acquire) || need <= scan_gate(region, options.policy).1
}

//! Consumer side: shadow mappings and independent reader cursors.
//!
//! A `ShadowRing` maps a segment by name without talking to the producer.
//! Each `RingReader` attached to it claims one reader slot and keeps a private
//! cursor; readers never observe or affect each other.
//!
//! Under the reject policy the cursor is published in the reader slot on
//! every release and gates the producer, so a peeked slot is handed out
//! zero-copy. Under the overwrite policy the producer may reclaim a slot
//! while it is being read, so the reader copies it out and then checks that
//! `tail` has not passed it (the same validate-after-read pattern as a
//! seqlock); if it has, the reader skips forward to `tail` and counts the
//! lost bytes.

use crate::error::{ReadError, ReadStatus, SegmentError};
use crate::region::Region;
use crate::ring::{
    OverflowPolicy, PREFIX_LEN, WRAP_MARK, max_slot, next_lap, position_to_offset, slot_len,
};
use crate::segment::{self, SegmentIdent};
use crate::shm_layout::{MAX_READERS, SLOT_ACTIVE, SLOT_FREE, STATE_EOF, SegmentHeader};
use crate::stats::RingStats;
use crate::wait::{PlatformWaiter, WaitConfig, WaitOutcome, WaitWord};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use tracing::info;

/// Where a new reader starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachPoint {
    /// Only records committed after the attach.
    #[default]
    Head,
    /// The oldest record the producer has not reclaimed.
    Oldest,
    /// A position previously returned by [`RingReader::position`]. Clamped to
    /// the retained range.
    Position(u64),
}

/// A consumer-side mapping of a segment. Cheap to share between readers.
pub struct ShadowRing {
    region: Arc<Region>,
}

impl ShadowRing {
    /// Map an existing segment by name.
    pub fn open(ident: &SegmentIdent) -> Result<Self, SegmentError> {
        let region = segment::map_existing(ident)?;
        if segment::is_destroyed(&region) {
            return Err(SegmentError::Destroyed);
        }
        info!(
            segment = %ident,
            capacity = region.header().capacity(),
            "shadowed ring segment"
        );
        Ok(Self::from_region(Arc::new(region)))
    }

    pub(crate) fn from_region(region: Arc<Region>) -> Self {
        Self { region }
    }

    /// Claim a reader slot and start a private cursor at `at`.
    pub fn attach(&self, at: AttachPoint) -> Result<RingReader, SegmentError> {
        let region = &self.region;
        if segment::is_destroyed(region) {
            return Err(SegmentError::Destroyed);
        }
        let slot_idx = (0..MAX_READERS)
            .find(|&i| {
                region
                    .reader_slot(i)
                    .state
                    .compare_exchange(SLOT_FREE, SLOT_ACTIVE, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            })
            .ok_or(SegmentError::TooManyReaders)?;
        let slot = region.reader_slot(slot_idx);
        slot.pid.store(std::process::id(), Ordering::Relaxed);

        let h = region.header();
        let head = h.producer.head.load(Ordering::Acquire);
        let mut cursor = match at {
            AttachPoint::Head => head,
            AttachPoint::Oldest => h.producer.tail.load(Ordering::Acquire),
            AttachPoint::Position(pos) => pos.min(head),
        };
        slot.cursor.store(cursor, Ordering::SeqCst);
        h.lifecycle.attach_epoch.fetch_add(1, Ordering::SeqCst);
        // Pairs with the producer's tail store and epoch re-check.
        let tail = h.producer.tail.load(Ordering::SeqCst);
        if cursor < tail {
            cursor = tail;
            slot.cursor.store(cursor, Ordering::SeqCst);
        }
        let readers = h.lifecycle.reader_count.fetch_add(1, Ordering::AcqRel) + 1;
        WaitWord::<PlatformWaiter>::new(&h.space_wait.word).wake();

        info!(slot = slot_idx, position = cursor, readers, "reader attached");

        let capacity = h.capacity();
        let policy = OverflowPolicy::from_code(h.policy_code());
        Ok(RingReader {
            region: Arc::clone(region),
            slot: slot_idx,
            policy,
            capacity,
            mask: capacity - 1,
            cursor,
            peeked: None,
            scratch: match policy {
                OverflowPolicy::Overwrite => Vec::with_capacity(max_slot(capacity) as usize),
                OverflowPolicy::Reject => Vec::new(),
            },
            lost_bytes: 0,
            records_read: 0,
            detached: false,
        })
    }

    pub fn stats(&self) -> RingStats {
        RingStats::read(self.region.header())
    }

    pub fn capacity(&self) -> u64 {
        self.region.header().capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_code(self.region.header().policy_code())
    }

    pub fn is_destroyed(&self) -> bool {
        segment::is_destroyed(&self.region)
    }
}

#[derive(Debug, Clone, Copy)]
struct Peeked {
    offset: usize,
    len: usize,
    next: u64,
}

/// One independent cursor over a shadowed ring.
pub struct RingReader {
    region: Arc<Region>,
    slot: usize,
    policy: OverflowPolicy,
    capacity: u64,
    mask: u64,
    /// Next unread position.
    cursor: u64,
    peeked: Option<Peeked>,
    /// Private copy of the peeked payload under the overwrite policy.
    scratch: Vec<u8>,
    lost_bytes: u64,
    records_read: u64,
    detached: bool,
}

impl RingReader {
    /// The payload of the record at the cursor, if one is committed.
    ///
    /// Peeking again before [`release`](Self::release) returns the same
    /// record. `Ok(None)` means no new data; end of stream is reported only
    /// once everything committed before it has been released.
    pub fn peek(&mut self) -> Result<Option<&[u8]>, ReadError> {
        self.check_live()?;
        let peeked = match self.peeked {
            Some(p) => p,
            None => match self.locate()? {
                Some(p) => {
                    self.peeked = Some(p);
                    p
                }
                None => return Ok(None),
            },
        };
        Ok(Some(match self.policy {
            // SAFETY: our published cursor is at or below this slot, so the
            // producer cannot reclaim it until we release.
            OverflowPolicy::Reject => unsafe { self.region.bytes(peeked.offset, peeked.len) },
            OverflowPolicy::Overwrite => &self.scratch[..peeked.len],
        }))
    }

    fn locate(&mut self) -> Result<Option<Peeked>, ReadError> {
        let Self {
            region,
            policy,
            capacity,
            mask,
            cursor,
            scratch,
            lost_bytes,
            ..
        } = self;
        let (capacity, mask) = (*capacity, *mask);
        let overwrite = *policy == OverflowPolicy::Overwrite;
        let h = region.header();

        loop {
            let head = h.producer.head.load(Ordering::Acquire);
            if overwrite {
                let tail = h.producer.tail.load(Ordering::Acquire);
                if *cursor < tail {
                    *lost_bytes += tail - *cursor;
                    *cursor = tail;
                }
            }
            if *cursor >= head {
                if h.state() & STATE_EOF != 0
                    && h.producer.head.load(Ordering::Acquire) <= *cursor
                {
                    return Err(ReadError::EndOfStream);
                }
                return Ok(None);
            }

            let off = position_to_offset(*cursor, mask);
            let len = region.prefix(off).load(Ordering::Acquire);
            if overwrite && lapped(h, *cursor) {
                continue;
            }
            if len == WRAP_MARK {
                *cursor = next_lap(*cursor, mask);
                continue;
            }

            let slot = slot_len(len as usize);
            if slot > max_slot(capacity) || *cursor + slot > head {
                return Err(ReadError::Corrupt { position: *cursor });
            }
            let offset = off + PREFIX_LEN as usize;
            let len = len as usize;
            if overwrite {
                scratch.clear();
                scratch.resize(len, 0);
                region.copy_out(offset, scratch);
                fence(Ordering::Acquire);
                if lapped(h, *cursor) {
                    continue;
                }
            }
            return Ok(Some(Peeked {
                offset,
                len,
                next: *cursor + slot,
            }));
        }
    }

    /// Consume the peeked record and advance the cursor past it.
    pub fn release(&mut self) -> Result<(), ReadError> {
        self.check_live()?;
        let p = self.peeked.take().ok_or(ReadError::NothingPeeked)?;
        self.cursor = p.next;
        let h = self.region.header();
        self.region
            .reader_slot(self.slot)
            .cursor
            .store(self.cursor, Ordering::Release);
        h.lifecycle.records_out.fetch_add(1, Ordering::Relaxed);
        h.lifecycle
            .bytes_out
            .fetch_add(p.len as u64, Ordering::Relaxed);
        self.records_read += 1;
        if self.policy == OverflowPolicy::Reject {
            WaitWord::<PlatformWaiter>::new(&h.space_wait.word).wake();
        }
        Ok(())
    }

    pub fn read_status(&self) -> ReadStatus {
        if self.detached {
            return ReadStatus::Detached;
        }
        if segment::is_destroyed(&self.region) {
            return ReadStatus::Destroyed;
        }
        let h = self.region.header();
        if self.peeked.is_some() || h.producer.head.load(Ordering::Acquire) > self.cursor {
            ReadStatus::Ready
        } else if h.state() & STATE_EOF != 0 {
            ReadStatus::EndOfStream
        } else {
            ReadStatus::Empty
        }
    }

    /// Block until a record may be available, the stream ends, or the
    /// configured timeout elapses.
    pub fn wait_for_data(&self, cfg: &WaitConfig) -> WaitOutcome {
        if self.detached || self.peeked.is_some() {
            return WaitOutcome::Ready;
        }
        let h = self.region.header();
        let cursor = self.cursor;
        WaitWord::<PlatformWaiter>::new(&h.data_wait.word).wait_until(cfg, || {
            h.state() != 0 || h.producer.head.load(Ordering::Acquire) > cursor
        })
    }

    /// Next unread position; usable later as `AttachPoint::Position`.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Bytes skipped because the producer overwrote them before we read them.
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn slot_index(&self) -> usize {
        self.slot
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Give the reader slot back. Idempotent; later calls fail with `Detached`.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.peeked = None;
        let h = self.region.header();
        self.region
            .reader_slot(self.slot)
            .state
            .store(SLOT_FREE, Ordering::Release);
        let readers = h.lifecycle.reader_count.fetch_sub(1, Ordering::AcqRel) - 1;
        // A producer blocked on this reader may proceed now.
        WaitWord::<PlatformWaiter>::new(&h.space_wait.word).wake();
        info!(
            slot = self.slot,
            position = self.cursor,
            records = self.records_read,
            lost_bytes = self.lost_bytes,
            readers,
            "reader detached"
        );
    }

    fn check_live(&self) -> Result<(), ReadError> {
        if self.detached {
            return Err(ReadError::Detached);
        }
        if segment::is_destroyed(&self.region) {
            return Err(ReadError::SegmentDestroyed);
        }
        Ok(())
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.detach();
    }
}

#[inline]
fn lapped(h: &SegmentHeader, cursor: u64) -> bool {
    h.producer.tail.load(Ordering::Acquire) > cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingOptions;
    use crate::writer::RingBuffer;

    fn push(ring: &mut RingBuffer, fill: u8, len: usize) {
        ring.reserve(len).unwrap().fill(fill);
        ring.commit().unwrap();
    }

    fn first_byte(reader: &mut RingReader) -> Option<u8> {
        let b = reader.peek().unwrap().map(|b| b[0]);
        if b.is_some() {
            reader.release().unwrap();
        }
        b
    }

    #[test]
    fn attach_points_choose_the_start() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let shadow = ring.shadow();
        let mut early = shadow.attach(AttachPoint::Head).unwrap();
        push(&mut ring, 1, 8);
        push(&mut ring, 2, 8);

        let mut head = shadow.attach(AttachPoint::Head).unwrap();
        let mut oldest = shadow.attach(AttachPoint::Oldest).unwrap();
        let mut mid = shadow.attach(AttachPoint::Position(16)).unwrap();
        push(&mut ring, 3, 8);

        assert_eq!(first_byte(&mut early), Some(1));
        assert_eq!(first_byte(&mut head), Some(3));
        assert_eq!(first_byte(&mut oldest), Some(1));
        assert_eq!(first_byte(&mut mid), Some(2));
        assert_eq!(shadow.stats().readers, 4);
    }

    #[test]
    fn repeek_returns_the_same_record() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let mut reader = ring.shadow().attach(AttachPoint::Head).unwrap();
        push(&mut ring, 7, 12);
        push(&mut ring, 8, 12);

        assert_eq!(reader.peek().unwrap(), Some(&[7u8; 12][..]));
        assert_eq!(reader.peek().unwrap(), Some(&[7u8; 12][..]));
        reader.release().unwrap();
        assert_eq!(reader.peek().unwrap(), Some(&[8u8; 12][..]));
        reader.release().unwrap();
        assert!(matches!(reader.release(), Err(ReadError::NothingPeeked)));
        assert_eq!(reader.records_read(), 2);
        assert_eq!(reader.read_status(), ReadStatus::Empty);
    }

    #[test]
    fn readers_follow_wrapped_slots() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(256)).unwrap();
        let mut reader = ring.shadow().attach(AttachPoint::Head).unwrap();
        for i in 0..40u8 {
            push(&mut ring, i, 8 + (i as usize % 5) * 16);
            assert_eq!(first_byte(&mut reader), Some(i));
        }
        assert_eq!(reader.lost_bytes(), 0);
    }

    #[test]
    fn slot_table_has_a_fixed_size() {
        let ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let shadow = ring.shadow();
        let mut readers: Vec<_> = (0..MAX_READERS)
            .map(|_| shadow.attach(AttachPoint::Head).unwrap())
            .collect();
        assert!(matches!(
            shadow.attach(AttachPoint::Head),
            Err(SegmentError::TooManyReaders)
        ));

        readers[3].detach();
        let again = shadow.attach(AttachPoint::Head).unwrap();
        assert_eq!(again.slot_index(), 3);
    }

    #[test]
    fn detach_is_idempotent_and_terminal() {
        let ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let shadow = ring.shadow();
        let mut reader = shadow.attach(AttachPoint::Head).unwrap();
        reader.detach();
        reader.detach();
        assert_eq!(shadow.stats().readers, 0);
        assert!(matches!(reader.peek(), Err(ReadError::Detached)));
        assert_eq!(reader.read_status(), ReadStatus::Detached);
    }

    #[test]
    fn overwritten_reader_skips_to_tail_and_counts_loss() {
        let opts = RingOptions::new(256).with_policy(OverflowPolicy::Overwrite);
        let mut ring = RingBuffer::in_memory(opts).unwrap();
        let mut reader = ring.shadow().attach(AttachPoint::Head).unwrap();
        for i in 0..10u8 {
            push(&mut ring, i, 56);
        }
        assert_eq!(ring.stats().overflows, 0);

        // 64-byte slots: only the last three survive in a 256-byte ring.
        assert_eq!(first_byte(&mut reader), Some(7));
        assert_eq!(reader.lost_bytes(), 7 * 64);
        assert_eq!(first_byte(&mut reader), Some(8));
        assert_eq!(first_byte(&mut reader), Some(9));
        assert_eq!(first_byte(&mut reader), None);
    }

    #[test]
    fn end_of_stream_after_drain() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let mut reader = ring.shadow().attach(AttachPoint::Head).unwrap();
        push(&mut ring, 1, 8);
        ring.signal_end_of_stream();

        assert_eq!(reader.read_status(), ReadStatus::Ready);
        assert_eq!(first_byte(&mut reader), Some(1));
        assert!(matches!(reader.peek(), Err(ReadError::EndOfStream)));
        assert!(matches!(reader.peek(), Err(ReadError::EndOfStream)));
        assert_eq!(reader.read_status(), ReadStatus::EndOfStream);
    }

    #[test]
    fn destroyed_segment_dominates_end_of_stream() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let shadow = ring.shadow();
        let mut reader = shadow.attach(AttachPoint::Head).unwrap();
        push(&mut ring, 1, 8);
        ring.signal_end_of_stream();
        ring.close();

        assert!(matches!(reader.peek(), Err(ReadError::SegmentDestroyed)));
        assert!(matches!(reader.release(), Err(ReadError::SegmentDestroyed)));
        assert_eq!(reader.read_status(), ReadStatus::Destroyed);
        assert!(matches!(
            shadow.attach(AttachPoint::Head),
            Err(SegmentError::Destroyed)
        ));
    }

    #[test]
    fn blocked_reader_wakes_on_commit() {
        let mut ring = RingBuffer::in_memory(RingOptions::new(1024)).unwrap();
        let mut reader = ring.shadow().attach(AttachPoint::Head).unwrap();

        let consumer = std::thread::spawn(move || {
            let cfg = WaitConfig {
                spin_count: 0,
                timeout: Some(std::time::Duration::from_secs(5)),
                low_latency: false,
            };
            assert_eq!(reader.wait_for_data(&cfg), WaitOutcome::Ready);
            first_byte(&mut reader)
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        push(&mut ring, 42, 8);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }
}

//! Shared memory layout of a ring segment.
//!
//! The layout is versioned and host-local: every field is a fixed-width
//! atomic in host byte order, so any process on the same machine can map the
//! segment and read it without a codec. Record payloads carried inside the
//! data area use their own explicit little-endian framing (see `frame`).
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ SegmentHeader (5 cache lines)                                    │
//! │  line 0  identity   magic | version | policy | capacity | ...    │
//! │  line 1  producer   head | tail | records_in | bytes_in | ovf    │
//! │  line 2  lifecycle  open_count | state | readers | epoch | out   │
//! │  line 3  data WaitWord   (readers sleep here)                    │
//! │  line 4  space WaitWord  (writer sleeps here)                    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ ReaderSlot[0..MAX_READERS]   state | pid | cursor   (1 line each)│
//! ├──────────────────────────────────────────────────────────────────┤
//! │ data area: `capacity` bytes of slots                             │
//! │   slot = prefix(len u32, reserved u32) | payload | pad to 8      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `head`, `tail` and reader cursors are absolute byte positions that only
//! grow; the physical offset is `position & (capacity - 1)`.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic number identifying a ring segment: ASCII "LITHOSRB".
pub const RING_MAGIC: u64 = 0x4C49_5448_4F53_5242;

/// Layout version. Bump on any incompatible change to this file.
pub const RING_VERSION: u32 = 2;

/// Number of reader slots in every segment.
pub const MAX_READERS: usize = 32;

/// Lifecycle state bits (`LifecycleLine::state`).
pub const STATE_EOF: u32 = 1;
pub const STATE_DESTROYED: u32 = 1 << 1;

/// Reader slot states.
pub const SLOT_FREE: u32 = 0;
pub const SLOT_ACTIVE: u32 = 1;

/// Policy codes stored in the identity line.
pub const POLICY_REJECT: u32 = 0;
pub const POLICY_OVERWRITE: u32 = 1;

const CACHE_LINE: usize = 64;

/// Immutable after initialisation. `magic` is stored last with release
/// ordering, so a reader that sees the magic sees every other field.
#[repr(C, align(64))]
pub struct IdentityLine {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub policy: AtomicU32,
    pub capacity: AtomicU64,
    pub data_offset: AtomicU64,
    pub segment_len: AtomicU64,
    pub max_readers: AtomicU32,
}

/// Written only by the producer.
#[repr(C, align(64))]
pub struct ProducerLine {
    /// End of the last committed slot.
    pub head: AtomicU64,
    /// Oldest position the producer has not reclaimed.
    pub tail: AtomicU64,
    pub records_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub overflows: AtomicU64,
}

#[repr(C, align(64))]
pub struct LifecycleLine {
    /// Live producer-side handles.
    pub open_count: AtomicU32,
    pub state: AtomicU32,
    /// Attached readers across all processes.
    pub reader_count: AtomicU32,
    /// Bumped on every attach so the producer knows to re-scan reader slots.
    pub attach_epoch: AtomicU64,
    pub records_out: AtomicU64,
    pub bytes_out: AtomicU64,
}

#[repr(C, align(64))]
pub struct WaitLine {
    pub word: AtomicU32,
}

#[repr(C)]
pub struct SegmentHeader {
    pub identity: IdentityLine,
    pub producer: ProducerLine,
    pub lifecycle: LifecycleLine,
    pub data_wait: WaitLine,
    pub space_wait: WaitLine,
}

/// One per attached reader. The cursor is the reader's release position; the
/// producer only looks at it under the reject policy.
#[repr(C, align(64))]
pub struct ReaderSlot {
    pub state: AtomicU32,
    pub pid: AtomicU32,
    pub cursor: AtomicU64,
}

const _: () = assert!(size_of::<SegmentHeader>() == 5 * CACHE_LINE);
const _: () = assert!(size_of::<ReaderSlot>() == CACHE_LINE);

/// Byte offset of the reader slot table.
pub const READERS_OFFSET: usize = size_of::<SegmentHeader>();

/// Byte offset of the data area. Cache-line aligned.
pub const DATA_OFFSET: usize = READERS_OFFSET + MAX_READERS * size_of::<ReaderSlot>();

const _: () = assert!(DATA_OFFSET % CACHE_LINE == 0);

/// Total bytes required for a segment with a data area of `capacity` bytes.
pub fn bytes_for_segment(capacity: usize) -> usize {
    DATA_OFFSET + capacity
}

/// Reasons a mapped region does not hold a usable ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutFault {
    #[error("header not initialised")]
    Uninitialised,
    #[error("bad magic, not a ring segment")]
    BadMagic,
    #[error("layout version {0}, expected {RING_VERSION}")]
    Version(u32),
    #[error("capacity {0} is not a power of two")]
    Capacity(u64),
    #[error("segment has {0} reader slots, expected {MAX_READERS}")]
    Readers(u32),
    #[error("unknown overflow policy code {0}")]
    Policy(u32),
    #[error("segment needs {needed} bytes, mapping has {actual}")]
    Length { needed: u64, actual: u64 },
}

impl SegmentHeader {
    /// Checks the identity line against what this build expects.
    ///
    /// `mapped_len` is the length of the mapping the header was read from.
    pub fn validate(&self, mapped_len: usize) -> Result<(), LayoutFault> {
        let id = &self.identity;
        match id.magic.load(Ordering::Acquire) {
            0 => return Err(LayoutFault::Uninitialised),
            RING_MAGIC => {}
            _ => return Err(LayoutFault::BadMagic),
        }
        let version = id.version.load(Ordering::Relaxed);
        if version != RING_VERSION {
            return Err(LayoutFault::Version(version));
        }
        let capacity = id.capacity.load(Ordering::Relaxed);
        if !capacity.is_power_of_two() {
            return Err(LayoutFault::Capacity(capacity));
        }
        let readers = id.max_readers.load(Ordering::Relaxed);
        if readers as usize != MAX_READERS {
            return Err(LayoutFault::Readers(readers));
        }
        let policy = id.policy.load(Ordering::Relaxed);
        if policy != POLICY_REJECT && policy != POLICY_OVERWRITE {
            return Err(LayoutFault::Policy(policy));
        }
        let needed = DATA_OFFSET as u64 + capacity;
        let declared = id.segment_len.load(Ordering::Relaxed);
        if id.data_offset.load(Ordering::Relaxed) != DATA_OFFSET as u64
            || declared != needed
            || (mapped_len as u64) < needed
        {
            return Err(LayoutFault::Length {
                needed,
                actual: mapped_len as u64,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.identity.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn policy_code(&self) -> u32 {
        self.identity.policy.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.lifecycle.state.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn hot_fields_sit_on_separate_lines() {
        assert_eq!(offset_of!(SegmentHeader, identity), 0);
        assert_eq!(offset_of!(SegmentHeader, producer), 64);
        assert_eq!(offset_of!(SegmentHeader, lifecycle), 128);
        assert_eq!(offset_of!(SegmentHeader, data_wait), 192);
        assert_eq!(offset_of!(SegmentHeader, space_wait), 256);
        assert_eq!(align_of::<ReaderSlot>(), 64);
    }

    #[test]
    fn segment_size_covers_header_slots_and_data() {
        assert_eq!(DATA_OFFSET, 320 + 32 * 64);
        assert_eq!(bytes_for_segment(8192), DATA_OFFSET + 8192);
    }
}

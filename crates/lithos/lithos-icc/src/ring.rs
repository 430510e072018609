//! Ring options and slot arithmetic.
//!
//! Positions (`head`, `tail`, reader cursors) are absolute byte counts that
//! only grow. A slot never straddles the physical end of the data area: when
//! it would, the producer writes a wrap marker and the slot starts at the
//! next multiple of the capacity instead.

use crate::error::SegmentError;
use crate::shm_layout::{POLICY_OVERWRITE, POLICY_REJECT};
use lithos_config::{OverflowMode, TransportConfig};

/// Slot alignment. Every slot start and length is a multiple of this.
pub const ALIGN: u64 = 8;

/// Length prefix: `u32` payload length + `u32` reserved.
pub const PREFIX_LEN: u64 = 8;

/// Prefix value marking the rest of the physical buffer as padding.
pub const WRAP_MARK: u32 = u32::MAX;

pub const MIN_CAPACITY: u64 = 64;

/// Payload lengths must stay below the wrap marker in a `u32` prefix.
pub const MAX_CAPACITY: u64 = 1 << 32;

/// What the producer does when the slowest reader has not released space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the reservation with `Full`. Readers are never overrun.
    #[default]
    Reject,
    /// Reclaim the oldest records anyway. Slow readers lose data.
    Overwrite,
}

impl OverflowPolicy {
    pub(crate) fn code(self) -> u32 {
        match self {
            Self::Reject => POLICY_REJECT,
            Self::Overwrite => POLICY_OVERWRITE,
        }
    }

    pub(crate) fn from_code(code: u32) -> Self {
        if code == POLICY_OVERWRITE {
            Self::Overwrite
        } else {
            Self::Reject
        }
    }
}

impl From<OverflowMode> for OverflowPolicy {
    fn from(mode: OverflowMode) -> Self {
        match mode {
            OverflowMode::Reject => Self::Reject,
            OverflowMode::Overwrite => Self::Overwrite,
        }
    }
}

/// Producer-side construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOptions {
    /// Data area size in bytes. Power of two, at least [`MIN_CAPACITY`].
    pub capacity: u64,
    pub policy: OverflowPolicy,
    /// Fail reservations with `NoReaders` while nobody is attached.
    pub require_readers: bool,
}

impl RingOptions {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            policy: OverflowPolicy::Reject,
            require_readers: false,
        }
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_require_readers(mut self, require: bool) -> Self {
        self.require_readers = require;
        self
    }

    pub fn validate(&self) -> Result<(), SegmentError> {
        if !self.capacity.is_power_of_two()
            || !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.capacity)
        {
            return Err(SegmentError::InvalidCapacity(self.capacity));
        }
        if usize::try_from(self.capacity).is_err() {
            return Err(SegmentError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn mask(&self) -> u64 {
        self.capacity - 1
    }

    /// Largest slot, prefix and padding included.
    #[inline]
    pub fn max_slot(&self) -> u64 {
        max_slot(self.capacity)
    }

    /// Largest payload a single reservation can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        (self.max_slot() - PREFIX_LEN) as usize
    }
}

impl From<&TransportConfig> for RingOptions {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            capacity: cfg.capacity as u64,
            policy: cfg.overflow_policy.into(),
            require_readers: cfg.require_readers,
        }
    }
}

/// Half the data area. With this cap a wrapping slot plus its trailing
/// padding always fits in a drained ring.
#[inline]
pub fn max_slot(capacity: u64) -> u64 {
    capacity / 2
}

/// Total slot size for a payload of `payload` bytes.
#[inline(always)]
pub fn slot_len(payload: usize) -> u64 {
    PREFIX_LEN + (payload as u64).next_multiple_of(ALIGN)
}

#[inline(always)]
pub fn position_to_offset(pos: u64, mask: u64) -> usize {
    (pos & mask) as usize
}

/// First position of the lap after `pos`.
#[inline(always)]
pub fn next_lap(pos: u64, mask: u64) -> u64 {
    (pos | mask) + 1
}

/// Where a slot of `slot` bytes lands when written at `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Position of the slot prefix.
    pub start: u64,
    /// Position just past the slot; the next `head`.
    pub end: u64,
    /// Position of the wrap marker, when the slot skips the physical end.
    pub wrap_at: Option<u64>,
}

#[inline]
pub(crate) fn place(head: u64, slot: u64, capacity: u64) -> Placement {
    let off = head & (capacity - 1);
    if off + slot <= capacity {
        Placement {
            start: head,
            end: head + slot,
            wrap_at: None,
        }
    } else {
        let start = head + (capacity - off);
        Placement {
            start,
            end: start + slot,
            wrap_at: Some(head),
        }
    }
}

/// Lowest `tail` that leaves room for a slot ending at `end` while keeping
/// one alignment unit free.
#[inline(always)]
pub(crate) fn reclaim_target(end: u64, capacity: u64) -> u64 {
    (end + ALIGN).saturating_sub(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_prefixed_and_padded() {
        assert_eq!(slot_len(0), 8);
        assert_eq!(slot_len(1), 16);
        assert_eq!(slot_len(8), 16);
        assert_eq!(slot_len(64), 72);
        assert_eq!(slot_len(192), 200);
    }

    #[test]
    fn placement_skips_the_physical_end() {
        // 1024-byte ring, head 40 bytes short of the end.
        let p = place(2048 + 984, 72, 1024);
        assert_eq!(p.wrap_at, Some(3032));
        assert_eq!(p.start, 3072);
        assert_eq!(p.end, 3144);

        let exact = place(984, 40, 1024);
        assert_eq!(exact.wrap_at, None);
        assert_eq!(exact.end, 1024);
    }

    #[test]
    fn wrapped_slot_never_needs_unwritten_space() {
        // For every head offset and legal slot size, a wrapping placement
        // reclaims only up to positions that were already written.
        let cap = 256;
        for off in (0..cap).step_by(8) {
            let mut slot = 8;
            while slot <= max_slot(cap) {
                let head = 10 * cap + off;
                let p = place(head, slot, cap);
                assert!(reclaim_target(p.end, cap) <= head, "off {off} slot {slot}");
                slot += 8;
            }
        }
    }

    #[test]
    fn options_validate_capacity() {
        assert!(RingOptions::new(1024).validate().is_ok());
        assert!(RingOptions::new(1000).validate().is_err());
        assert!(RingOptions::new(32).validate().is_err());
        assert_eq!(RingOptions::new(1024).max_payload(), 504);
    }

    #[test]
    fn lap_and_offset_helpers() {
        assert_eq!(position_to_offset(1030, 1023), 6);
        assert_eq!(next_lap(1030, 1023), 2048);
        assert_eq!(next_lap(1024, 1023), 2048);
    }

    #[test]
    fn options_follow_config_bundle() {
        let cfg = TransportConfig {
            capacity: 4096,
            overflow_policy: OverflowMode::Overwrite,
            require_readers: true,
            ..TransportConfig::default()
        };
        let opts = RingOptions::from(&cfg);
        assert_eq!(opts.capacity, 4096);
        assert_eq!(opts.policy, OverflowPolicy::Overwrite);
        assert!(opts.require_readers);
    }
}

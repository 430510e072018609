//! Record framing inside a ring slot.
//!
//! ```text
//! 0        8        12       16     18     20       24         (32)
//! ┌────────┬────────┬────────┬──────┬──────┬────────┬──────────┬─────────┐
//! │ seq_no │ delta  │ length │ type │ flags│ part.  │ [time]   │ payload │
//! │ u64    │ u32    │ u32    │ u16  │ u16  │ u32    │ u64 opt. │         │
//! └────────┴────────┴────────┴──────┴──────┴────────┴──────────┴─────────┘
//! ```
//!
//! All fields little-endian. `delta` is nanoseconds since the previous record
//! of the same producer. When it does not fit in 32 bits, or the record is an
//! anchor, the `WIDE_TIME` flag is set and the 64-bit time field follows the
//! header: a delta, or with `ANCHOR` an absolute time in ns since the epoch.

use std::fmt;

pub const HEADER_LEN: usize = 24;
pub const TIME_LEN: usize = 8;

pub mod flags {
    /// A 64-bit time field follows the header.
    pub const WIDE_TIME: u16 = 1;
    /// The time field is absolute, not a delta.
    pub const ANCHOR: u16 = 1 << 1;
    /// The partition tag is meaningful.
    pub const PARTITION: u16 = 1 << 2;

    pub const ALL: u16 = WIDE_TIME | ANCHOR | PARTITION;
}

/// Application-defined record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    /// Reserved for producer heartbeats.
    pub const HEARTBEAT: RecordType = RecordType(0xFFFF);

    pub fn is_heartbeat(self) -> bool {
        self == Self::HEARTBEAT
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_heartbeat() {
            f.write_str("heartbeat")
        } else {
            write!(f, "type#{}", self.0)
        }
    }
}

/// How the record carries its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTime {
    /// Nanoseconds since the previous record.
    Delta(u64),
    /// Nanoseconds since the Unix epoch.
    Anchor(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq_no: u64,
    pub record_type: RecordType,
    pub partition: Option<u32>,
    pub time: FrameTime,
    pub length: u32,
}

impl FrameHeader {
    fn is_wide(&self) -> bool {
        match self.time {
            FrameTime::Anchor(_) => true,
            FrameTime::Delta(d) => d > u32::MAX as u64,
        }
    }

    /// Bytes in front of the payload.
    pub fn encoded_len(&self) -> usize {
        if self.is_wide() {
            HEADER_LEN + TIME_LEN
        } else {
            HEADER_LEN
        }
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        self.encoded_len() + self.length as usize
    }

    /// Write the header into the front of `buf` and return the payload area.
    ///
    /// # Panics
    /// If `buf` is shorter than [`frame_len`](Self::frame_len).
    pub fn encode_into<'b>(&self, buf: &'b mut [u8]) -> &'b mut [u8] {
        let mut f = 0u16;
        let (delta, wide) = match self.time {
            FrameTime::Anchor(t) => {
                f |= flags::WIDE_TIME | flags::ANCHOR;
                (0u32, Some(t))
            }
            FrameTime::Delta(d) => match u32::try_from(d) {
                Ok(d) => (d, None),
                Err(_) => {
                    f |= flags::WIDE_TIME;
                    (0, Some(d))
                }
            },
        };
        if self.partition.is_some() {
            f |= flags::PARTITION;
        }

        buf[0..8].copy_from_slice(&self.seq_no.to_le_bytes());
        buf[8..12].copy_from_slice(&delta.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..18].copy_from_slice(&self.record_type.0.to_le_bytes());
        buf[18..20].copy_from_slice(&f.to_le_bytes());
        buf[20..24].copy_from_slice(&self.partition.unwrap_or(0).to_le_bytes());
        let mut at = HEADER_LEN;
        if let Some(t) = wide {
            buf[at..at + TIME_LEN].copy_from_slice(&t.to_le_bytes());
            at += TIME_LEN;
        }
        &mut buf[at..at + self.length as usize]
    }
}

/// A decoded record borrowing its payload from the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {actual} bytes is shorter than its {needed}-byte header")]
    Truncated { needed: usize, actual: usize },
    #[error("header declares {declared} payload bytes, slot carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("unknown flag bits {0:#06x}")]
    UnknownFlags(u16),
    #[error("anchor without a time field")]
    AnchorWithoutTime,
}

/// Decode one slot. The slot must hold exactly one frame.
pub fn decode(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN,
            actual: buf.len(),
        });
    }
    let seq_no = u64::from_le_bytes(le(&buf[0..8]));
    let delta = u32::from_le_bytes(le(&buf[8..12]));
    let length = u32::from_le_bytes(le(&buf[12..16]));
    let record_type = RecordType(u16::from_le_bytes(le(&buf[16..18])));
    let f = u16::from_le_bytes(le(&buf[18..20]));
    let partition = u32::from_le_bytes(le(&buf[20..24]));

    if f & !flags::ALL != 0 {
        return Err(FrameError::UnknownFlags(f & !flags::ALL));
    }
    let mut at = HEADER_LEN;
    let time = if f & flags::WIDE_TIME != 0 {
        if buf.len() < HEADER_LEN + TIME_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN + TIME_LEN,
                actual: buf.len(),
            });
        }
        let t = u64::from_le_bytes(le(&buf[at..at + TIME_LEN]));
        at += TIME_LEN;
        if f & flags::ANCHOR != 0 {
            FrameTime::Anchor(t)
        } else {
            FrameTime::Delta(t)
        }
    } else if f & flags::ANCHOR != 0 {
        return Err(FrameError::AnchorWithoutTime);
    } else {
        FrameTime::Delta(delta as u64)
    };

    let payload = &buf[at..];
    if payload.len() != length as usize {
        return Err(FrameError::LengthMismatch {
            declared: length,
            actual: payload.len(),
        });
    }
    Ok(Frame {
        header: FrameHeader {
            seq_no,
            record_type,
            partition: (f & flags::PARTITION != 0).then_some(partition),
            time,
            length,
        },
        payload,
    })
}

#[inline(always)]
fn le<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(time: FrameTime, partition: Option<u32>, length: u32) -> FrameHeader {
        FrameHeader {
            seq_no: 77,
            record_type: RecordType(2),
            partition,
            time,
            length,
        }
    }

    #[test]
    fn byte_layout_is_little_endian() {
        let h = header(FrameTime::Delta(0x0102_0304), Some(9), 3);
        let mut buf = vec![0u8; h.frame_len()];
        h.encode_into(&mut buf).copy_from_slice(b"abc");
        assert_eq!(buf.len(), 27);
        assert_eq!(&buf[0..8], &77u64.to_le_bytes());
        assert_eq!(&buf[8..12], &[4, 3, 2, 1]);
        assert_eq!(&buf[16..18], &[2, 0]);
        assert_eq!(&buf[18..20], &[flags::PARTITION as u8, 0]);
        assert_eq!(&buf[24..], b"abc");

        let frame = decode(&buf).unwrap();
        assert_eq!(frame.header, h);
        assert_eq!(frame.payload, b"abc");
    }

    #[test]
    fn anchors_and_long_deltas_use_the_wide_field() {
        let anchor = header(FrameTime::Anchor(1_700_000_000_000_000_000), None, 0);
        assert_eq!(anchor.encoded_len(), 32);
        let mut buf = vec![0u8; anchor.frame_len()];
        anchor.encode_into(&mut buf);
        assert_eq!(decode(&buf).unwrap().header, anchor);

        let long = header(FrameTime::Delta(5_000_000_000), None, 0);
        assert_eq!(long.encoded_len(), 32);
        let mut buf = vec![0u8; long.frame_len()];
        long.encode_into(&mut buf);
        assert_eq!(decode(&buf).unwrap().header.time, FrameTime::Delta(5_000_000_000));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            decode(&[0u8; 10]),
            Err(FrameError::Truncated { needed: 24, .. })
        ));

        let h = header(FrameTime::Delta(1), None, 4);
        let mut buf = vec![0u8; h.frame_len()];
        h.encode_into(&mut buf);
        assert!(matches!(
            decode(&buf[..26]),
            Err(FrameError::LengthMismatch { declared: 4, actual: 2 })
        ));

        buf[18] = 0x80;
        assert_eq!(decode(&buf), Err(FrameError::UnknownFlags(0x80)));

        buf[18] = flags::ANCHOR as u8;
        assert_eq!(decode(&buf), Err(FrameError::AnchorWithoutTime));
    }

    #[test]
    fn heartbeat_type_is_reserved() {
        assert!(RecordType::HEARTBEAT.is_heartbeat());
        assert!(!RecordType(1).is_heartbeat());
        assert_eq!(RecordType::HEARTBEAT.to_string(), "heartbeat");
    }
}

use crate::frame::FrameError;
use crate::shm_layout::{LayoutFault, MAX_READERS};
use std::io;

/// Failures to create, map or join a segment. Fatal to the call that hit them.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("segment {name}: {fault}")]
    Layout { name: String, fault: LayoutFault },

    #[error("segment {name} was never initialised by its creator")]
    NotInitialized { name: String },

    #[error("capacity {0} must be a power of two between 64 bytes and 4 GiB")]
    InvalidCapacity(u64),

    #[error("segment {name} has capacity {existing}, requested {requested}")]
    CapacityMismatch {
        name: String,
        existing: u64,
        requested: u64,
    },

    #[error("segment {name} was created with a different overflow policy")]
    PolicyMismatch { name: String },

    #[error("segment has been destroyed by its last producer")]
    Destroyed,

    #[error("all {MAX_READERS} reader slots are taken")]
    TooManyReaders,
}

impl SegmentError {
    pub(crate) fn io(name: &str, source: io::Error) -> Self {
        Self::Io {
            name: name.to_owned(),
            source,
        }
    }

    /// The underlying I/O error kind, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Why a reservation or commit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Transient: readers have not released enough space yet.
    #[error("ring is full")]
    Full,
    /// No reader is attached and the handle requires one.
    #[error("no reader attached")]
    NoReaders,
    /// End of stream was signalled; the ring accepts no more records.
    #[error("stream closed")]
    Closed,
    #[error("segment destroyed")]
    Destroyed,
    #[error("slot of {requested} bytes exceeds the maximum of {max}")]
    TooLarge { requested: usize, max: usize },
    #[error("commit without a pending reservation")]
    NoReservation,
}

/// Producer-side condition, polled after a failed reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ready,
    Full,
    NoReaders,
    Closed,
    Destroyed,
}

/// Terminal or caller errors on the read side. "No data yet" is `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("end of stream")]
    EndOfStream,
    #[error("reader is detached")]
    Detached,
    #[error("segment destroyed")]
    SegmentDestroyed,
    #[error("corrupt slot at position {position}")]
    Corrupt { position: u64 },
    #[error("malformed record at position {position}: {source}")]
    Malformed {
        position: u64,
        #[source]
        source: FrameError,
    },
    #[error("release without a peeked record")]
    NothingPeeked,
}

/// Consumer-side condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A record is waiting at the cursor.
    Ready,
    Empty,
    EndOfStream,
    Detached,
    Destroyed,
}

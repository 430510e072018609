use crate::shm_layout::{STATE_DESTROYED, STATE_EOF, SegmentHeader};
use std::sync::atomic::Ordering;

/// Point-in-time counters of a segment, for an external telemetry poller.
///
/// Fields are read one by one with relaxed loads, so a snapshot taken while
/// the producer is active may be slightly inconsistent across fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub capacity: u64,
    pub head: u64,
    pub tail: u64,
    /// Bytes between `tail` and `head`, wrap padding included.
    pub fill: u64,
    pub records_in: u64,
    pub bytes_in: u64,
    pub records_out: u64,
    pub bytes_out: u64,
    pub overflows: u64,
    pub readers: u32,
    pub open_count: u32,
    pub end_of_stream: bool,
    pub destroyed: bool,
}

impl RingStats {
    pub(crate) fn read(h: &SegmentHeader) -> Self {
        let p = &h.producer;
        let lc = &h.lifecycle;
        let head = p.head.load(Ordering::Relaxed);
        let tail = p.tail.load(Ordering::Relaxed);
        let state = lc.state.load(Ordering::Relaxed);
        Self {
            capacity: h.capacity(),
            head,
            tail,
            fill: head.saturating_sub(tail),
            records_in: p.records_in.load(Ordering::Relaxed),
            bytes_in: p.bytes_in.load(Ordering::Relaxed),
            records_out: lc.records_out.load(Ordering::Relaxed),
            bytes_out: lc.bytes_out.load(Ordering::Relaxed),
            overflows: p.overflows.load(Ordering::Relaxed),
            readers: lc.reader_count.load(Ordering::Relaxed),
            open_count: lc.open_count.load(Ordering::Relaxed),
            end_of_stream: state & STATE_EOF != 0,
            destroyed: state & STATE_DESTROYED != 0,
        }
    }

    /// Fill level as a fraction of capacity.
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.fill as f64 / self.capacity as f64
    }
}

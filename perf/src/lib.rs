use lithos_events::{SymbolId, TopOfBook};
use lithos_icc::{
    AttachPoint, ChannelConfig, ChannelPublisher, ChannelSubscriber, Clock, MonotonicClock,
    RingBuffer, RingOptions, RingReader, SegmentIdent, ShmNamespace, SystemClock,
};

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Stats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: usize,
}

pub fn compute_stats(samples: &mut [u64]) -> Stats {
    assert!(!samples.is_empty(), "cannot compute stats on empty samples");
    samples.sort_unstable();

    let count = samples.len();
    let sum: u64 = samples.iter().sum();
    Stats {
        min: samples[0],
        max: samples[count - 1],
        mean: sum as f64 / count as f64,
        p50: percentile_sorted(samples, 50.0),
        p90: percentile_sorted(samples, 90.0),
        p99: percentile_sorted(samples, 99.0),
        p999: percentile_sorted(samples, 99.9),
        count,
    }
}

fn percentile_sorted(sorted: &[u64], pct: f64) -> u64 {
    let len = sorted.len();
    if len == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}

pub fn print_stats(name: &str, unit: &str, s: &Stats) {
    println!(
        "  {:<32} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {unit} (n={})",
        name, s.min, s.p50, s.p90, s.p99, s.p999, s.max, s.count,
    );
}

pub fn print_stats_header() {
    println!(
        "  {:<32} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "Benchmark", "min", "p50", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(90));
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

/// A per-process segment name in the host's shared-memory namespace.
pub fn temp_segment(label: &str) -> SegmentIdent {
    SegmentIdent::new(
        ShmNamespace::system(),
        format!("lithos_bench_{label}_{}", std::process::id()),
    )
}

pub fn make_test_tob() -> TopOfBook {
    TopOfBook {
        ts_event_ns: MonotonicClock.now_ns(),
        symbol_id: SymbolId(1),
        bid_px_ticks: 1_234_567,
        bid_qty_lots: 1_500,
        ask_px_ticks: 1_234_568,
        ask_qty_lots: 2_300,
    }
}

/// Heap-backed ring with one reader attached at the head.
///
/// # Panics
/// If `options` are invalid.
pub fn ring_pair(options: RingOptions) -> (RingBuffer, RingReader) {
    let ring = RingBuffer::in_memory(options).expect("valid ring options");
    let reader = ring
        .shadow()
        .attach(AttachPoint::Head)
        .expect("free reader slot");
    (ring, reader)
}

pub fn channel_pair(
    options: RingOptions,
) -> (ChannelPublisher<SystemClock>, ChannelSubscriber<MonotonicClock>) {
    let (ring, reader) = ring_pair(options);
    let cfg = ChannelConfig::default();
    (
        ChannelPublisher::new(ring, cfg, SystemClock),
        ChannelSubscriber::new(reader, cfg),
    )
}

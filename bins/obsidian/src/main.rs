//! Synthetic market data producer.
//!
//! ```text
//! obsidian [config.toml] [event-count]
//! ```
//!
//! Publishes `TopOfBook` updates on the configured segment and keeps a
//! heartbeat running while it does. Without an event count it runs until the
//! segment is destroyed underneath it.

use anyhow::{Context, bail};
use lithos_config::TransportConfig;
use lithos_events::{EventKind, SymbolId, TopOfBook};
use lithos_icc::{
    ChannelConfig, ChannelPublisher, Clock, OpenMode, PublishError, RecordType, RingBuffer,
    RingOptions, Scheduler, SegmentIdent, SystemClock, ThreadScheduler, spawn_heartbeat,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const TOP_OF_BOOK: RecordType = RecordType(EventKind::TopOfBook.code());

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let cfg = match args.next() {
        Some(path) => {
            TransportConfig::load(path.clone()).with_context(|| format!("loading {path}"))?
        }
        None => TransportConfig::default(),
    };
    let limit: Option<u64> = args
        .next()
        .map(|n| n.parse().context("event count must be an integer"))
        .transpose()?;
    init_tracing(&cfg.log_level);

    let ident = SegmentIdent::from_config(&cfg);
    let ring = RingBuffer::open(&ident, OpenMode::CreateOrOpen, RingOptions::from(&cfg))
        .with_context(|| format!("opening {ident}"))?;
    info!(
        segment = %ident,
        capacity = cfg.capacity,
        policy = ?cfg.overflow_policy,
        max_payload = ring.max_payload(),
        "obsidian publishing TopOfBook"
    );

    let channel = ChannelConfig::from(&cfg);
    let publisher = Arc::new(Mutex::new(ChannelPublisher::new(ring, channel, SystemClock)));
    let scheduler = ThreadScheduler::new();
    let heartbeat = spawn_heartbeat(&scheduler, channel.heartbeat_interval, Arc::clone(&publisher))
        .context("starting heartbeat timer")?;

    let clock = SystemClock;
    let mut bid = 100_000i64;
    let mut published = 0u64;
    let mut window = 0u64;
    let mut last = Instant::now();

    while limit.is_none_or(|n| published < n) {
        bid += 1;
        let ev = TopOfBook {
            ts_event_ns: clock.now_ns(),
            symbol_id: SymbolId(1),
            bid_px_ticks: bid,
            bid_qty_lots: 10,
            ask_px_ticks: bid + 10,
            ask_qty_lots: 12,
        };

        let res = publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .publish(TOP_OF_BOOK, &ev.encode(), None);
        match res {
            Ok(_) => {
                published += 1;
                window += 1;
            }
            Err(PublishError::Full | PublishError::NoReaders) => {}
            Err(e @ (PublishError::Closed | PublishError::Destroyed)) => {
                scheduler.cancel(heartbeat);
                bail!("stream ended under the producer: {e}");
            }
            Err(e) => return Err(e.into()),
        }

        if last.elapsed() >= Duration::from_secs(1) {
            let p = publisher.lock().unwrap_or_else(PoisonError::into_inner);
            info!(
                rate = window,
                seq = p.next_seq() - 1,
                overflows = p.overflow_count(),
                fill = p.ring().stats().fill_ratio(),
                "publish rate ev/s"
            );
            window = 0;
            last = Instant::now();
        }
        std::hint::spin_loop();
    }

    scheduler.cancel(heartbeat);
    let mut p = publisher.lock().unwrap_or_else(PoisonError::into_inner);
    p.signal_end_of_stream();
    debug!(stats = ?p.ring().stats(), "final ring counters");
    info!(
        published,
        overflows = p.overflow_count(),
        heartbeats = p.heartbeats_sent(),
        "obsidian done"
    );
    Ok(())
}

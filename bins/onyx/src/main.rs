//! Market data consumer.
//!
//! ```text
//! onyx [config.toml]
//! ```
//!
//! Attaches to the configured segment, decodes every record, and reports
//! sequence gaps and producer liveness until the stream ends.

use anyhow::Context;
use lithos_config::TransportConfig;
use lithos_events::Event;
use lithos_icc::{
    AttachPoint, ChannelConfig, ChannelSubscriber, LivenessEvent, ReadError, SegmentError,
    SegmentIdent, ShadowRing,
};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for a producer to create the segment.
fn open_shadow(ident: &SegmentIdent, patience: Duration) -> Result<ShadowRing, SegmentError> {
    let deadline = Instant::now() + patience;
    loop {
        match ShadowRing::open(ident) {
            Ok(shadow) => return Ok(shadow),
            Err(e) if Instant::now() < deadline && is_transient(&e) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &SegmentError) -> bool {
    matches!(
        e,
        SegmentError::NotInitialized { .. } | SegmentError::Destroyed
    ) || e.io_kind() == Some(std::io::ErrorKind::NotFound)
}

#[derive(Debug, Default)]
struct Tally {
    books: u64,
    trades: u64,
    unknown: u64,
    last_mid: Option<i64>,
}

impl Tally {
    fn apply(&mut self, event: Option<Event>) {
        match event {
            Some(Event::TopOfBook(b)) => {
                self.books += 1;
                self.last_mid = Some(b.mid_ticks());
            }
            Some(Event::Trade(_)) => self.trades += 1,
            None => self.unknown += 1,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            TransportConfig::load(path.clone()).with_context(|| format!("loading {path}"))?
        }
        None => TransportConfig::default(),
    };
    init_tracing(&cfg.log_level);

    let ident = SegmentIdent::from_config(&cfg);
    let shadow = open_shadow(&ident, Duration::from_secs(30))
        .with_context(|| format!("opening {ident}"))?;
    let reader = shadow
        .attach(AttachPoint::Head)
        .context("attaching reader")?;
    info!(segment = %ident, slot = reader.slot_index(), "onyx attached");

    let channel = ChannelConfig::from(&cfg);
    let mut sub = ChannelSubscriber::new(reader, channel);
    let mut tally = Tally::default();
    let mut last = Instant::now();

    loop {
        let got = match sub.wait_next(Some(channel.heartbeat_interval)) {
            Ok(Some(r)) => {
                tally.apply(Event::decode(r.record_type.0, r.payload));
                true
            }
            Ok(None) => false,
            Err(ReadError::EndOfStream) => break,
            Err(ReadError::Malformed { .. }) => false,
            Err(e) => return Err(e).context("reading records"),
        };
        if got {
            sub.release()?;
        }

        match sub.poll_liveness() {
            Some(LivenessEvent::ProducerSilent { silent_for }) => {
                warn!(?silent_for, "waiting for the producer");
            }
            Some(LivenessEvent::ProducerRecovered) => info!("producer is back"),
            None => {}
        }

        if last.elapsed() >= Duration::from_secs(1) {
            info!(
                books = tally.books,
                trades = tally.trades,
                mid = ?tally.last_mid,
                gaps = sub.gaps(),
                lost = sub.lost_records(),
                "consumer progress"
            );
            last = Instant::now();
        }
    }

    info!(
        books = tally.books,
        trades = tally.trades,
        unknown = tally.unknown,
        gaps = sub.gaps(),
        lost = sub.lost_records(),
        lost_bytes = sub.reader().lost_bytes(),
        "onyx done"
    );
    Ok(())
}

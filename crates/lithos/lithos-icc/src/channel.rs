//! Sequenced channel: numbered, timestamped records over the raw ring.
//!
//! The publisher stamps every record with the next sequence number and the
//! time since its previous record. The first record and every heartbeat carry
//! an absolute anchor instead, so a subscriber that joins mid-stream can
//! rebuild absolute time after the next heartbeat.
//!
//! Heartbeats take a sequence number like any other record. Subscribers
//! consume them internally: they refresh liveness, re-anchor the clock and
//! reveal records that were lost while the stream was otherwise idle.
//!
//! Absolute time is only known while the subscriber sees every record. After
//! a gap, timestamps stay unknown until the next anchor.

use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::error::{ReadError, WriteError};
use crate::frame::{self, FrameHeader, FrameTime, HEADER_LEN, RecordType, TIME_LEN};
use crate::liveness::{LivenessEvent, LivenessMonitor};
use crate::reader::RingReader;
use crate::wait::{WaitConfig, WaitOutcome};
use crate::writer::RingBuffer;
use lithos_config::TransportConfig;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals of silence before the producer counts as dead.
    pub liveness_factor: u32,
    /// Spin and timeout settings for the blocking variants.
    pub wait: WaitConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            liveness_factor: 2,
            wait: WaitConfig::default(),
        }
    }
}

impl From<&TransportConfig> for ChannelConfig {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            heartbeat_interval: cfg.heartbeat_interval(),
            liveness_factor: cfg.liveness_factor,
            wait: WaitConfig::from(cfg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Transient. Retry, shed the record or alert; nothing was consumed.
    #[error("ring is full")]
    Full,
    #[error("no subscriber attached")]
    NoReaders,
    #[error("stream closed")]
    Closed,
    #[error("segment destroyed")]
    Destroyed,
    #[error("record of {requested} payload bytes exceeds the maximum of {max}")]
    TooLarge { requested: usize, max: usize },
    #[error("record type {0} is reserved")]
    ReservedType(RecordType),
    #[error("ring rejected the record: {0}")]
    Ring(#[source] WriteError),
}

impl From<WriteError> for PublishError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Full => Self::Full,
            WriteError::NoReaders => Self::NoReaders,
            WriteError::Closed => Self::Closed,
            WriteError::Destroyed => Self::Destroyed,
            other => Self::Ring(other),
        }
    }
}

/// Producer end of a channel. Owns the ring handle.
pub struct ChannelPublisher<C: Clock = SystemClock> {
    ring: RingBuffer,
    config: ChannelConfig,
    clock: C,
    next_seq: u64,
    last_time_ns: Option<u64>,
    overflows: u64,
    heartbeats: u64,
}

impl<C: Clock> ChannelPublisher<C> {
    pub fn new(ring: RingBuffer, config: ChannelConfig, clock: C) -> Self {
        Self {
            ring,
            config,
            clock,
            next_seq: 1,
            last_time_ns: None,
            overflows: 0,
            heartbeats: 0,
        }
    }

    /// Publish one record and return its sequence number.
    ///
    /// On failure nothing is published and no sequence number is consumed.
    pub fn publish(
        &mut self,
        record_type: RecordType,
        payload: &[u8],
        partition: Option<u32>,
    ) -> Result<u64, PublishError> {
        self.publish_with(record_type, payload.len(), partition, |buf| {
            buf.copy_from_slice(payload)
        })
    }

    /// Like [`publish`](Self::publish), but `fill` writes the `len` payload
    /// bytes straight into the ring.
    pub fn publish_with(
        &mut self,
        record_type: RecordType,
        len: usize,
        partition: Option<u32>,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<u64, PublishError> {
        if record_type.is_heartbeat() {
            return Err(PublishError::ReservedType(record_type));
        }
        let res = self.write(record_type, len, partition, fill);
        if res == Err(PublishError::Full) {
            self.overflows += 1;
        }
        res
    }

    /// Publish, waiting up to `timeout` for space while the ring is full.
    /// `None` waits as long as it takes.
    pub fn publish_blocking(
        &mut self,
        record_type: RecordType,
        payload: &[u8],
        partition: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<u64, PublishError> {
        if record_type.is_heartbeat() {
            return Err(PublishError::ReservedType(record_type));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let worst_case = HEADER_LEN + TIME_LEN + payload.len();
        loop {
            match self.write(record_type, payload.len(), partition, |buf| {
                buf.copy_from_slice(payload)
            }) {
                Err(PublishError::Full) => {}
                other => return other,
            }
            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => {
                        self.overflows += 1;
                        return Err(PublishError::Full);
                    }
                },
                None => None,
            };
            let cfg = self.config.wait.with_timeout(remaining);
            self.ring.wait_for_space(worst_case, &cfg);
        }
    }

    /// Publish a zero-payload heartbeat carrying the current time. It
    /// consumes a sequence number.
    pub fn heartbeat(&mut self) -> Result<u64, PublishError> {
        let seq = self.write(RecordType::HEARTBEAT, 0, None, |_| {})?;
        self.heartbeats += 1;
        Ok(seq)
    }

    fn write(
        &mut self,
        record_type: RecordType,
        len: usize,
        partition: Option<u32>,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<u64, PublishError> {
        let max = self.max_payload();
        if len > max {
            return Err(PublishError::TooLarge { requested: len, max });
        }
        let now = self.clock.now_ns();
        let time = match self.last_time_ns {
            Some(last) if !record_type.is_heartbeat() => {
                FrameTime::Delta(now.saturating_sub(last))
            }
            _ => FrameTime::Anchor(now),
        };
        let seq_no = self.next_seq;
        let header = FrameHeader {
            seq_no,
            record_type,
            partition,
            time,
            length: len as u32,
        };

        let buf = match self.ring.reserve(header.frame_len()) {
            Ok(buf) => buf,
            Err(WriteError::TooLarge { .. }) => {
                return Err(PublishError::TooLarge { requested: len, max });
            }
            Err(e) => return Err(e.into()),
        };
        fill(header.encode_into(buf));
        self.ring.commit()?;

        self.last_time_ns = Some(now);
        self.next_seq += 1;
        Ok(seq_no)
    }

    /// Largest payload accepted, whatever header the record ends up with.
    pub fn max_payload(&self) -> usize {
        self.ring.max_payload().saturating_sub(HEADER_LEN + TIME_LEN)
    }

    pub fn signal_end_of_stream(&mut self) {
        self.ring.signal_end_of_stream();
    }

    /// Publishes that failed because the ring was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats
    }

    /// Sequence number the next record will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn into_ring(self) -> RingBuffer {
        self.ring
    }
}

/// Records `first..=last` never reached this subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqGap {
    pub first: u64,
    pub last: u64,
}

impl SeqGap {
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A decoded data record. Borrows the payload from the ring until release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub seq_no: u64,
    pub record_type: RecordType,
    pub partition: Option<u32>,
    /// Absolute time in ns since the epoch, once an anchor has been seen.
    pub timestamp_ns: Option<u64>,
    pub payload: &'a [u8],
    /// Records missed right before this one.
    pub gap: Option<SeqGap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Receiving,
    /// End of stream observed after draining everything before it.
    Drained,
    Detached,
}

/// Metadata of the peeked record, kept across re-peeks so it is accounted once.
#[derive(Debug, Clone, Copy)]
struct Current {
    header: FrameHeader,
    timestamp_ns: Option<u64>,
    gap: Option<SeqGap>,
    payload_offset: usize,
}

/// Consumer end of a channel.
pub struct ChannelSubscriber<C: Clock = MonotonicClock> {
    reader: RingReader,
    config: ChannelConfig,
    clock: C,
    expected_seq: u64,
    time_ns: Option<u64>,
    current: Option<Current>,
    /// Gap seen at a heartbeat, reported with the next data record.
    carried_gap: Option<SeqGap>,
    liveness: LivenessMonitor,
    pending_event: Option<LivenessEvent>,
    gaps: u64,
    last_gap: Option<SeqGap>,
    lost_records: u64,
    heartbeats: u64,
    malformed: u64,
    state: SubscriberState,
}

impl ChannelSubscriber<MonotonicClock> {
    pub fn new(reader: RingReader, config: ChannelConfig) -> Self {
        Self::with_clock(reader, config, MonotonicClock)
    }
}

impl<C: Clock> ChannelSubscriber<C> {
    /// `clock` drives liveness only; record timestamps come from the stream.
    pub fn with_clock(reader: RingReader, config: ChannelConfig, clock: C) -> Self {
        let liveness = LivenessMonitor::new(
            config.heartbeat_interval,
            config.liveness_factor,
            clock.now_ns(),
        );
        Self {
            reader,
            config,
            clock,
            expected_seq: 1,
            time_ns: None,
            current: None,
            carried_gap: None,
            liveness,
            pending_event: None,
            gaps: 0,
            last_gap: None,
            lost_records: 0,
            heartbeats: 0,
            malformed: 0,
            state: SubscriberState::Receiving,
        }
    }

    /// The next data record, or `Ok(None)` if nothing new is committed.
    ///
    /// Call [`release`](Self::release) when done with it. Calling again
    /// before releasing returns the same record.
    pub fn next_record(&mut self) -> Result<Option<Record<'_>>, ReadError> {
        if self.state == SubscriberState::Detached {
            return Err(ReadError::Detached);
        }
        let cur = match self.current {
            Some(cur) => cur,
            None => match self.advance()? {
                Some(cur) => cur,
                None => return Ok(None),
            },
        };
        let Some(bytes) = self.reader.peek()? else {
            return Ok(None);
        };
        let h = cur.header;
        Ok(Some(Record {
            seq_no: h.seq_no,
            record_type: h.record_type,
            partition: h.partition,
            timestamp_ns: cur.timestamp_ns,
            payload: &bytes[cur.payload_offset..cur.payload_offset + h.length as usize],
            gap: cur.gap,
        }))
    }

    /// Peek and account records until a data record is at the cursor.
    fn advance(&mut self) -> Result<Option<Current>, ReadError> {
        loop {
            let peeked = self.reader.peek().map(|slot| {
                slot.map(|bytes| {
                    frame::decode(bytes).map(|f| (f.header, bytes.len() - f.payload.len()))
                })
            });
            let decoded = match peeked {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(None),
                Err(ReadError::EndOfStream) => {
                    self.mark_drained();
                    return Err(ReadError::EndOfStream);
                }
                Err(e) => return Err(e),
            };
            let (header, payload_offset) = match decoded {
                Ok(decoded) => decoded,
                Err(source) => {
                    // Skip it so the cursor, and under reject the producer,
                    // can move on. Its sequence number shows up as a gap.
                    let position = self.reader.position();
                    self.reader.release()?;
                    self.malformed += 1;
                    warn!(position, error = %source, "skipped malformed record");
                    return Err(ReadError::Malformed { position, source });
                }
            };

            let cur = self.account(header, payload_offset);
            if header.record_type.is_heartbeat() {
                self.heartbeats += 1;
                self.reader.release()?;
                continue;
            }
            self.current = Some(cur);
            return Ok(Some(cur));
        }
    }

    fn account(&mut self, header: FrameHeader, payload_offset: usize) -> Current {
        if let Some(event) = self.liveness.record(self.clock.now_ns()) {
            info!(seq = header.seq_no, "producer recovered");
            self.pending_event = Some(event);
        }

        let mut gap = None;
        if header.seq_no > self.expected_seq {
            let g = SeqGap {
                first: self.expected_seq,
                last: header.seq_no - 1,
            };
            self.gaps += 1;
            self.lost_records += g.len();
            self.last_gap = Some(g);
            warn!(first = g.first, last = g.last, missed = g.len(), "sequence gap");
            gap = Some(g);
        }
        self.expected_seq = self.expected_seq.max(header.seq_no + 1);

        // The deltas of missed records went with them.
        self.time_ns = match (header.time, self.time_ns) {
            (FrameTime::Anchor(t), _) => Some(t),
            (FrameTime::Delta(_), _) if gap.is_some() => None,
            (FrameTime::Delta(d), Some(t)) => Some(t.saturating_add(d)),
            (FrameTime::Delta(_), None) => None,
        };

        if header.record_type.is_heartbeat() {
            if let Some(g) = gap {
                self.carried_gap = Some(match self.carried_gap {
                    Some(prev) => SeqGap { first: prev.first, last: g.last },
                    None => g,
                });
            }
        } else if let Some(prev) = self.carried_gap.take() {
            gap = Some(SeqGap {
                first: prev.first,
                last: gap.map_or(prev.last, |g| g.last),
            });
        }

        Current {
            header,
            timestamp_ns: self.time_ns,
            gap,
            payload_offset,
        }
    }

    /// Consume the record returned by [`next_record`](Self::next_record).
    pub fn release(&mut self) -> Result<(), ReadError> {
        self.reader.release()?;
        self.current = None;
        Ok(())
    }

    /// Wait up to `timeout` for the next data record. `None` waits as long
    /// as it takes.
    pub fn wait_next(&mut self, timeout: Option<Duration>) -> Result<Option<Record<'_>>, ReadError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.next_record()?.is_some() {
                break;
            }
            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Ok(None),
                },
                None => None,
            };
            let cfg = self.config.wait.with_timeout(remaining);
            if self.reader.wait_for_data(&cfg) == WaitOutcome::TimedOut {
                return Ok(None);
            }
        }
        self.next_record()
    }

    /// Liveness transitions since the last poll, judged against this
    /// subscriber's clock.
    pub fn poll_liveness(&mut self) -> Option<LivenessEvent> {
        if let Some(event) = self.pending_event.take() {
            return Some(event);
        }
        let event = self.liveness.poll(self.clock.now_ns());
        if let Some(LivenessEvent::ProducerSilent { silent_for }) = event {
            warn!(
                ?silent_for,
                limit = ?self.liveness.limit(),
                "producer silent"
            );
        }
        event
    }

    pub fn is_producer_alive(&self) -> bool {
        self.liveness.is_alive(self.clock.now_ns())
    }

    fn mark_drained(&mut self) {
        if self.state == SubscriberState::Receiving {
            self.state = SubscriberState::Drained;
            info!(
                records = self.reader.records_read(),
                gaps = self.gaps,
                lost = self.lost_records,
                "stream drained"
            );
        }
    }

    pub fn detach(&mut self) {
        self.reader.detach();
        self.current = None;
        self.state = SubscriberState::Detached;
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    /// Number of gaps detected.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn last_gap(&self) -> Option<SeqGap> {
        self.last_gap
    }

    pub fn lost_records(&self) -> u64 {
        self.lost_records
    }

    pub fn heartbeats_seen(&self) -> u64 {
        self.heartbeats
    }

    /// Records skipped because they did not decode.
    pub fn malformed_records(&self) -> u64 {
        self.malformed
    }

    /// Sequence number the subscriber expects next.
    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    pub fn reader(&self) -> &RingReader {
        &self.reader
    }
}

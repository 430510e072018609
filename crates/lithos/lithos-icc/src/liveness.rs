//! Producer liveness as seen by one consumer.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Nothing arrived for longer than `factor` heartbeat intervals.
    ProducerSilent { silent_for: Duration },
    /// A record arrived after a reported silence.
    ProducerRecovered,
}

/// Tracks the time of the last record and reports transitions.
///
/// The producer counts as dead once `now - last_seen > factor * interval`,
/// strictly greater, so a silence of exactly the limit is still alive.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    limit_ns: u64,
    last_seen_ns: u64,
    silent: bool,
}

impl LivenessMonitor {
    /// `start_ns` counts as the last sign of life until a record arrives.
    pub fn new(interval: Duration, factor: u32, start_ns: u64) -> Self {
        Self {
            limit_ns: (interval * factor).as_nanos() as u64,
            last_seen_ns: start_ns,
            silent: false,
        }
    }

    /// A record (data or heartbeat) arrived at `now_ns`.
    pub fn record(&mut self, now_ns: u64) -> Option<LivenessEvent> {
        self.last_seen_ns = self.last_seen_ns.max(now_ns);
        if self.silent {
            self.silent = false;
            Some(LivenessEvent::ProducerRecovered)
        } else {
            None
        }
    }

    /// Report a silence once per outage.
    pub fn poll(&mut self, now_ns: u64) -> Option<LivenessEvent> {
        if self.silent {
            return None;
        }
        let elapsed = now_ns.saturating_sub(self.last_seen_ns);
        if elapsed > self.limit_ns {
            self.silent = true;
            Some(LivenessEvent::ProducerSilent {
                silent_for: Duration::from_nanos(elapsed),
            })
        } else {
            None
        }
    }

    pub fn is_alive(&self, now_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_seen_ns) <= self.limit_ns
    }

    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen_ns
    }

    pub fn limit(&self) -> Duration {
        Duration::from_nanos(self.limit_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn silence_is_reported_strictly_after_the_limit() {
        let mut m = LivenessMonitor::new(Duration::from_millis(100), 2, 0);
        assert_eq!(m.poll(200 * MS), None);
        assert!(m.is_alive(200 * MS));
        assert_eq!(
            m.poll(200 * MS + 1),
            Some(LivenessEvent::ProducerSilent {
                silent_for: Duration::from_nanos(200 * MS + 1)
            })
        );
        assert_eq!(m.poll(300 * MS), None, "reported once per outage");
        assert!(!m.is_alive(300 * MS));
    }

    #[test]
    fn next_record_reports_recovery_and_rearms() {
        let mut m = LivenessMonitor::new(Duration::from_millis(100), 2, 0);
        assert_eq!(m.record(50 * MS), None);
        assert!(m.poll(260 * MS).is_some());
        assert_eq!(m.record(270 * MS), Some(LivenessEvent::ProducerRecovered));
        assert_eq!(m.record(280 * MS), None);
        assert_eq!(m.poll(480 * MS), None);
        assert!(m.poll(481 * MS).is_some());
    }
}

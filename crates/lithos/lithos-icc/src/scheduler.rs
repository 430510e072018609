//! Periodic timers for heartbeats.
//!
//! The transport only needs `register_periodic` and `cancel`. Callbacks may
//! fire late; heartbeats carry the actual publish time, not the scheduled one.

use crate::channel::{ChannelPublisher, PublishError};
use crate::clock::Clock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

pub trait Scheduler {
    fn register_periodic(&self, interval: Duration, callback: TimerCallback)
    -> io::Result<TimerId>;

    /// Stop a timer. Returns false if it was not registered.
    fn cancel(&self, id: TimerId) -> bool;
}

struct ThreadTimer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// One background thread per timer. Dropping the scheduler cancels them all.
#[derive(Default)]
pub struct ThreadScheduler {
    next_id: AtomicU64,
    timers: Mutex<HashMap<TimerId, ThreadTimer>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for ThreadScheduler {
    fn register_periodic(
        &self,
        interval: Duration,
        mut callback: TimerCallback,
    ) -> io::Result<TimerId> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (stop, rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(format!("lithos-timer-{}", id.0))
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => callback(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ThreadTimer { stop, handle });
        debug!(timer = id.0, ?interval, "periodic timer registered");
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> bool {
        let timer = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(timer) = timer else {
            return false;
        };
        drop(timer.stop);
        if timer.handle.join().is_err() {
            warn!(timer = id.0, "timer callback panicked");
        }
        true
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let ids: Vec<TimerId> = self
            .timers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

struct ManualTimer {
    id: TimerId,
    interval_ns: u64,
    next_due_ns: u64,
    callback: TimerCallback,
}

/// Test scheduler driven by explicit time steps.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    now_ns: AtomicU64,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward to `now_ns` and fire every due callback, once per
    /// elapsed interval. Returns the number of callbacks fired.
    pub fn advance_to(&self, now_ns: u64) -> usize {
        self.now_ns.fetch_max(now_ns, Ordering::AcqRel);
        let mut fired = 0;
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for t in timers.iter_mut() {
            while t.next_due_ns <= now_ns {
                (t.callback)();
                t.next_due_ns += t.interval_ns;
                fired += 1;
            }
        }
        fired
    }

    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for ManualScheduler {
    fn register_periodic(
        &self,
        interval: Duration,
        callback: TimerCallback,
    ) -> io::Result<TimerId> {
        let interval_ns = interval.as_nanos() as u64;
        if interval_ns == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer interval must be non-zero",
            ));
        }
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = self.now_ns.load(Ordering::Acquire);
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ManualTimer {
                id,
                interval_ns,
                next_due_ns: now + interval_ns,
                callback,
            });
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = timers.len();
        timers.retain(|t| t.id != id);
        timers.len() != before
    }
}

/// Publish a heartbeat on `publisher` every `interval`.
///
/// Full rings and a closed stream are not errors for a heartbeat: the next
/// tick simply tries again.
pub fn spawn_heartbeat<S, C>(
    scheduler: &S,
    interval: Duration,
    publisher: Arc<Mutex<ChannelPublisher<C>>>,
) -> io::Result<TimerId>
where
    S: Scheduler + ?Sized,
    C: Clock + 'static,
{
    scheduler.register_periodic(
        interval,
        Box::new(move || {
            let mut p = publisher.lock().unwrap_or_else(PoisonError::into_inner);
            match p.heartbeat() {
                Ok(_) => {}
                Err(PublishError::Full) => {
                    debug!("heartbeat skipped, ring full");
                }
                Err(e) => debug!(error = %e, "heartbeat not published"),
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_scheduler_fires_once_per_interval() {
        let s = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = s
            .register_periodic(
                Duration::from_nanos(100),
                Box::new(move || {
                    h.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        assert_eq!(s.advance_to(99), 0);
        assert_eq!(s.advance_to(100), 1);
        assert_eq!(s.advance_to(350), 2);
        assert_eq!(hits.load(Ordering::Relaxed), 3);

        assert!(s.cancel(id));
        assert!(!s.cancel(id));
        assert_eq!(s.advance_to(1_000), 0);
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn thread_scheduler_runs_until_cancelled() {
        let s = ThreadScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = s
            .register_periodic(
                Duration::from_millis(2),
                Box::new(move || {
                    h.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Relaxed) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(hits.load(Ordering::Relaxed) >= 3);

        assert!(s.cancel(id));
        let after = hits.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::Relaxed), after);
        assert!(!s.cancel(id));
    }
}

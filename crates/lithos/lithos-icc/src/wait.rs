//! Hybrid spin-then-block waiting on a 32-bit word in shared memory.
//!
//! # Protocol
//!
//! **Waiter:**
//! 1. Spin up to `spin_count` times re-checking the caller's condition
//! 2. Set the `WAITING` bit on the word
//! 3. Re-check the condition (the signaler may have raced past step 2)
//! 4. Block in the OS until the word changes or the timeout elapses
//!
//! **Signaler:**
//! 1. Publish the state change the waiter is looking for
//! 2. If `WAITING` is set, bump the word, clear the bit and wake everyone
//!
//! The signaler only pays for a syscall when a waiter actually went to sleep,
//! so an actively spinning reader costs the producer one load per commit.
//! The word's upper 31 bits are a generation counter whose only purpose is to
//! make the OS wait fail fast when a wake happened in between.

use lithos_config::TransportConfig;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::time::{Duration, Instant};

/// Set while at least one waiter is (about to be) blocked in the OS.
pub const WAITING: u32 = 1;

/// Tuning for one blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Condition checks before falling back to the OS wait.
    pub spin_count: u32,
    /// Upper bound on the whole wait. `None` waits until the condition holds.
    pub timeout: Option<Duration>,
    /// Spin with a CPU hint instead of yielding to the scheduler.
    pub low_latency: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            spin_count: 1_000,
            timeout: None,
            low_latency: false,
        }
    }
}

impl WaitConfig {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&TransportConfig> for WaitConfig {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            spin_count: cfg.spin_count,
            timeout: cfg.timeout(),
            low_latency: cfg.low_latency,
        }
    }
}

/// Result of a blocking wait. Timing out is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// OS facility to sleep on a word and wake its sleepers.
pub trait WordWaiter {
    /// Block while `*word == expected`, for at most `timeout`.
    /// May return early or spuriously; callers re-check their condition.
    fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>);

    /// Wake every thread blocked on `word`, in any process.
    fn wake_all(word: &AtomicU32);
}

/// Linux futex backend. Uses the shared (non-private) futex so waiters in
/// other processes mapping the same page are woken too.
#[cfg(target_os = "linux")]
pub struct FutexWaiter;

#[cfg(target_os = "linux")]
impl WordWaiter for FutexWaiter {
    fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: `word` is a live, aligned 4-byte atomic; FUTEX_WAIT only
        // reads it. EAGAIN/EINTR/ETIMEDOUT are all handled by the caller's
        // re-check loop.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn wake_all(word: &AtomicU32) {
        // SAFETY: see `wait`.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

/// Portable backend: short sleeps instead of a kernel wait queue.
pub struct PollWaiter;

impl PollWaiter {
    const STEP: Duration = Duration::from_micros(50);
}

impl WordWaiter for PollWaiter {
    fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        if word.load(Ordering::Acquire) != expected {
            return;
        }
        let nap = timeout.map_or(Self::STEP, |t| t.min(Self::STEP));
        std::thread::sleep(nap);
    }

    fn wake_all(_word: &AtomicU32) {}
}

#[cfg(target_os = "linux")]
pub type PlatformWaiter = FutexWaiter;

#[cfg(not(target_os = "linux"))]
pub type PlatformWaiter = PollWaiter;

/// A wait word borrowed from shared memory, bound to an OS backend.
pub struct WaitWord<'a, W: WordWaiter = PlatformWaiter> {
    word: &'a AtomicU32,
    _backend: PhantomData<W>,
}

impl<'a, W: WordWaiter> WaitWord<'a, W> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self {
            word,
            _backend: PhantomData,
        }
    }

    /// Wait until `ready()` returns true or the configured timeout elapses.
    pub fn wait_until(&self, cfg: &WaitConfig, mut ready: impl FnMut() -> bool) -> WaitOutcome {
        let deadline = cfg.timeout.map(|t| Instant::now() + t);

        for _ in 0..cfg.spin_count {
            if ready() {
                return WaitOutcome::Ready;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WaitOutcome::TimedOut;
            }
            if cfg.low_latency {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return WaitOutcome::TimedOut;
                    }
                    Some(d - now)
                }
                None => None,
            };

            let armed = self.word.fetch_or(WAITING, Ordering::SeqCst) | WAITING;
            // Pairs with the fence in `wake`: either we see the new state here
            // or the signaler sees our bit.
            fence(Ordering::SeqCst);
            if ready() {
                return WaitOutcome::Ready;
            }
            W::wait(self.word, armed, remaining);
        }
    }

    /// Wake all waiters if any are blocked. Returns whether an OS wake was issued.
    ///
    /// Must be called after the state change the waiters are polling for has
    /// been stored.
    pub fn wake(&self) -> bool {
        fence(Ordering::SeqCst);
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur & WAITING == 0 {
                return false;
            }
            let next = (cur & !WAITING).wrapping_add(2);
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        W::wake_all(self.word);
        true
    }

    pub fn has_waiters(&self) -> bool {
        self.word.load(Ordering::Relaxed) & WAITING != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn blocking(timeout: Option<Duration>) -> WaitConfig {
        WaitConfig {
            spin_count: 0,
            timeout,
            low_latency: false,
        }
    }

    #[test]
    fn ready_condition_returns_without_arming() {
        let word = AtomicU32::new(0);
        let ww = WaitWord::<PlatformWaiter>::new(&word);
        assert_eq!(ww.wait_until(&WaitConfig::default(), || true), WaitOutcome::Ready);
        assert!(!ww.has_waiters());
        assert!(!ww.wake(), "no waiter, no syscall");
    }

    #[test]
    fn times_out_when_condition_never_holds() {
        let word = AtomicU32::new(0);
        let ww = WaitWord::<PlatformWaiter>::new(&word);
        let start = Instant::now();
        let outcome = ww.wait_until(&blocking(Some(Duration::from_millis(20))), || false);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn spin_phase_honours_timeout() {
        let word = AtomicU32::new(0);
        let ww = WaitWord::<PlatformWaiter>::new(&word);
        let cfg = WaitConfig {
            spin_count: u32::MAX,
            timeout: Some(Duration::from_millis(5)),
            low_latency: true,
        };
        assert_eq!(ww.wait_until(&cfg, || false), WaitOutcome::TimedOut);
    }

    #[test]
    fn blocked_waiter_is_woken_by_signaler() {
        let word = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let (w2, f2) = (word.clone(), flag.clone());
        let waiter = thread::spawn(move || {
            let ww = WaitWord::<PlatformWaiter>::new(&w2);
            ww.wait_until(&blocking(Some(Duration::from_secs(5))), || {
                f2.load(Ordering::Acquire)
            })
        });

        // Let the waiter arm its bit and block.
        let armed_by = Instant::now() + Duration::from_secs(5);
        while word.load(Ordering::Relaxed) & WAITING == 0 && Instant::now() < armed_by {
            thread::sleep(Duration::from_millis(1));
        }

        flag.store(true, Ordering::Release);
        let ww = WaitWord::<PlatformWaiter>::new(&word);
        assert!(ww.wake(), "waiting bit was set, wake must be issued");
        assert!(!ww.has_waiters());

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ready);
    }

    #[test]
    fn poll_backend_waits_and_returns() {
        let word = AtomicU32::new(0);
        let ww = WaitWord::<PollWaiter>::new(&word);
        let flag = AtomicBool::new(false);
        let mut calls = 0;
        let outcome = ww.wait_until(&blocking(Some(Duration::from_secs(1))), || {
            calls += 1;
            if calls > 3 {
                flag.store(true, Ordering::Relaxed);
            }
            flag.load(Ordering::Relaxed)
        });
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[test]
    fn config_bundle_maps_to_wait_config() {
        let cfg = TransportConfig {
            spin_count: 7,
            timeout_us: Some(250),
            low_latency: true,
            ..TransportConfig::default()
        };
        let wait = WaitConfig::from(&cfg);
        assert_eq!(wait.spin_count, 7);
        assert_eq!(wait.timeout, Some(Duration::from_micros(250)));
        assert!(wait.low_latency);
    }
}

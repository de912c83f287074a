/*!
 * Futex Wait Strategies
 *
 * Two implementations of block-until-value-changes over an `AtomicU32`:
 *
 * - [`ParkingFutex`] parks on the word's address through parking_lot_core.
 *   The validate callback runs under the parking bucket lock and re-checks
 *   both the word and the cancellation token, so a wake can never slip in
 *   between the check and the sleep.
 * - [`LinuxFutex`] issues futex(2) directly. A cancellation raised after
 *   the token check but before the syscall is only seen at the next wake.
 */

use super::cancel::CancellationToken;
use super::config::{StrategyType, SyncConfig};
use super::traits::{WaitOutcome, WaitStrategy, WakeResult};
use parking_lot_core::{park, unpark_all, unpark_one, ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[inline]
fn word_addr(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

#[inline]
fn cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.map_or(false, |t| t.is_cancelled())
}

/// A break or a system-lock request is pending
#[inline]
fn needs_attention(cancel: Option<&CancellationToken>) -> bool {
    cancel.map_or(false, |t| t.needs_attention())
}

/// Outcome for a wait that returns before sleeping
#[inline]
fn attention_outcome(cancel: Option<&CancellationToken>) -> Option<WaitOutcome> {
    if cancelled(cancel) {
        Some(WaitOutcome::Cancelled)
    } else if needs_attention(cancel) {
        Some(WaitOutcome::Woken)
    } else {
        None
    }
}

/// Address-keyed parking (all platforms)
#[derive(Debug, Default, Clone, Copy)]
pub struct ParkingFutex;

impl ParkingFutex {
    pub const fn new() -> Self {
        Self
    }

    fn wake_addr(addr: usize) {
        // SAFETY: the address is only used as a parking key
        unsafe {
            unpark_all(addr, DEFAULT_UNPARK_TOKEN);
        }
    }
}

impl WaitStrategy for ParkingFutex {
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WaitOutcome {
        if let Some(outcome) = attention_outcome(cancel) {
            return outcome;
        }

        let addr = word_addr(word);
        let _registration = cancel.map(|t| t.park_on(addr, Self::wake_addr));
        // A timeout too large to represent waits forever
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));

        // SAFETY: the key is the word's address; no callback panics or parks
        let result = unsafe {
            park(
                addr,
                || word.load(Ordering::Acquire) == expected && !needs_attention(cancel),
                || {},
                |_key, _was_last| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        match result {
            ParkResult::TimedOut => WaitOutcome::TimedOut,
            ParkResult::Unparked(_) | ParkResult::Invalid if cancelled(cancel) => {
                WaitOutcome::Cancelled
            }
            ParkResult::Unparked(_) | ParkResult::Invalid => WaitOutcome::Woken,
        }
    }

    fn wake_one(&self, word: &AtomicU32) -> WakeResult {
        // SAFETY: the address is only used as a parking key
        let result = unsafe { unpark_one(word_addr(word), |_| DEFAULT_UNPARK_TOKEN) };
        match result.unparked_threads {
            0 => WakeResult::NoWaiters,
            n => WakeResult::Woken(n),
        }
    }

    fn wake_all(&self, word: &AtomicU32) -> WakeResult {
        // SAFETY: the address is only used as a parking key
        let n = unsafe { unpark_all(word_addr(word), DEFAULT_UNPARK_TOKEN) };
        match n {
            0 => WakeResult::NoWaiters,
            n => WakeResult::Woken(n),
        }
    }

    fn name(&self) -> &'static str {
        "parking"
    }
}

/// Raw futex(2) syscalls
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxFutex;

#[cfg(target_os = "linux")]
impl LinuxFutex {
    pub const fn new() -> Self {
        Self
    }

    fn wake(addr: usize, count: i32) -> usize {
        // SAFETY: FUTEX_WAKE only uses the address as a key; a stale address
        // at worst wakes nobody or produces a spurious wake
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const u32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
            )
        };
        if rc > 0 {
            rc as usize
        } else {
            0
        }
    }

    fn wake_addr(addr: usize) {
        Self::wake(addr, i32::MAX);
    }
}

#[cfg(target_os = "linux")]
impl WaitStrategy for LinuxFutex {
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WaitOutcome {
        if let Some(outcome) = attention_outcome(cancel) {
            return outcome;
        }

        let addr = word_addr(word);
        let _registration = cancel.map(|t| t.park_on(addr, Self::wake_addr));
        if let Some(outcome) = attention_outcome(cancel) {
            return outcome;
        }

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: the word is a live AtomicU32 for the duration of the call and
        // the timespec outlives it
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const u32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
            )
        };

        if rc == 0 {
            return if cancelled(cancel) {
                WaitOutcome::Cancelled
            } else {
                WaitOutcome::Woken
            };
        }

        match std::io::Error::last_os_error().raw_os_error().unwrap_or(0) {
            libc::ETIMEDOUT => WaitOutcome::TimedOut,
            libc::EAGAIN | libc::EINTR if cancelled(cancel) => WaitOutcome::Cancelled,
            libc::EAGAIN | libc::EINTR => WaitOutcome::Woken,
            errno => WaitOutcome::Failed(errno),
        }
    }

    fn wake_one(&self, word: &AtomicU32) -> WakeResult {
        match Self::wake(word_addr(word), 1) {
            0 => WakeResult::NoWaiters,
            n => WakeResult::Woken(n),
        }
    }

    fn wake_all(&self, word: &AtomicU32) -> WakeResult {
        match Self::wake(word_addr(word), i32::MAX) {
            0 => WakeResult::NoWaiters,
            n => WakeResult::Woken(n),
        }
    }

    fn name(&self) -> &'static str {
        "futex"
    }
}

/// Enum-based dispatch over the available strategies
#[derive(Debug, Clone, Copy)]
pub enum WaitStrategyImpl {
    Parking(ParkingFutex),
    #[cfg(target_os = "linux")]
    Futex(LinuxFutex),
}

impl WaitStrategyImpl {
    /// Build the strategy named by `config`
    pub fn from_config(config: &SyncConfig) -> Self {
        match config.select_strategy() {
            #[cfg(target_os = "linux")]
            StrategyType::Futex => WaitStrategyImpl::Futex(LinuxFutex::new()),
            _ => WaitStrategyImpl::Parking(ParkingFutex::new()),
        }
    }
}

impl WaitStrategy for WaitStrategyImpl {
    #[inline]
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WaitOutcome {
        match self {
            WaitStrategyImpl::Parking(s) => s.wait(word, expected, timeout, cancel),
            #[cfg(target_os = "linux")]
            WaitStrategyImpl::Futex(s) => s.wait(word, expected, timeout, cancel),
        }
    }

    #[inline]
    fn wake_one(&self, word: &AtomicU32) -> WakeResult {
        match self {
            WaitStrategyImpl::Parking(s) => s.wake_one(word),
            #[cfg(target_os = "linux")]
            WaitStrategyImpl::Futex(s) => s.wake_one(word),
        }
    }

    #[inline]
    fn wake_all(&self, word: &AtomicU32) -> WakeResult {
        match self {
            WaitStrategyImpl::Parking(s) => s.wake_all(word),
            #[cfg(target_os = "linux")]
            WaitStrategyImpl::Futex(s) => s.wake_all(word),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WaitStrategyImpl::Parking(s) => s.name(),
            #[cfg(target_os = "linux")]
            WaitStrategyImpl::Futex(s) => s.name(),
        }
    }
}

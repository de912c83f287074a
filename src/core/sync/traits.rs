/*!
 * Wait Strategy Traits
 * Block-until-value-changes / wake-one / wake-all over a 32-bit word
 */

use super::cancel::CancellationToken;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Result of a wake operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// Successfully woke N waiters
    Woken(usize),
    /// No waiters were present
    NoWaiters,
}

impl WakeResult {
    #[inline]
    pub fn is_woken(&self) -> bool {
        matches!(self, WakeResult::Woken(_))
    }

    #[inline]
    pub fn count(&self) -> usize {
        match self {
            WakeResult::Woken(n) => *n,
            WakeResult::NoWaiters => 0,
        }
    }
}

/// Result of a wait operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken, spuriously woken, or the word no longer held the expected value
    Woken,
    /// The timeout elapsed while asleep
    TimedOut,
    /// The cancellation token was raised before or during the sleep
    Cancelled,
    /// The platform call failed
    Failed(i32),
}

/// Wait strategy trait over an address-identified word
///
/// `wait` returns immediately unless `word == expected`. Every return is a
/// hint: callers always re-examine the word.
pub trait WaitStrategy: Send + Sync {
    /// Sleep while `word` holds `expected`, up to `timeout`
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WaitOutcome;

    /// Wake one thread sleeping on `word`
    fn wake_one(&self, word: &AtomicU32) -> WakeResult;

    /// Wake all threads sleeping on `word`
    fn wake_all(&self, word: &AtomicU32) -> WakeResult;

    /// Strategy name for debugging
    fn name(&self) -> &'static str;
}

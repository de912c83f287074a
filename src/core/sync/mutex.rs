/*!
 * Futex Mutex
 *
 * Three-state mutex over a single word:
 *
 * - `FREE` (0): unheld
 * - `LOCK` (1): held, nobody sleeping
 * - `WAIT` (2): held, a sleeper may exist
 *
 * WAIT is a conservative over-approximation. Every thread that might sleep
 * sets it first, and whoever swaps the word back to FREE out of WAIT wakes
 * exactly one sleeper. A stale WAIT costs one unnecessary wake and never a
 * lost one.
 *
 * Ownership is tracked by an explicit [`OwnerId`] so that misuse (self
 * deadlock, unlock by a stranger) is reported as an error instead of being
 * undefined.
 */

use super::cancel::CancellationToken;
use super::config::SyncConfig;
use super::futex::WaitStrategyImpl;
use super::traits::{WaitOutcome, WaitStrategy};
use crate::core::errors::{SyncError, SyncResult};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const FREE: u32 = 0;
const LOCK: u32 = 1;
const WAIT: u32 = 2;

static NEXT_THREAD_OWNER: AtomicU64 = AtomicU64::new(1 << 48);

thread_local! {
    static THREAD_OWNER: OwnerId = OwnerId(
        NonZeroU64::new(NEXT_THREAD_OWNER.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(NonZeroU64::MIN),
    );
}

/// Identity recorded as a mutex owner
///
/// Usually a task id supplied by the runtime. [`OwnerId::current`] hands out
/// a per-thread id from a range above `1 << 48` for callers without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    /// Wrap a raw id; 0 is reserved for "no owner"
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Per-thread owner id
    pub fn current() -> Self {
        THREAD_OWNER.with(|id| *id)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Break level of the token, if raised
///
/// A pending system-lock request is acknowledged here and does not end the
/// wait.
#[inline]
fn attention(cancel: Option<&CancellationToken>) -> Option<u8> {
    let token = cancel?;
    if token.accept_system_lock() {
        tracing::trace!("mutex waiter accepted a system lock request");
    }
    Some(token.level()).filter(|&level| level != 0)
}

/// Futex-based mutex with optional recursion
#[repr(C, align(64))]
pub struct FutexMutex {
    state: AtomicU32,
    depth: AtomicU32,
    owner: AtomicU64,
    recursive: bool,
    max_spins: u32,
    strategy: WaitStrategyImpl,
}

impl FutexMutex {
    /// Create an unheld mutex with the default configuration
    pub fn new(recursive: bool) -> Self {
        Self::with_config(recursive, SyncConfig::default())
    }

    pub fn with_config(recursive: bool, config: SyncConfig) -> Self {
        Self {
            state: AtomicU32::new(FREE),
            depth: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            recursive,
            max_spins: config.max_spins,
            strategy: WaitStrategyImpl::from_config(&config),
        }
    }

    /// Acquire, sleeping as long as necessary
    ///
    /// Fails with `Deadlock` when `owner` already holds a non-recursive
    /// mutex, and with `Interrupted` when `cancel` is raised while waiting.
    pub fn lock(&self, owner: OwnerId, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        if self.held_by(owner) {
            return self.reenter(owner);
        }
        if !self.try_acquire_spinning() {
            self.lock_contended(cancel)?;
        }
        self.acquired(owner);
        Ok(())
    }

    /// Acquire, giving up after `timeout`
    ///
    /// The deadline is fixed before the first sleep. A timeout reported by
    /// the wait primitive is trusted as is; otherwise the remaining time is
    /// recomputed after every wake.
    pub fn timed_lock(
        &self,
        owner: OwnerId,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<()> {
        if self.held_by(owner) {
            return self.reenter(owner);
        }
        if self.cas_free_to_lock() {
            self.acquired(owner);
            return Ok(());
        }

        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut remaining = Some(timeout);

        if self.state.swap(WAIT, Ordering::Acquire) == FREE {
            self.acquired(owner);
            return Ok(());
        }

        loop {
            if let Some(level) = attention(cancel) {
                return Err(SyncError::Interrupted { level });
            }
            let outcome = self.strategy.wait(&self.state, WAIT, remaining, cancel);
            if let WaitOutcome::Failed(errno) = outcome {
                return Err(SyncError::WaitFailed { errno });
            }
            if self.state.swap(WAIT, Ordering::Acquire) == FREE {
                self.acquired(owner);
                return Ok(());
            }
            if outcome == WaitOutcome::TimedOut {
                return Err(SyncError::TimedOut);
            }
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(SyncError::TimedOut);
                }
                remaining = Some(left);
            }
        }
    }

    /// Acquire without blocking
    ///
    /// Returns `Ok(false)` when another owner holds the mutex. Reacquiring a
    /// non-recursive mutex from its holder is a `Deadlock` error rather than
    /// a busy result.
    pub fn try_lock(&self, owner: OwnerId) -> SyncResult<bool> {
        if self.held_by(owner) {
            return self.reenter(owner).map(|()| true);
        }
        if self.cas_free_to_lock() {
            self.acquired(owner);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release one level of ownership
    ///
    /// A caller that is not the recorded owner gets `NotOwner` and the mutex
    /// is left untouched.
    pub fn unlock(&self, owner: OwnerId) -> SyncResult<()> {
        let current = self.owner.load(Ordering::Relaxed);
        if current != owner.get() {
            return Err(SyncError::NotOwner {
                caller: owner.get(),
                owner: (current != 0).then_some(current),
            });
        }

        if self.recursive {
            let depth = self.depth.load(Ordering::Relaxed).saturating_sub(1);
            self.depth.store(depth, Ordering::Relaxed);
            if depth != 0 {
                return Ok(());
            }
        }

        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(FREE, Ordering::Release) == WAIT {
            self.strategy.wake_one(&self.state);
        }
        Ok(())
    }

    /// Lock and return a guard that unlocks on drop
    pub fn lock_guard(
        &self,
        owner: OwnerId,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<FutexGuard<'_>> {
        self.lock(owner, cancel)?;
        Ok(FutexGuard { mutex: self, owner })
    }

    /// Current holder, if any
    pub fn owner(&self) -> Option<OwnerId> {
        OwnerId::new(self.owner.load(Ordering::Relaxed))
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != FREE
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Recursion depth held by the owner (always 0 for non-recursive mutexes)
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Name of the wait strategy in use
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    #[inline]
    fn held_by(&self, owner: OwnerId) -> bool {
        self.owner.load(Ordering::Relaxed) == owner.get()
    }

    #[inline]
    fn reenter(&self, owner: OwnerId) -> SyncResult<()> {
        if !self.recursive {
            return Err(SyncError::Deadlock { owner: owner.get() });
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    fn cas_free_to_lock(&self) -> bool {
        self.state
            .compare_exchange(FREE, LOCK, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn try_acquire_spinning(&self) -> bool {
        if self.cas_free_to_lock() {
            return true;
        }
        for _ in 0..self.max_spins {
            match self.state.load(Ordering::Relaxed) {
                FREE if self.cas_free_to_lock() => return true,
                WAIT => return false,
                _ => std::hint::spin_loop(),
            }
        }
        false
    }

    fn lock_contended(&self, cancel: Option<&CancellationToken>) -> SyncResult<()> {
        while self.state.swap(WAIT, Ordering::Acquire) != FREE {
            if let Some(level) = attention(cancel) {
                return Err(SyncError::Interrupted { level });
            }
            if let WaitOutcome::Failed(errno) = self.strategy.wait(&self.state, WAIT, None, cancel) {
                return Err(SyncError::WaitFailed { errno });
            }
        }
        Ok(())
    }

    #[inline]
    fn acquired(&self, owner: OwnerId) {
        if self.recursive {
            self.depth.store(1, Ordering::Relaxed);
        }
        self.owner.store(owner.get(), Ordering::Relaxed);
    }
}

impl Default for FutexMutex {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for FutexMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutexMutex")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("owner", &self.owner())
            .field("depth", &self.depth())
            .field("recursive", &self.recursive)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// RAII guard returned by [`FutexMutex::lock_guard`]
pub struct FutexGuard<'a> {
    mutex: &'a FutexMutex,
    owner: OwnerId,
}

impl FutexGuard<'_> {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for FutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock(self.owner) {
            tracing::error!(error = %e, "guard failed to unlock mutex");
        }
    }
}

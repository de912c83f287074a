/*!
 * Cancellation Token
 *
 * Explicit attention signal polled by blocked mutex waiters at every wake.
 * The token packs two requests into one word:
 *
 * - a break level in the low byte; any nonzero level aborts the wait
 * - a system-lock request above it; waiters acknowledge it and keep waiting
 *
 * Raising either request wakes any waiter currently sleeping under the
 * token, so the poll happens promptly instead of at the next unlock.
 */

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Break level used by [`CancellationToken::cancel`]
pub const ATTENTION_BREAK: u8 = 1;

const LEVEL_MASK: u32 = 0xff;
const SYSTEM_LOCK_BIT: u32 = 1 << 8;

struct Parked {
    addr: usize,
    wake: fn(usize),
}

struct TokenInner {
    word: AtomicU32,
    system_locks_accepted: AtomicU64,
    parked: Mutex<Vec<Parked>>,
}

/// Shared attention flag: a break level (0 = clear) plus a system-lock request
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                word: AtomicU32::new(0),
                system_locks_accepted: AtomicU64::new(0),
                parked: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Raise a break-level attention signal
    pub fn cancel(&self) {
        self.raise(ATTENTION_BREAK);
    }

    /// Raise the break level and wake waiters parked under this token
    ///
    /// A level of 0 is ignored. Higher levels are never lowered by a later,
    /// smaller raise.
    pub fn raise(&self, level: u8) {
        if level == 0 {
            return;
        }
        let level = level as u32;
        // The closure always returns Some, so the update cannot fail
        let _ = self
            .inner
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                Some((word & !LEVEL_MASK) | (word & LEVEL_MASK).max(level))
            });
        self.wake_parked();
    }

    /// Ask blocked threads to check in for a system lock
    ///
    /// Waiters acknowledge the request through
    /// [`CancellationToken::accept_system_lock`] and go back to waiting.
    pub fn request_system_lock(&self) {
        self.inner.word.fetch_or(SYSTEM_LOCK_BIT, Ordering::SeqCst);
        self.wake_parked();
    }

    #[inline]
    pub fn system_lock_requested(&self) -> bool {
        self.inner.word.load(Ordering::Acquire) & SYSTEM_LOCK_BIT != 0
    }

    /// Acknowledge a pending system-lock request; returns whether one was pending
    pub fn accept_system_lock(&self) -> bool {
        let prior = self.inner.word.fetch_and(!SYSTEM_LOCK_BIT, Ordering::AcqRel);
        if prior & SYSTEM_LOCK_BIT == 0 {
            return false;
        }
        self.inner.system_locks_accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// System-lock requests acknowledged so far
    pub fn system_locks_accepted(&self) -> u64 {
        self.inner.system_locks_accepted.load(Ordering::Relaxed)
    }

    /// Current break level, 0 when clear
    #[inline]
    pub fn level(&self) -> u8 {
        (self.inner.word.load(Ordering::Acquire) & LEVEL_MASK) as u8
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.level() != 0
    }

    /// Either request is pending
    #[inline]
    pub fn needs_attention(&self) -> bool {
        self.inner.word.load(Ordering::Acquire) != 0
    }

    /// Clear the break level so the token can be reused
    pub fn reset(&self) {
        self.inner.word.fetch_and(!LEVEL_MASK, Ordering::Release);
    }

    fn wake_parked(&self) {
        let parked = self.inner.parked.lock();
        for p in parked.iter() {
            (p.wake)(p.addr);
        }
    }

    /// Record that the caller is about to sleep on `addr`
    pub(crate) fn park_on(&self, addr: usize, wake: fn(usize)) -> ParkRegistration<'_> {
        self.inner.parked.lock().push(Parked { addr, wake });
        ParkRegistration { token: self, addr }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("level", &self.level())
            .field("system_lock", &self.system_lock_requested())
            .finish()
    }
}

/// Removes a parked address from its token when dropped
pub(crate) struct ParkRegistration<'a> {
    token: &'a CancellationToken,
    addr: usize,
}

impl Drop for ParkRegistration<'_> {
    fn drop(&mut self) {
        let mut parked = self.token.inner.parked.lock();
        if let Some(pos) = parked.iter().position(|p| p.addr == self.addr) {
            parked.swap_remove(pos);
        }
    }
}

/*!
 * Synchronization Configuration
 *
 * Runtime configuration for wait strategy selection
 */

use crate::core::limits::DEFAULT_MUTEX_SPINS;
use serde::{Deserialize, Serialize};

/// Strategy type selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    /// Raw futex(2) syscalls (Linux only)
    Futex,
    /// Address-keyed parking through parking_lot_core (all platforms)
    Parking,
    /// Auto-select based on platform
    Auto,
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Preferred strategy
    pub strategy: StrategyType,
    /// Spins on a held lock before switching it to WAIT and sleeping
    pub max_spins: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyType::Auto,
            max_spins: DEFAULT_MUTEX_SPINS,
        }
    }
}

impl SyncConfig {
    /// Configuration optimized for short critical sections
    pub const fn low_latency() -> Self {
        Self {
            strategy: StrategyType::Auto,
            max_spins: 400,
        }
    }

    /// Configuration optimized for long holds: sleep immediately
    pub const fn long_wait() -> Self {
        Self {
            strategy: StrategyType::Auto,
            max_spins: 0,
        }
    }

    /// Select best strategy for current platform
    ///
    /// `Auto` picks parking everywhere: its validation runs under the bucket
    /// lock, so a cancellation raised between the check and the sleep still
    /// wakes the waiter. Raw futex waits can miss that window.
    pub fn select_strategy(&self) -> StrategyType {
        match self.strategy {
            StrategyType::Auto => StrategyType::Parking,
            #[cfg(not(target_os = "linux"))]
            StrategyType::Futex => StrategyType::Parking,
            other => other,
        }
    }
}

/*!
 * Synchronization Primitives
 *
 * Futex-style mutex and the wait/wake strategies it sleeps on:
 * - Parking (parking_lot_core, all platforms), race-free with cancellation
 * - Raw futex(2) on Linux for minimal overhead
 *
 * # Architecture
 *
 * `FutexMutex` owns a 32-bit state word and a `WaitStrategyImpl`. Waiters
 * poll an optional `CancellationToken` at every wake, which is how the
 * runtime's attention/interrupt requests reach a blocked thread.
 */

mod cancel;
mod config;
mod futex;
mod mutex;
mod traits;

pub use cancel::{CancellationToken, ATTENTION_BREAK};
pub use config::{StrategyType, SyncConfig};
pub use mutex::{FutexGuard, FutexMutex, OwnerId};
pub use traits::{WaitOutcome, WaitStrategy, WakeResult};

// Re-export specific strategies for advanced users
#[cfg(target_os = "linux")]
pub use futex::LinuxFutex;
pub use futex::{ParkingFutex, WaitStrategyImpl};

//! Host power integration: reference-counted wakelock and the
//! per-source watchdog that guards it.

pub mod wakelock;
pub mod watchdog;

pub use wakelock::{PowerInterface, SysfsPowerInterface, Wakelock};
pub use watchdog::WakelockWatchdog;
pub use crate::types::WakeSource;

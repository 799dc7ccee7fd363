//! Error taxonomy for the Bluetooth HAL.
//!
//! Recoverable failures flow through [`HalError`]/[`HalResult`]. The
//! handful of conditions the original treats as unrecoverable (a
//! watchdog bite, a debug-build state-machine violation, a worker post
//! that never drains) stay as `panic!` call sites instead, matching
//! how those paths terminate the process rather than return an error.

use crate::types::HalState;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("command protocol error: {0}")]
    CommandProtocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: HalState, to: HalState },

    #[error("watchdog timeout on {0}")]
    WatchdogTimeout(&'static str),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}

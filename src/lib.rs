//! Host-side HCI transport and routing layer: frames and deframes H4
//! packets over a UART, sequences chip bring-up, enforces command
//! flow control, and fans inbound traffic out to the Bluetooth stack
//! and any registered observers.
//!
//! See [`router::HciRouter`] for the entry point most callers want.

pub mod activities;
pub mod config;
pub mod error;
pub mod packet;
pub mod power;
pub mod provisioner;
pub mod router;
pub mod timer;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::HalConfig;
pub use error::{HalError, HalResult};
pub use packet::HciPacket;
pub use router::callback::{RouterCallback, RouterClientCallback};
pub use router::HciRouter;
pub use types::HalState;

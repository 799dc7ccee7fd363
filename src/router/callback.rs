//! The two upward-facing callback traits.
//!
//! Grounded on `hci_router_callback.h` (the main stack's callback,
//! realized here as [`RouterCallback`]) and
//! `hci_router_client_callback.h` (a registered client's callback,
//! realized as [`RouterClientCallback`]).

use crate::packet::HciPacket;
use crate::router::monitor::ClientMonitors;
use crate::types::{HalState, MonitorMode};

/// Callbacks for the primary Bluetooth stack client.
pub trait RouterCallback: Send + Sync {
    /// A command-complete or command-status event for a command sent
    /// through the acknowledged (`send_command`) path.
    fn on_command_callback(&self, packet: &HciPacket);

    /// Any event other than command-complete/command-status
    /// (`HciEventReceived`/`AclDataReceived`/etc. in spec terms). The
    /// primary stack has no filters to declare and no say over whether
    /// delivery happens — that's what registered [`RouterClientCallback`]s
    /// and their `Monitor` filters are for.
    fn on_packet_callback(&self, packet: &HciPacket);

    /// The router's HAL state changed.
    fn on_hal_state_changed(&self, new_state: HalState, old_state: HalState);
}

/// Callbacks for a secondary client registered through
/// [`crate::router::client_agent::ClientAgent`].
///
/// Extends [`RouterCallback`] with four lifecycle convenience hooks,
/// grounded on `HciRouterClientCallback`. Implementors are steered
/// toward these over `on_hal_state_changed` directly: the agent
/// computes them, in a fixed order, from the raw state transition.
pub trait RouterClientCallback: RouterCallback {
    /// The filters this client wants to observe, each paired with the
    /// [`MonitorMode`] that applies when it matches (§3 `Monitor`).
    fn monitors(&self) -> ClientMonitors;

    /// A packet matched one of this client's declared filters. The
    /// mode (`Monitor` vs. `Intercept`) that determines whether the
    /// packet still reaches the stack is the one declared alongside
    /// the matching filter, not this call's return value — this is a
    /// notification, not a decision point.
    fn on_packet(&self, packet: &HciPacket);

    /// The HAL state became `BtChipReady`.
    fn on_bluetooth_chip_ready(&self) {}

    /// The HAL state dropped below `BtChipReady`.
    fn on_bluetooth_chip_closed(&self) {}

    /// The HAL state became `Running`.
    fn on_bluetooth_enabled(&self) {}

    /// The HAL state dropped below `Running`.
    fn on_bluetooth_disabled(&self) {}
}

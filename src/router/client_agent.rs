//! Registry and dispatcher for secondary router clients.
//!
//! Grounded on `hci_router_client_agent.{h,cc}`. The agent tracks the
//! last HAL state it forwarded so it can compute the four lifecycle
//! hooks of [`RouterClientCallback`] from a raw transition, and
//! enforces `NotifyHalStateChange`'s non-obvious ordering: entering
//! `BtChipReady` fires `on_bluetooth_chip_ready` *before*
//! `on_bluetooth_disabled` (if Bluetooth was enabled); any other
//! transition fires `on_bluetooth_disabled` *before*
//! `on_bluetooth_chip_closed` (if the chip was ready). The backwards
//! transition check is a debug-only assertion, mirroring the
//! original's `#ifndef UNIT_TEST` guard.

use crate::packet::HciPacket;
use crate::router::callback::RouterClientCallback;
use crate::types::{HalState, MonitorMode};
use parking_lot::RwLock;
use std::sync::Arc;

pub struct ClientAgent {
    clients: RwLock<Vec<Arc<dyn RouterClientCallback>>>,
    current_state: RwLock<HalState>,
}

impl ClientAgent {
    pub fn new() -> Self {
        ClientAgent {
            clients: RwLock::new(Vec::new()),
            current_state: RwLock::new(HalState::Shutdown),
        }
    }

    /// Register `client`. Duplicate registrations (by `Arc` identity)
    /// are ignored. If the chip is already ready and/or Bluetooth is
    /// already enabled, the corresponding lifecycle hooks fire
    /// synchronously before this call returns, so a late subscriber
    /// observes the same view an earlier one did.
    pub fn register(&self, client: Arc<dyn RouterClientCallback>) {
        {
            let mut clients = self.clients.write();
            if clients.iter().any(|existing| Arc::ptr_eq(existing, &client)) {
                log::warn!("ignoring duplicate client registration");
                return;
            }
            clients.push(client.clone());
        }

        let state = *self.current_state.read();
        if state.is_chip_ready() {
            client.on_bluetooth_chip_ready();
        }
        if state.is_bluetooth_enabled() {
            client.on_bluetooth_enabled();
        }
    }

    pub fn unregister(&self, client: &Arc<dyn RouterClientCallback>) {
        self.clients
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, client));
    }

    /// Dispatch a packet to every registered client whose declared
    /// [`crate::router::monitor::Monitor`] filters match it. Each
    /// matching client is notified via `on_packet`; the returned mode
    /// is the max over every client's matching filter mode (§4.1/§4.2).
    pub fn dispatch_packet(&self, packet: &HciPacket) -> MonitorMode {
        let clients = self.clients.read();
        let mut aggregate = MonitorMode::None;

        for client in clients.iter() {
            let mode = client.monitors().mode_for(packet);
            if mode == MonitorMode::None {
                continue;
            }
            client.on_packet(packet);
            aggregate = aggregate.max(mode);
        }

        aggregate
    }

    /// Forward a HAL state transition to every registered client,
    /// synthesizing the chip-ready/chip-closed/enabled/disabled hooks
    /// in the order the original specifies.
    pub fn notify_hal_state_change(&self, new_state: HalState, old_state: HalState) {
        debug_assert_eq!(
            *self.current_state.read(),
            old_state,
            "NotifyHalStateChange called with an old_state that doesn't match the agent's tracked state"
        );

        let was_chip_ready = old_state.is_chip_ready();
        let was_enabled = old_state.is_bluetooth_enabled();
        let now_chip_ready = new_state.is_chip_ready();
        let now_enabled = new_state.is_bluetooth_enabled();

        let clients = self.clients.read();

        for client in clients.iter() {
            client.on_hal_state_changed(new_state, old_state);
        }

        if now_chip_ready && !was_chip_ready {
            for client in clients.iter() {
                client.on_bluetooth_chip_ready();
            }
        }
        if was_enabled && !now_enabled {
            for client in clients.iter() {
                client.on_bluetooth_disabled();
            }
        }
        if !now_chip_ready && was_chip_ready {
            for client in clients.iter() {
                client.on_bluetooth_chip_closed();
            }
        }
        if now_enabled && !was_enabled {
            for client in clients.iter() {
                client.on_bluetooth_enabled();
            }
        }

        drop(clients);
        *self.current_state.write() = new_state;
    }
}

impl Default for ClientAgent {
    fn default() -> Self {
        ClientAgent::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::callback::RouterCallback;
    use crate::router::monitor::ClientMonitors;
    use parking_lot::Mutex;

    struct RecordingClient {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RouterCallback for RecordingClient {
        fn on_command_callback(&self, _packet: &HciPacket) {}
        fn on_packet_callback(&self, _packet: &HciPacket) {}
        fn on_hal_state_changed(&self, _new_state: HalState, _old_state: HalState) {}
    }

    impl RouterClientCallback for RecordingClient {
        fn monitors(&self) -> ClientMonitors {
            // No filters: this client only cares about lifecycle hooks,
            // not packet dispatch.
            ClientMonitors::default()
        }
        fn on_packet(&self, _packet: &HciPacket) {}
        fn on_bluetooth_chip_ready(&self) {
            self.events.lock().push("chip_ready");
        }
        fn on_bluetooth_chip_closed(&self) {
            self.events.lock().push("chip_closed");
        }
        fn on_bluetooth_enabled(&self) {
            self.events.lock().push("enabled");
        }
        fn on_bluetooth_disabled(&self) {
            self.events.lock().push("disabled");
        }
    }

    #[test]
    fn entering_running_fires_chip_ready_then_enabled_across_two_transitions() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let agent = ClientAgent::new();
        agent.register(Arc::new(RecordingClient {
            events: events.clone(),
        }));

        agent.notify_hal_state_change(HalState::BtChipReady, HalState::Shutdown);
        agent.notify_hal_state_change(HalState::Running, HalState::BtChipReady);

        assert_eq!(*events.lock(), vec!["chip_ready", "enabled"]);
    }

    #[test]
    fn shutdown_from_running_fires_disabled_before_chip_closed() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let agent = ClientAgent::new();
        agent.register(Arc::new(RecordingClient {
            events: events.clone(),
        }));

        // Get the agent's tracked state to Running first.
        agent.notify_hal_state_change(HalState::BtChipReady, HalState::Shutdown);
        agent.notify_hal_state_change(HalState::Running, HalState::BtChipReady);
        events.lock().clear();

        agent.notify_hal_state_change(HalState::Shutdown, HalState::Running);

        assert_eq!(*events.lock(), vec!["disabled", "chip_closed"]);
    }

    #[test]
    fn late_registration_sees_synchronous_catch_up_hooks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let agent = ClientAgent::new();
        agent.notify_hal_state_change(HalState::BtChipReady, HalState::Shutdown);
        agent.notify_hal_state_change(HalState::Running, HalState::BtChipReady);

        agent.register(Arc::new(RecordingClient {
            events: events.clone(),
        }));

        assert_eq!(*events.lock(), vec!["chip_ready", "enabled"]);
    }

    #[test]
    fn dispatch_only_notifies_clients_whose_filter_matches_and_aggregates_by_max() {
        use crate::router::monitor::Monitor;

        struct FilteredClient {
            monitors: ClientMonitors,
            seen: Arc<Mutex<Vec<HciPacket>>>,
        }

        impl RouterCallback for FilteredClient {
            fn on_command_callback(&self, _packet: &HciPacket) {}
            fn on_packet_callback(&self, _packet: &HciPacket) {}
            fn on_hal_state_changed(&self, _new_state: HalState, _old_state: HalState) {}
        }

        impl RouterClientCallback for FilteredClient {
            fn monitors(&self) -> ClientMonitors {
                self.monitors.clone()
            }
            fn on_packet(&self, packet: &HciPacket) {
                self.seen.lock().push(packet.clone());
            }
        }

        let agent = ClientAgent::new();

        let monitor_seen = Arc::new(Mutex::new(Vec::new()));
        agent.register(Arc::new(FilteredClient {
            monitors: ClientMonitors::new(vec![(Monitor::event(0x05), MonitorMode::Monitor)]),
            seen: monitor_seen.clone(),
        }));

        let intercept_seen = Arc::new(Mutex::new(Vec::new()));
        agent.register(Arc::new(FilteredClient {
            monitors: ClientMonitors::new(vec![(Monitor::event(0x05), MonitorMode::Intercept)]),
            seen: intercept_seen.clone(),
        }));

        let uninterested_seen = Arc::new(Mutex::new(Vec::new()));
        agent.register(Arc::new(FilteredClient {
            monitors: ClientMonitors::new(vec![(Monitor::event(0x0e), MonitorMode::Intercept)]),
            seen: uninterested_seen.clone(),
        }));

        let disconnect = HciPacket::new(vec![0x04, 0x05, 0x04, 0x00, 0x23, 0x01, 0x13]);
        let mode = agent.dispatch_packet(&disconnect);

        assert_eq!(mode, MonitorMode::Intercept, "max over Monitor and Intercept is Intercept");
        assert_eq!(monitor_seen.lock().len(), 1, "matching client is notified");
        assert_eq!(intercept_seen.lock().len(), 1, "matching client is notified");
        assert!(uninterested_seen.lock().is_empty(), "non-matching client is never called");
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let agent = ClientAgent::new();
        let client = Arc::new(RecordingClient {
            events: events.clone(),
        });

        agent.register(client.clone() as Arc<dyn RouterClientCallback>);
        agent.register(client as Arc<dyn RouterClientCallback>);

        agent.notify_hal_state_change(HalState::BtChipReady, HalState::Shutdown);
        assert_eq!(events.lock().len(), 1, "each client fires once, not twice");
    }
}

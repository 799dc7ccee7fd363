//! The HCI Router: HAL state machine, command flow-control queue, and
//! inbound/outbound packet dispatch (C7, §4.1).
//!
//! Grounded on `hci_router.cc`. `TxHandler`'s single worker thread is
//! [`Worker<TxTask>`] here; `SendOrQueueCommand`/`OnCommandCallbackCompleted`'s
//! front-of-queue opcode check and the `HciBusy` wakelock voting around
//! `SetBusy` are carried over directly. Command-complete/status
//! resolution runs synchronously under [`HciRouter`]'s state lock
//! rather than hopping back to the TX thread via promise/future the way
//! the original does — the lock already serializes queue access, so
//! the round trip bought nothing semantically different in Rust.

pub mod callback;
pub mod client_agent;
pub mod monitor;

use crate::activities::ConnectionActivities;
use crate::config::HalConfig;
use crate::packet::{HciPacket, HciPacketCallback};
use crate::power::{WakeSource, Wakelock};
use crate::provisioner::ChipProvisioner;
use crate::router::callback::{RouterCallback, RouterClientCallback};
use crate::router::client_agent::ClientAgent;
use crate::transport::{Transport, TransportInterfaceCallback};
use crate::types::{opcodes, EventCode, HalState, MonitorMode, PacketType};
use crate::worker::Worker;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// A queued command awaiting its command-complete/status response
/// (§3 `CommandEntry`).
struct CommandEntry {
    command: HciPacket,
    handler: HciPacketCallback,
}

enum TxTask {
    SendOrQueueCommand(HciPacket, HciPacketCallback),
    SendToTransport(HciPacket),
}

struct RouterState {
    hal_state: HalState,
    command_queue: VecDeque<CommandEntry>,
    bluetooth_enabled: bool,
}

/// The central arbiter between the stack, the transport, and any
/// in-process observers. One instance per process.
pub struct HciRouter {
    state: Mutex<RouterState>,
    stack_callback: RwLock<Option<Arc<dyn RouterCallback>>>,
    client_agent: Arc<ClientAgent>,
    transport: Arc<dyn Transport>,
    wakelock: Arc<Wakelock>,
    provisioner: ChipProvisioner,
    tx_worker: Mutex<Option<Worker<TxTask>>>,
    config: HalConfig,
    activities: Arc<ConnectionActivities>,
}

impl HciRouter {
    /// `activities` should be the same registry handed to the
    /// transport (e.g. `TransportUartH4::new`), so the rescuer's
    /// plausibility checks see the connections the router itself has
    /// observed via Connection/Disconnection Complete events.
    pub fn new(
        config: HalConfig,
        transport: Arc<dyn Transport>,
        wakelock: Arc<Wakelock>,
        provisioner: ChipProvisioner,
        activities: Arc<ConnectionActivities>,
    ) -> Arc<Self> {
        let router = Arc::new_cyclic(|weak: &Weak<HciRouter>| {
            let dispatch_weak = weak.clone();
            let tx_worker = Worker::new("bthal-router-tx", move |task: TxTask| {
                if let Some(router) = dispatch_weak.upgrade() {
                    router.dispatch_tx_task(task);
                }
            });

            HciRouter {
                state: Mutex::new(RouterState {
                    hal_state: HalState::Shutdown,
                    command_queue: VecDeque::new(),
                    bluetooth_enabled: false,
                }),
                stack_callback: RwLock::new(None),
                client_agent: Arc::new(ClientAgent::new()),
                transport,
                wakelock,
                provisioner,
                tx_worker: Mutex::new(Some(tx_worker)),
                config,
                activities,
            }
        });

        if router.config.accelerated_bt_on {
            log::info!("powering on Bluetooth chip for accelerated BT on");
            router.initialize_modules();
        }

        router
    }

    pub fn client_agent(&self) -> &Arc<ClientAgent> {
        &self.client_agent
    }

    pub fn activities(&self) -> &Arc<ConnectionActivities> {
        &self.activities
    }

    pub fn hal_state(&self) -> HalState {
        self.state.lock().hal_state
    }

    /// Register the primary stack callback and kick off bring-up.
    pub fn initialize(self: &Arc<Self>, callback: Arc<dyn RouterCallback>) -> bool {
        *self.stack_callback.write() = Some(callback);
        self.initialize_modules()
    }

    fn initialize_modules(self: &Arc<Self>) -> bool {
        let current = self.hal_state();
        match current {
            HalState::Running => {
                log::warn!("HciRouter has already initialized");
                return false;
            }
            HalState::Shutdown => {}
            HalState::BtChipReady if self.config.accelerated_bt_on => {
                self.provisioner.post_reset_firmware();
                return true;
            }
            _ => {
                log::warn!("HciRouter is initializing");
                return true;
            }
        }

        self.update_hal_state(HalState::Init);

        let transport_callback: Arc<dyn TransportInterfaceCallback> = self.clone();
        if let Err(e) = self.transport.initialize(transport_callback) {
            log::error!("failed to initialize transport: {}", e);
            self.cleanup();
            return false;
        }

        log::info!("start downloading Bluetooth firmware");
        let state_weak = Arc::downgrade(self);
        self.provisioner.post_initialize(Box::new(move |new_state| {
            if let Some(router) = state_weak.upgrade() {
                router.update_hal_state(new_state);
            }
        }));
        self.provisioner.post_download_firmware();

        true
    }

    pub fn cleanup(&self) {
        let current = self.hal_state();
        if current == HalState::Running && self.config.accelerated_bt_on {
            log::info!("keeping chip powered on for accelerated BT on; resetting firmware only");
            self.provisioner.post_reset_firmware();
            return;
        }

        self.transport.cleanup();
        self.update_hal_state(HalState::Shutdown);
        *self.stack_callback.write() = None;
    }

    /// Send any packet. Commands are routed through [`Self::send_command`]
    /// with the stack's general callback as the response handler;
    /// everything else goes straight to the transport.
    pub fn send(self: &Arc<Self>, packet: HciPacket) -> bool {
        if packet.packet_type() == Some(PacketType::Command) {
            let router = self.clone();
            return self.send_command(
                packet,
                Box::new(move |event: &HciPacket| {
                    if let Some(cb) = router.stack_callback.read().as_ref() {
                        cb.on_command_callback(event);
                    }
                }),
            );
        }
        self.post_tx(TxTask::SendToTransport(packet));
        true
    }

    /// Enqueue `packet` for transmission, guaranteeing at most one
    /// command outstanding on the transport and that `handler` runs
    /// exactly once with the matching command-complete/status event.
    pub fn send_command(&self, packet: HciPacket, handler: HciPacketCallback) -> bool {
        if packet.opcode() == Some(opcodes::GOOGLE_DEBUG_INFO) {
            // This opcode gets no completion event from the controller;
            // skip flow control entirely rather than queue forever.
            return self.send_command_no_ack(packet);
        }
        self.post_tx(TxTask::SendOrQueueCommand(packet, handler));
        true
    }

    /// Bypass the flow-control queue. The caller asserts the
    /// controller will never send a completion event for this opcode.
    pub fn send_command_no_ack(&self, packet: HciPacket) -> bool {
        self.post_tx(TxTask::SendToTransport(packet));
        true
    }

    /// Inject `packet` as if it arrived from the controller. Used for
    /// internal simulation and by vendor subsystems that synthesize
    /// events.
    pub fn send_packet_to_stack(&self, packet: HciPacket) {
        self.handle_received_packet(packet);
    }

    pub fn register_client(&self, client: Arc<dyn RouterClientCallback>) {
        self.client_agent.register(client);
    }

    pub fn unregister_client(&self, client: &Arc<dyn RouterClientCallback>) {
        self.client_agent.unregister(client);
    }

    fn post_tx(&self, task: TxTask) {
        if let Some(worker) = self.tx_worker.lock().as_ref() {
            worker.post(task);
        }
    }

    fn dispatch_tx_task(&self, task: TxTask) {
        match task {
            TxTask::SendOrQueueCommand(packet, handler) => {
                self.send_or_queue_command(packet, handler)
            }
            TxTask::SendToTransport(packet) => {
                self.send_to_transport(&packet);
            }
        }
    }

    fn send_or_queue_command(&self, packet: HciPacket, handler: HciPacketCallback) {
        let was_busy = {
            let mut state = self.state.lock();
            let was_busy = !state.command_queue.is_empty();
            state.command_queue.push_back(CommandEntry {
                command: packet.clone(),
                handler,
            });
            was_busy
        };

        if was_busy {
            log::info!("command queued: opcode {:?}", packet.opcode());
            return;
        }

        self.set_busy(true);
        self.send_to_transport(&packet);
    }

    fn send_to_transport(&self, packet: &HciPacket) -> bool {
        self.wakelock.acquire(WakeSource::Tx);
        let result = (|| {
            if !self.transport.is_active() {
                log::error!("transport not active, dropping packet");
                return false;
            }
            if self.client_agent.dispatch_packet(packet) == MonitorMode::Intercept {
                log::debug!("outgoing packet intercepted by a client");
                return true;
            }
            match self.transport.send(packet) {
                Ok(()) => true,
                Err(e) => {
                    // Transient: the entry stays queued and the HciBusy
                    // watchdog will bite if the controller never answers.
                    log::error!("transport send failed: {}", e);
                    false
                }
            }
        })();
        self.wakelock.release(WakeSource::Tx);
        result
    }

    fn set_busy(&self, busy: bool) {
        if busy {
            self.wakelock.acquire(WakeSource::HciBusy);
        } else {
            self.wakelock.release(WakeSource::HciBusy);
        }
        self.transport.set_hci_router_busy(busy);
    }

    fn handle_received_packet(&self, packet: HciPacket) {
        if packet.is_command_complete_or_status() {
            self.handle_command_response(packet);
            return;
        }

        self.update_connection_activities(&packet);

        let mode = self.client_agent.dispatch_packet(&packet);
        if mode != MonitorMode::Intercept {
            if let Some(cb) = self.stack_callback.read().as_ref() {
                cb.on_packet_callback(&packet);
            }
        }
    }

    /// Feed Connection/Disconnection Complete events into the shared
    /// connection registry the rescuer consults (§4.3, end-to-end
    /// scenario 1). Every other packet type is a no-op here.
    fn update_connection_activities(&self, packet: &HciPacket) {
        let (Some(event_code), Some(handle)) = (packet.event_code(), packet.connection_handle())
        else {
            return;
        };
        let success = packet.connection_event_status() == Some(0x00);
        match event_code {
            EventCode::ConnectionComplete => self.activities.on_connection_complete(handle, success),
            EventCode::DisconnectionComplete => {
                self.activities.on_disconnection_complete(handle, success)
            }
            _ => {}
        }
    }

    fn handle_command_response(&self, event: HciPacket) {
        let response_opcode = event.command_response_opcode();

        let entry = {
            let mut state = self.state.lock();
            let front_matches = state
                .command_queue
                .front()
                .and_then(|entry| entry.command.opcode())
                == response_opcode;
            if front_matches {
                state.command_queue.pop_front()
            } else {
                None
            }
        };

        let Some(entry) = entry else {
            log::error!(
                "command-complete/status event with unexpected opcode {:?} or empty queue",
                response_opcode
            );
            if let Some(cb) = self.stack_callback.read().as_ref() {
                cb.on_packet_callback(&event);
            }
            return;
        };

        // A client intercepting the event still pops the queue entry
        // (handled above); it just prevents the handler from running.
        if self.client_agent.dispatch_packet(&event) != MonitorMode::Intercept {
            (entry.handler)(&event);
        }

        self.maybe_mark_bluetooth_enabled(&entry.command, &event);

        let next = {
            let state = self.state.lock();
            state.command_queue.front().map(|e| e.command.clone())
        };

        self.set_busy(next.is_some());
        if let Some(next_command) = next {
            self.send_to_transport(&next_command);
        }
    }

    /// If Bluetooth isn't marked enabled yet and this is a successful
    /// HCI_Reset command-complete, mark it enabled and advance the HAL
    /// state, which in turn fires `OnBluetoothEnabled` for every client
    /// (§4.1 dispatch step 3).
    fn maybe_mark_bluetooth_enabled(&self, command: &HciPacket, response: &HciPacket) {
        const HCI_RESET_OPCODE: u16 = 0x0c03;

        if command.opcode() != Some(HCI_RESET_OPCODE) {
            return;
        }
        if response.command_response_status() != Some(0x00) {
            return;
        }

        let already_enabled = {
            let mut state = self.state.lock();
            let already = state.bluetooth_enabled;
            state.bluetooth_enabled = true;
            already
        };

        if !already_enabled && self.hal_state() == HalState::BtChipReady {
            self.update_hal_state(HalState::Running);
        }
    }

    /// Validate and apply a HAL state transition, notifying the stack
    /// callback, the client agent, and the transport in that order
    /// (§4.1: "the stack needs to be first to know, to avoid edge
    /// cases").
    pub fn update_hal_state(&self, new_state: HalState) {
        let old_state = self.hal_state();
        self.transition_to(new_state, old_state);
    }

    fn transition_to(&self, new_state: HalState, old_state: HalState) {
        if !old_state.can_transition_to(new_state) {
            if cfg!(debug_assertions) {
                panic!(
                    "invalid HAL state transition {:?} -> {:?}",
                    old_state, new_state
                );
            }
            log::error!(
                "invalid HAL state transition {:?} -> {:?}, coercing to Shutdown",
                old_state,
                new_state
            );
            self.force_state(HalState::Shutdown);
            return;
        }

        log::info!("HAL state changed: {:?} -> {:?}", old_state, new_state);
        self.force_state(new_state);

        if let Some(cb) = self.stack_callback.read().as_ref() {
            cb.on_hal_state_changed(new_state, old_state);
        }
        self.client_agent.notify_hal_state_change(new_state, old_state);
        self.transport.notify_hal_state_change(new_state);

        // Entering BtChipReady from FirmwareReady with a stack already
        // registered auto-advances to Running (accelerated BT on keeps
        // the chip up between Bluetooth off cycles, so the same chip
        // bring-up immediately becomes a running stack).
        if new_state == HalState::BtChipReady
            && old_state == HalState::FirmwareReady
            && self.stack_callback.read().is_some()
        {
            self.update_hal_state(HalState::Running);
        }
    }

    fn force_state(&self, new_state: HalState) {
        self.state.lock().hal_state = new_state;
    }
}

impl TransportInterfaceCallback for HciRouter {
    fn on_transport_packet_ready(&self, packet: &HciPacket) {
        self.wakelock.acquire(WakeSource::Rx);
        let hal_state = self.hal_state();
        if hal_state == HalState::Shutdown {
            log::warn!("HAL is not ready to receive packets");
            self.wakelock.release(WakeSource::Rx);
            return;
        }
        self.handle_received_packet(packet.clone());
        self.wakelock.release(WakeSource::Rx);
    }

    fn on_transport_closed(&self) {
        log::info!("transport closed");
        self.update_hal_state(HalState::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::ConnectionActivities;
    use crate::error::HalResult;
    use crate::transport::TransportType;
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::{AtomicBool as AB, Ordering as Ord};
    use std::sync::mpsc;

    struct StubTransport {
        active: AB,
        sent: PMutex<Vec<HciPacket>>,
    }

    impl Default for StubTransport {
        fn default() -> Self {
            StubTransport {
                active: AB::new(false),
                sent: PMutex::new(Vec::new()),
            }
        }
    }

    impl Transport for StubTransport {
        fn transport_type(&self) -> TransportType {
            TransportType::UartH4
        }
        fn initialize(&self, _callback: Arc<dyn TransportInterfaceCallback>) -> HalResult<()> {
            self.active.store(true, Ord::SeqCst);
            Ok(())
        }
        fn cleanup(&self) {
            self.active.store(false, Ord::SeqCst);
        }
        fn is_active(&self) -> bool {
            self.active.load(Ord::SeqCst)
        }
        fn send(&self, packet: &HciPacket) -> HalResult<()> {
            self.sent.lock().push(packet.clone());
            Ok(())
        }
        fn notify_hal_state_change(&self, _state: HalState) {}
    }

    fn test_router() -> (Arc<HciRouter>, Arc<StubTransport>, Arc<Wakelock>) {
        let timers = Arc::new(crate::timer::TimerService::new().unwrap());
        let power = Arc::new(crate::power::SysfsPowerInterface::new("bt"));
        let wakelock = Wakelock::new(power, timers);
        let transport = Arc::new(StubTransport::default());
        transport.active.store(true, Ord::SeqCst);
        let provisioner = ChipProvisioner::new(crate::provisioner::no_driver_factory());
        let router = HciRouter::new(
            HalConfig::default(),
            transport.clone(),
            wakelock.clone(),
            provisioner,
            Arc::new(ConnectionActivities::new()),
        );
        (router, transport, wakelock)
    }

    struct RecordingCallback {
        commands: PMutex<mpsc::Sender<HciPacket>>,
    }

    impl RouterCallback for RecordingCallback {
        fn on_command_callback(&self, packet: &HciPacket) {
            let _ = self.commands.lock().send(packet.clone());
        }
        fn on_packet_callback(&self, _packet: &HciPacket) {}
        fn on_hal_state_changed(&self, _new_state: HalState, _old_state: HalState) {}
    }

    #[test]
    fn commands_are_flow_controlled_one_at_a_time() {
        let (router, transport, _wakelock) = test_router();
        router.force_state(HalState::BtChipReady);

        let (tx, rx) = mpsc::channel();
        let reset = HciPacket::new(vec![0x01, 0x03, 0x0c, 0x00]);
        let write_le = HciPacket::new(vec![0x01, 0x6d, 0x0c, 0x02, 0x01, 0x00]);

        router.send_command(reset.clone(), Box::new(move |p| tx.send(p.clone()).unwrap()));
        let (tx2, rx2) = mpsc::channel();
        router.send_command(write_le.clone(), Box::new(move |p| tx2.send(p.clone()).unwrap()));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(transport.sent.lock().len(), 1, "second command must wait");
        assert_eq!(transport.sent.lock()[0], reset);

        let reset_complete = HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);
        router.send_packet_to_stack(reset_complete.clone());

        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(transport.sent.lock().len(), 2, "second command released after the first completes");
        assert_eq!(transport.sent.lock()[1], write_le);

        let write_le_complete = HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x6d, 0x0c, 0x00]);
        router.send_packet_to_stack(write_le_complete);
        rx2.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn successful_reset_marks_bluetooth_enabled() {
        let (router, _transport, _wakelock) = test_router();
        router.force_state(HalState::BtChipReady);

        let (tx, rx) = mpsc::channel();
        router.send_command(
            HciPacket::new(vec![0x01, 0x03, 0x0c, 0x00]),
            Box::new(move |p| tx.send(p.clone()).unwrap()),
        );
        router.send_packet_to_stack(HciPacket::new(vec![
            0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00,
        ]));
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(router.hal_state(), HalState::Running);
    }

    #[test]
    fn unexpected_opcode_is_delivered_to_stack_without_disturbing_queue() {
        let (tx, rx) = mpsc::channel();
        let (router, _transport, _wakelock) = test_router();
        router.force_state(HalState::BtChipReady);
        *router.stack_callback.write() = Some(Arc::new(RecordingCallback {
            commands: PMutex::new(tx),
        }));

        router.send_command(
            HciPacket::new(vec![0x01, 0x03, 0x0c, 0x00]),
            Box::new(|_| {}),
        );

        // An event for an opcode nobody queued.
        let stray = HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x19, 0x0c, 0x00]);
        router.send_packet_to_stack(stray.clone());

        let delivered = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(delivered, stray);

        // The reset is still queued, waiting for its own completion.
        let state = router.state.lock();
        assert_eq!(state.command_queue.len(), 1);
    }

    /// Dispatching a live Connection/Disconnection Complete event
    /// through the router (not a standalone `ConnectionActivities`)
    /// must update the same registry the rescuer consults, since that
    /// registry is shared with the transport in production (§4.3,
    /// end-to-end scenario 1).
    #[test]
    fn connection_tracking_end_to_end() {
        let (router, _transport, _wakelock) = test_router();

        let mut bytes = vec![0x04, 0x03, 0x0b, 0x00, 0x23, 0x01];
        bytes.extend_from_slice(&[0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00]);
        let connection_complete = HciPacket::new(bytes);
        assert_eq!(connection_complete.connection_event_status(), Some(0x00));
        assert_eq!(connection_complete.connection_handle(), Some(0x0123));

        router.send_packet_to_stack(connection_complete);
        assert!(router.activities().is_connected(0x0123));
        assert_eq!(router.activities().count(), 1);

        let disconnection_complete =
            HciPacket::new(vec![0x04, 0x05, 0x04, 0x00, 0x23, 0x01, 0x13]);
        router.send_packet_to_stack(disconnection_complete);
        assert_eq!(router.activities().count(), 0);
    }
}

//! Transport abstraction and registry.
//!
//! Grounded on `transport/transport_interface.{h,cc}`: a small registry
//! keyed by [`TransportType`] lets vendor backends plug in without the
//! router depending on a concrete transport, while forbidding a swap
//! of whichever transport is currently active.

pub mod packetizer;
pub mod power_manager;
pub mod rescuer;
pub mod uart_h4;
pub mod uart_manager;

use crate::error::HalResult;
use crate::packet::HciPacket;
use crate::types::HalState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a transport implementation. `UartH4` is built in; vendor
/// transports register themselves somewhere in `100..=199`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    UartH4,
    Vendor(u16),
}

impl TransportType {
    pub const VENDOR_START: u16 = 100;
    pub const VENDOR_END: u16 = 199;

    pub fn vendor(id: u16) -> Option<Self> {
        if (Self::VENDOR_START..=Self::VENDOR_END).contains(&id) {
            Some(TransportType::Vendor(id))
        } else {
            None
        }
    }
}

/// Callbacks a [`Transport`] uses to hand data and lifecycle events
/// back up to whoever initialized it (the router).
pub trait TransportInterfaceCallback: Send + Sync {
    fn on_transport_packet_ready(&self, packet: &HciPacket);
    fn on_transport_closed(&self);
}

/// A concrete data-path implementation (UART H4, or a vendor transport).
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;
    fn initialize(&self, callback: Arc<dyn TransportInterfaceCallback>) -> HalResult<()>;
    fn cleanup(&self);
    fn is_active(&self) -> bool;
    fn send(&self, packet: &HciPacket) -> HalResult<()>;
    fn notify_hal_state_change(&self, state: HalState);

    /// Hint that the router's command queue has work outstanding.
    /// UART transports have no use for this; it exists for vendor
    /// transports that can shed power more aggressively while idle.
    fn set_hci_router_busy(&self, _busy: bool) {}
}

/// Registry of available transports, keyed by [`TransportType`].
///
/// Only one transport may be active at a time; [`TransportRegistry::unregister`]
/// refuses to remove whichever transport is currently active, mirroring
/// `TransportInterface::UnregisterVendorTransport`'s guard.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Mutex<HashMap<TransportType, Arc<dyn Transport>>>,
    active: Mutex<Option<TransportType>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        TransportRegistry::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .insert(transport.transport_type(), transport);
    }

    /// Remove a registered transport. Returns `false` without removing
    /// anything if `transport_type` is the currently active transport.
    pub fn unregister(&self, transport_type: TransportType) -> bool {
        if *self.active.lock() == Some(transport_type) {
            log::warn!(
                "refusing to unregister the active transport {:?}",
                transport_type
            );
            return false;
        }
        self.transports.lock().remove(&transport_type).is_some()
    }

    pub fn get(&self, transport_type: TransportType) -> Option<Arc<dyn Transport>> {
        self.transports.lock().get(&transport_type).cloned()
    }

    pub fn mark_active(&self, transport_type: TransportType) {
        *self.active.lock() = Some(transport_type);
    }

    pub fn active(&self) -> Option<TransportType> {
        *self.active.lock()
    }
}

//! Asynchronous chip bring-up sequencer (C9).
//!
//! Grounded on `chip/async_chip_provisioner.{h,cc}` and
//! `chip_provisioner_interface.h`: a single-consumer [`Worker`] drains
//! `Initialize` / `DownloadFirmware` / `ResetFirmware` messages in the
//! order they were posted and forwards each to a pluggable
//! [`ChipDriver`], constructed lazily from a registered
//! [`ChipDriverFactory`] the first time `Initialize` runs. If the
//! factory can't produce a driver, `Initialize` is a no-op and every
//! later message is silently dropped — the router's bring-up path is
//! expected to time out and abort via the `HciBusy`/`Initialize`
//! watchdog in that case, not to get a synchronous error back here.

use crate::types::HalState;
use crate::worker::Worker;
use std::sync::Arc;

/// Reports a HAL state reached during bring-up. The provisioner
/// forwards states exactly as the driver emits them; it does not
/// dedupe or reorder.
pub type HalStateCallback = Box<dyn Fn(HalState) + Send + Sync>;

/// Vendor-specific bring-up operations the provisioner sequences.
///
/// Implementations report progress by invoking the callback handed to
/// [`ChipDriver::initialize`] as the chip moves through firmware
/// download, becomes ready, and (for boards with "accelerated BT on")
/// resets without a full power cycle.
pub trait ChipDriver: Send + Sync {
    fn initialize(&self, on_hal_state_update: HalStateCallback);
    fn download_firmware(&self);
    fn reset_firmware(&self);
}

/// Constructs a board's [`ChipDriver`]. Returns `None` if the driver
/// can't be constructed (missing device node, unsupported board,
/// vendor library absent) — the provisioner then treats `Initialize`
/// as a no-op, matching `ChipProvisionerInterface::Create`.
pub type ChipDriverFactory = Box<dyn Fn() -> Option<Arc<dyn ChipDriver>> + Send>;

/// A factory that never produces a driver. The default for boards
/// with no vendor chip provisioner registered.
pub fn no_driver_factory() -> ChipDriverFactory {
    Box::new(|| None)
}

enum Message {
    Initialize(HalStateCallback),
    DownloadFirmware,
    ResetFirmware,
}

struct Dispatcher {
    factory: ChipDriverFactory,
    driver: Option<Arc<dyn ChipDriver>>,
}

impl Dispatcher {
    fn handle(&mut self, message: Message) {
        match message {
            Message::Initialize(on_hal_state_update) => self.handle_initialize(on_hal_state_update),
            Message::DownloadFirmware => match &self.driver {
                Some(driver) => driver.download_firmware(),
                None => log::warn!("DownloadFirmware requested with no chip driver"),
            },
            Message::ResetFirmware => match &self.driver {
                Some(driver) => driver.reset_firmware(),
                None => log::warn!("ResetFirmware requested with no chip driver"),
            },
        }
    }

    fn handle_initialize(&mut self, on_hal_state_update: HalStateCallback) {
        if self.driver.is_some() {
            return;
        }
        match (self.factory)() {
            Some(driver) => {
                driver.initialize(on_hal_state_update);
                self.driver = Some(driver);
            }
            None => log::error!("failed to construct chip driver; bring-up cannot proceed"),
        }
    }
}

/// Owns the provisioner's worker thread. One instance lives for the
/// lifetime of the [`crate::router::HciRouter`] that owns it.
pub struct ChipProvisioner {
    worker: Worker<Message>,
}

impl ChipProvisioner {
    pub fn new(factory: ChipDriverFactory) -> Self {
        let mut dispatcher = Dispatcher {
            factory,
            driver: None,
        };
        let worker = Worker::new("bthal-provisioner", move |message| {
            dispatcher.handle(message);
        });
        ChipProvisioner { worker }
    }

    /// Construct (if needed) the chip driver and start its bring-up
    /// sequence. `on_hal_state_update` is called, possibly many times
    /// and from the provisioner's worker thread, as the driver reports
    /// progress.
    pub fn post_initialize(&self, on_hal_state_update: HalStateCallback) {
        self.worker.post(Message::Initialize(on_hal_state_update));
    }

    pub fn post_download_firmware(&self) {
        self.worker.post(Message::DownloadFirmware);
    }

    pub fn post_reset_firmware(&self) {
        self.worker.post(Message::ResetFirmware);
    }
}

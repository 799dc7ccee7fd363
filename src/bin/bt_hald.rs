//! Process entry point: wires the timer service, wakelock, transport,
//! and chip provisioner into an [`HciRouter`] and runs it until
//! `SIGTERM`.
//!
//! There is no vendor chip driver registered here (`no_driver_factory`);
//! a board integration supplies one through
//! [`bluetooth_hal::provisioner::ChipProvisioner::new`] instead of this
//! binary hard-coding one, matching the original's
//! `ChipProvisionerInterface::Create` factory indirection.

use bluetooth_hal::activities::ConnectionActivities;
use bluetooth_hal::config::HalConfig;
use bluetooth_hal::packet::HciPacket;
use bluetooth_hal::power::{SysfsPowerInterface, Wakelock};
use bluetooth_hal::provisioner::{no_driver_factory, ChipProvisioner};
use bluetooth_hal::router::callback::RouterCallback;
use bluetooth_hal::router::HciRouter;
use bluetooth_hal::timer::TimerService;
use bluetooth_hal::transport::uart_h4::TransportUartH4;
use bluetooth_hal::transport::Transport;
use bluetooth_hal::types::HalState;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

const DEFAULT_CONFIG_PATH: &str = "/etc/bluetooth/bt_hald.conf";

/// Set once `main` has a shutdown latch to hand to the `SIGTERM`
/// handler; signal handlers can't capture state, so this is how
/// `handle_sigterm` reaches the waiting main thread.
static SHUTDOWN: OnceLock<Arc<(Mutex<bool>, Condvar)>> = OnceLock::new();

/// The primary stack callback. A real stack client would forward these
/// to its own event loop; this binary only logs, since there is no
/// stack above the router in this crate's scope (spec.md §1).
struct LoggingRouterCallback;

impl RouterCallback for LoggingRouterCallback {
    fn on_command_callback(&self, packet: &HciPacket) {
        log::debug!(
            "command completion: opcode {:?} status {:?}",
            packet.command_response_opcode(),
            packet.command_response_status()
        );
    }

    fn on_packet_callback(&self, packet: &HciPacket) {
        log::trace!("packet from controller: {} byte(s)", packet.len());
    }

    fn on_hal_state_changed(&self, new_state: HalState, old_state: HalState) {
        log::info!("HAL state changed: {:?} -> {:?}", old_state, new_state);
        match new_state {
            HalState::Running => log::info!("Bluetooth enabled"),
            HalState::Shutdown if old_state != HalState::Shutdown => {
                log::warn!("HAL returned to Shutdown from {:?}", old_state)
            }
            _ => {}
        }
    }
}

fn install_sigterm_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(SigHandler::Handler(handle_sigterm), SaFlags::empty(), SigSet::empty());
    // SAFETY: `handle_sigterm` only touches the `SHUTDOWN` latch, which
    // is async-signal-safe (a mutex lock plus a condvar notify); no
    // allocation or unwinding happens on the signal-handling path.
    unsafe {
        sigaction(Signal::SIGTERM, &action).expect("failed to install SIGTERM handler");
    }
}

extern "C" fn handle_sigterm(_signum: i32) {
    if let Some(latch) = SHUTDOWN.get() {
        let (lock, cvar) = &**latch;
        if let Ok(mut shutting_down) = lock.lock() {
            *shutting_down = true;
            cvar.notify_all();
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = HalConfig::load(&config_path);
    log::info!("loaded configuration from {}", config_path);

    let timers = Arc::new(TimerService::new().expect("failed to create the timer service"));
    let power = Arc::new(SysfsPowerInterface::new("bt_hal"));
    let wakelock = Wakelock::new(power, timers.clone());
    let activities = Arc::new(ConnectionActivities::new());

    let transport: Arc<dyn Transport> = TransportUartH4::new(
        config.clone(),
        activities.clone(),
        wakelock.clone(),
        timers,
    );
    let provisioner = ChipProvisioner::new(no_driver_factory());

    let router = HciRouter::new(config, transport, wakelock, provisioner, activities);

    let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
    SHUTDOWN.set(shutdown.clone()).expect("main runs exactly once");
    install_sigterm_handler();

    router.initialize(Arc::new(LoggingRouterCallback));

    let (lock, cvar) = &*shutdown;
    let mut shutting_down = lock.lock().unwrap();
    while !*shutting_down {
        shutting_down = cvar.wait(shutting_down).unwrap();
    }
    drop(shutting_down);

    log::info!("SIGTERM received, tearing down the HAL");
    router.cleanup();
}

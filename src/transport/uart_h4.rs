//! The concrete H4-over-UART [`Transport`] implementation.
//!
//! Grounded on `transport/uart_h4/transport_uart_h4.cc`: power on the
//! rfkill line, open and configure the UART, start a dedicated reader
//! thread, and tie low-power-mode suspend/resume to both traffic and
//! the HAL state machine's firmware-download transitions.

use crate::activities::ConnectionActivities;
use crate::config::{BaudRate, HalConfig};
use crate::error::{HalError, HalResult};
use crate::packet::HciPacket;
use crate::power::{WakeSource, Wakelock};
use crate::timer::{Timer, TimerService};
use crate::transport::packetizer::Packetizer;
use crate::transport::power_manager::PowerManager;
use crate::transport::rescuer;
use crate::transport::uart_manager::UartHandle;
use crate::transport::{Transport, TransportInterfaceCallback, TransportType};
use crate::types::HalState;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::read;
use parking_lot::Mutex;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the reader thread will wait for more bytes while a packet
/// is mid-assembly before concluding the stream is desynced and
/// invoking the rescuer.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// How many trailing raw bytes are retained for the rescuer to scan
/// once a stall is detected.
const RESCUE_WINDOW: usize = 64;

struct Session {
    uart: UartHandle,
    reader: JoinHandle<()>,
    stop_requested: Arc<AtomicBool>,
}

pub struct TransportUartH4 {
    config: HalConfig,
    power_manager: Arc<PowerManager>,
    activities: Arc<ConnectionActivities>,
    wakelock: Arc<Wakelock>,
    timers: Arc<TimerService>,
    session: Mutex<Option<Session>>,
    callback: Mutex<Option<Arc<dyn TransportInterfaceCallback>>>,
    is_lpm_resumed: AtomicBool,
    lpm_timer: Mutex<Option<Timer>>,
    transport_wakelock_enabled: AtomicBool,
    self_weak: Mutex<Weak<TransportUartH4>>,
}

impl TransportUartH4 {
    pub fn new(
        config: HalConfig,
        activities: Arc<ConnectionActivities>,
        wakelock: Arc<Wakelock>,
        timers: Arc<TimerService>,
    ) -> Arc<Self> {
        let power_manager = Arc::new(PowerManager::new(config.clone()));
        let transport_wakelock_enabled = config.transport_wakelock_enabled;
        Arc::new_cyclic(|weak| TransportUartH4 {
            config,
            power_manager,
            activities,
            wakelock,
            timers,
            session: Mutex::new(None),
            callback: Mutex::new(None),
            is_lpm_resumed: AtomicBool::new(false),
            lpm_timer: Mutex::new(None),
            transport_wakelock_enabled: AtomicBool::new(transport_wakelock_enabled),
            self_weak: Mutex::new(weak.clone()),
        })
    }

    fn setup_low_power_mode(&self) -> bool {
        if !self.config.low_power_mode_supported {
            return true;
        }
        self.power_manager.setup_low_power_mode()
    }

    fn teardown_low_power_mode(&self) {
        if !self.config.low_power_mode_supported {
            return;
        }
        *self.lpm_timer.lock() = None;
        self.suspend_to_low_power_mode();
        self.power_manager.teardown_low_power_mode();
    }

    fn resume_from_low_power_mode(&self) -> bool {
        if !self.config.low_power_mode_supported
            || !self.power_manager.is_low_power_mode_setup_completed()
            || self.is_lpm_resumed.load(Ordering::Acquire)
        {
            return true;
        }
        if self.transport_wakelock_enabled.load(Ordering::Acquire) {
            self.wakelock.acquire(WakeSource::Transport);
        }
        if !self.power_manager.resume_from_low_power_mode() {
            return false;
        }
        self.is_lpm_resumed.store(true, Ordering::Release);
        true
    }

    fn suspend_to_low_power_mode(&self) -> bool {
        if !self.config.low_power_mode_supported
            || !self.power_manager.is_low_power_mode_setup_completed()
            || !self.is_lpm_resumed.load(Ordering::Acquire)
        {
            return true;
        }
        if self.transport_wakelock_enabled.load(Ordering::Acquire) {
            self.wakelock.release(WakeSource::Transport);
        }
        if !self.power_manager.suspend_to_low_power_mode() {
            return false;
        }
        self.is_lpm_resumed.store(false, Ordering::Release);
        true
    }

    /// Re-arm the timer that drops the chip back into low-power sleep
    /// after `lpm_timeout_ms` of no outgoing traffic (§4.5: "arm a timer
    /// to re-sleep the chip after idle"). A no-op if LPM isn't resumed
    /// or the weak self-reference hasn't upgraded (post-drop).
    fn refresh_lpm_timer(&self) {
        if !self.is_lpm_resumed.load(Ordering::Acquire) {
            return;
        }
        let Some(this) = self.self_weak.lock().upgrade() else {
            return;
        };
        let timer = self.timers.schedule(
            Duration::from_millis(self.config.lpm_timeout_ms),
            move || {
                this.suspend_to_low_power_mode();
            },
        );
        *self.lpm_timer.lock() = Some(timer);
    }

    fn reader_loop(
        uart_fd: std::os::fd::RawFd,
        stop_requested: Arc<AtomicBool>,
        activities: Arc<ConnectionActivities>,
        callback: Arc<dyn TransportInterfaceCallback>,
        enhanced_packet_validation: bool,
    ) {
        let mut packetizer = Packetizer::new();
        let mut tail: Vec<u8> = Vec::with_capacity(RESCUE_WINDOW);
        let mut buffer = [0u8; 1024];

        // SAFETY: the fd outlives this thread; `session` holds the
        // owning `UartHandle` until `stop()` joins this thread.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(uart_fd) };

        while !stop_requested.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            let timeout = PollTimeout::try_from(STALL_TIMEOUT.as_millis() as u32)
                .unwrap_or(PollTimeout::MAX);
            let ready = match poll(&mut fds, timeout) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    log::error!("poll on UART fd failed: {}", e);
                    break;
                }
            };

            if ready == 0 {
                // Nothing to read this cycle: if we're stuck mid-packet,
                // try to resynchronize on whatever trailing bytes we have.
                continue;
            }

            let n = match read(uart_fd, &mut buffer) {
                Ok(0) => {
                    log::info!("UART closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    log::error!("UART read failed: {}", e);
                    break;
                }
            };

            let chunk = &buffer[..n];
            tail.extend_from_slice(chunk);
            if tail.len() > RESCUE_WINDOW {
                let excess = tail.len() - RESCUE_WINDOW;
                tail.drain(..excess);
            }

            let packets = packetizer.process(chunk);
            if enhanced_packet_validation && packets.is_empty() && n > 0 {
                // Could be legitimately mid-packet; only treat it as
                // framing corruption if a resync point actually exists
                // strictly after the current read position, which would
                // mean a type-indicator-looking byte got swallowed as
                // payload instead of being parsed as a new frame start.
                if let Some(offset) = rescuer::find_resync_point(&tail[1..], &activities) {
                    log::warn!(
                        "resynchronizing HCI stream, skipping {} byte(s)",
                        offset + 1
                    );
                    packetizer = Packetizer::new();
                    let resumed = packetizer.process(&tail[offset + 1..]);
                    for packet in resumed {
                        callback.on_transport_packet_ready(&packet);
                    }
                    tail.clear();
                    continue;
                }
            }

            for packet in packets {
                callback.on_transport_packet_ready(&packet);
            }
        }
    }
}

impl Transport for TransportUartH4 {
    fn transport_type(&self) -> TransportType {
        TransportType::UartH4
    }

    fn initialize(&self, callback: Arc<dyn TransportInterfaceCallback>) -> HalResult<()> {
        self.power_manager.power_control(false);
        if !self.power_manager.power_control(true) {
            return Err(HalError::Transport("cannot power on the device".into()));
        }

        let uart = UartHandle::open(&self.config.uart_device_path, BaudRate::Rate115200)
            .map_err(|e| HalError::Transport(format!("cannot open UART: {}", e)))?;

        self.power_manager
            .config_rx_wakelock_time(self.config.kernel_rx_wakelock_time_ms);

        *self.callback.lock() = Some(callback.clone());

        let fd = uart.raw_fd();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop_requested = stop_requested.clone();
            let activities = self.activities.clone();
            let enhanced_packet_validation = self.config.enhanced_packet_validation;
            std::thread::Builder::new()
                .name("bthal-uart-reader".to_string())
                .spawn(move || {
                    Self::reader_loop(
                        fd,
                        stop_requested,
                        activities,
                        callback,
                        enhanced_packet_validation,
                    )
                })
                .map_err(|e| HalError::Transport(format!("cannot spawn reader thread: {}", e)))?
        };

        *self.session.lock() = Some(Session {
            uart,
            reader,
            stop_requested,
        });

        log::info!("transport_uart_h4 initialization completed");
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(session) = self.session.lock().take() {
            session.stop_requested.store(true, Ordering::Release);
            let _ = session.reader.join();
        }
        self.power_manager.power_control(false);
        if let Some(callback) = self.callback.lock().take() {
            callback.on_transport_closed();
        }
    }

    fn is_active(&self) -> bool {
        self.session.lock().is_some()
    }

    fn send(&self, packet: &HciPacket) -> HalResult<()> {
        self.resume_from_low_power_mode();

        let fd = {
            let session = self.session.lock();
            let Some(session) = session.as_ref() else {
                return Err(HalError::Transport("transport not initialized".into()));
            };
            session.uart.raw_fd()
        };

        let bytes = packet.as_bytes();
        let result = nix::unistd::write(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            bytes,
        )
        .map(|_| ())
        .map_err(|e| HalError::Transport(format!("UART write failed: {}", e)));

        self.refresh_lpm_timer();
        result
    }

    fn notify_hal_state_change(&self, state: HalState) {
        match state {
            HalState::FirmwareDownloading => {
                if self.config.fast_firmware_download {
                    if let Some(session) = self.session.lock().as_ref() {
                        let _ = session.uart.update_baud_rate(self.config.uart_baud_rate);
                    }
                }
            }
            HalState::FirmwareDownloadCompleted => {
                if self.config.fast_firmware_download {
                    if let Some(session) = self.session.lock().as_ref() {
                        let _ = session.uart.update_baud_rate(BaudRate::Rate115200);
                    }
                }
            }
            HalState::FirmwareReady => {
                if let Some(session) = self.session.lock().as_ref() {
                    let _ = session.uart.update_baud_rate(self.config.uart_baud_rate);
                }
                self.setup_low_power_mode();
                self.resume_from_low_power_mode();
            }
            _ => {}
        }
    }
}

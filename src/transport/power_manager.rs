//! Device power sequencing: rfkill power control and the LPM proc-node
//! protocol.
//!
//! Grounded directly on `transport/device_control/power_manager.cc`.
//! If the board has no rfkill line for Bluetooth, `power_control` is a
//! no-op success — the original logs "not controlled by Bluetooth HAL"
//! and returns true rather than treating it as an error.

use crate::config::HalConfig;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Write};

const LPM_WAKEUP_SETTLEMENT: std::time::Duration = std::time::Duration::from_millis(10);

pub struct PowerManager {
    config: HalConfig,
    lpm_fd: Mutex<Option<std::fs::File>>,
}

impl PowerManager {
    pub fn new(config: HalConfig) -> Self {
        PowerManager {
            config,
            lpm_fd: Mutex::new(None),
        }
    }

    fn rfkill_state_path(&self) -> Option<String> {
        for i in 0.. {
            let type_path = format!("{}{}/type", self.config.rfkill_folder_prefix, i);
            let mut file = match std::fs::File::open(&type_path) {
                Ok(f) => f,
                Err(_) => break,
            };

            let mut contents = String::new();
            if file.read_to_string(&mut contents).unwrap_or(0) == 0 {
                continue;
            }
            let contents = contents.trim_end_matches('\n');

            log::debug!("rfkill candidate {} is [{}]", type_path, contents);

            if contents == self.config.rfkill_type_bluetooth {
                let state_path = format!("{}{}/state", self.config.rfkill_folder_prefix, i);
                log::info!("using rfkill {}", state_path);
                return Some(state_path);
            }
        }
        None
    }

    /// Power the radio on or off via rfkill. Returns `Ok(())` even if
    /// there is no matching rfkill device — the radio is then assumed
    /// to not be power-sequenced by this HAL at all.
    pub fn power_control(&self, enabled: bool) -> bool {
        let Some(state_path) = self.rfkill_state_path() else {
            log::info!("power sequence is not controlled by Bluetooth HAL");
            return true;
        };

        let file = OpenOptions::new().write(true).open(&state_path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                log::error!("unable to open rfkill state {}: {}", state_path, e);
                return false;
            }
        };

        log::info!(
            "{} rfkill state_path: {}",
            if enabled { "enabling" } else { "disabling" },
            state_path
        );

        let byte = if enabled { b'1' } else { b'0' };
        match file.write_all(&[byte]) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to change rfkill state: {}", e);
                false
            }
        }
    }

    pub fn setup_low_power_mode(&self) -> bool {
        log::info!("LPM enabling");

        let lpm_fd = match OpenOptions::new().write(true).open(&self.config.lpm_waking_proc_node) {
            Ok(f) => f,
            Err(e) => {
                log::warn!(
                    "unable to open LPM control port ({}): {}",
                    self.config.lpm_waking_proc_node,
                    e
                );
                return false;
            }
        };

        let enable_result = OpenOptions::new()
            .write(true)
            .open(&self.config.lpm_enable_proc_node)
            .and_then(|mut f| f.write_all(b"1"));

        if let Err(e) = enable_result {
            log::warn!(
                "unable to enable LPM driver ({}): {}",
                self.config.lpm_enable_proc_node,
                e
            );
            self.teardown_low_power_mode();
            return false;
        }

        *self.lpm_fd.lock() = Some(lpm_fd);

        if let Err(e) = self.write_lpm(b'1') {
            log::warn!("unable to wake up LPM: {}", e);
            self.teardown_low_power_mode();
            return false;
        }

        true
    }

    pub fn teardown_low_power_mode(&self) {
        log::info!("LPM disabling");
        *self.lpm_fd.lock() = None;

        let result = OpenOptions::new()
            .write(true)
            .open(&self.config.lpm_enable_proc_node)
            .and_then(|mut f| f.write_all(b"0"));

        if let Err(e) = result {
            log::warn!(
                "unable to disable LPM driver ({}): {}",
                self.config.lpm_enable_proc_node,
                e
            );
        }
    }

    pub fn resume_from_low_power_mode(&self) -> bool {
        if self.lpm_fd.lock().is_none() {
            return true;
        }
        if let Err(e) = self.write_lpm(b'1') {
            log::error!("unable to wake up LPM: {}", e);
            return false;
        }
        std::thread::sleep(LPM_WAKEUP_SETTLEMENT);
        true
    }

    pub fn suspend_to_low_power_mode(&self) -> bool {
        if self.lpm_fd.lock().is_none() {
            return true;
        }
        if let Err(e) = self.write_lpm(b'0') {
            log::error!("unable to suspend LPM: {}", e);
            return false;
        }
        true
    }

    pub fn is_low_power_mode_setup_completed(&self) -> bool {
        self.lpm_fd.lock().is_some()
    }

    fn write_lpm(&self, byte: u8) -> std::io::Result<()> {
        let mut guard = self.lpm_fd.lock();
        match guard.as_mut() {
            Some(f) => f.write_all(&[byte]),
            None => Ok(()),
        }
    }

    pub fn config_rx_wakelock_time(&self, duration_ms: i32) -> bool {
        if duration_ms == 0 {
            return true;
        }
        if duration_ms < 0 {
            log::warn!("invalid rx wakelock duration: {}", duration_ms);
            return false;
        }

        log::info!("config rx wakelock time: {}", duration_ms);

        let mut file = match OpenOptions::new()
            .write(true)
            .open(&self.config.lpm_wakelock_ctrl_proc_node)
        {
            Ok(f) => f,
            Err(e) => {
                log::warn!(
                    "unable to open kernel wakelock control port ({}): {}",
                    self.config.lpm_wakelock_ctrl_proc_node,
                    e
                );
                return false;
            }
        };

        match file.write_all(&duration_ms.to_ne_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("unable to config kernel wakelock time: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_control_without_rfkill_device_succeeds() {
        let mut config = HalConfig::default();
        config.rfkill_folder_prefix = "/nonexistent/rfkill".to_string();
        let manager = PowerManager::new(config);
        assert!(manager.power_control(true));
    }

    #[test]
    fn rx_wakelock_time_of_zero_is_a_no_op_success() {
        let manager = PowerManager::new(HalConfig::default());
        assert!(manager.config_rx_wakelock_time(0));
    }

    #[test]
    fn negative_rx_wakelock_time_is_rejected() {
        let manager = PowerManager::new(HalConfig::default());
        assert!(!manager.config_rx_wakelock_time(-1));
    }
}

//! Configuration loading.
//!
//! Grounded on `HalConfigLoader`: a JSON file is read once at startup;
//! a missing file or a parse error both fall back to
//! [`HalConfig::default`] rather than failing bring-up.

use serde::Deserialize;
use std::path::Path;

/// UART baud rate, named the way the original's `BaudRate` enum names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BaudRate {
    #[serde(rename = "115200")]
    Rate115200,
    #[serde(rename = "3000000")]
    Rate3000000,
    #[serde(rename = "4000000")]
    Rate4000000,
}

impl BaudRate {
    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::Rate115200 => 115_200,
            BaudRate::Rate3000000 => 3_000_000,
            BaudRate::Rate4000000 => 4_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    /// Start chip bring-up as soon as the router is constructed,
    /// rather than waiting for the stack to call `Initialize`.
    pub accelerated_bt_on: bool,

    /// Path to the H4 UART character device.
    pub uart_device_path: String,

    /// Baud rate used once firmware download begins.
    pub uart_baud_rate: BaudRate,

    /// Whether the LPM sysfs protocol is supported by this board.
    pub low_power_mode_supported: bool,

    /// How long the transport waits idle before suspending to LPM.
    pub lpm_timeout_ms: u64,

    /// rfkill sysfs directory prefix, e.g. `/sys/class/rfkill/rfkill`.
    pub rfkill_folder_prefix: String,

    /// The rfkill `type` file contents identifying the Bluetooth radio.
    pub rfkill_type_bluetooth: String,

    /// proc node toggled to enable/disable the host LPM driver.
    pub lpm_enable_proc_node: String,

    /// proc node written to wake/sleep the LPM-enabled UART.
    pub lpm_waking_proc_node: String,

    /// proc node used to configure the kernel rx wakelock timeout.
    pub lpm_wakelock_ctrl_proc_node: String,

    /// Kernel rx wakelock hold time in milliseconds; 0 disables it.
    pub kernel_rx_wakelock_time_ms: i32,

    /// Whether the transport itself votes the `Transport` wakelock
    /// while resumed from low power mode.
    pub transport_wakelock_enabled: bool,

    /// Ordered list of transport identifiers to try, by
    /// [`crate::transport::TransportType`] name (`"uart_h4"` or a
    /// vendor id string): the first entry that successfully
    /// initializes would become the active transport. Recognized and
    /// preserved per spec.md §6; this crate registers only the UART H4
    /// transport, so there is nothing to arbitrate between yet — a
    /// board with a registered vendor transport is what would exercise
    /// [`crate::transport::TransportRegistry`] against this list.
    pub transport_priority: Vec<String>,

    /// Use a configured high baud rate for firmware download instead
    /// of staying at 115200 for the whole download.
    pub fast_firmware_download: bool,

    /// Enables the packet rescuer's post-framing-error resynchronization
    /// scan. Disabled boards drop bytes until the stream resyncs
    /// naturally instead.
    pub enhanced_packet_validation: bool,

    /// Minimum gap, in seconds, the transport enforces between two
    /// vendor-reported transport crashes before treating a further
    /// crash as a repeat of the same underlying fault rather than a
    /// fresh incident.
    pub vendor_transport_crash_interval_sec: u64,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            accelerated_bt_on: false,
            uart_device_path: "/dev/ttyBT".to_string(),
            uart_baud_rate: BaudRate::Rate3000000,
            low_power_mode_supported: false,
            lpm_timeout_ms: 500,
            rfkill_folder_prefix: "/sys/class/rfkill/rfkill".to_string(),
            rfkill_type_bluetooth: "bluetooth".to_string(),
            lpm_enable_proc_node: "/proc/bluetooth/sleep/lpm".to_string(),
            lpm_waking_proc_node: "/proc/bluetooth/sleep/btwrite".to_string(),
            lpm_wakelock_ctrl_proc_node: "/proc/bluetooth/sleep/proto".to_string(),
            kernel_rx_wakelock_time_ms: 0,
            transport_wakelock_enabled: true,
            transport_priority: vec!["uart_h4".to_string()],
            fast_firmware_download: true,
            enhanced_packet_validation: true,
            vendor_transport_crash_interval_sec: 60,
        }
    }
}

impl HalConfig {
    /// Load configuration from `path`, falling back to defaults and
    /// logging a warning if the file is missing or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("failed to parse HAL config {}: {}", path.display(), e);
                    HalConfig::default()
                }
            },
            Err(e) => {
                log::warn!("failed to read HAL config {}: {}", path.display(), e);
                HalConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = HalConfig::load("/nonexistent/path/to/hal_config.json");
        assert_eq!(config.uart_device_path, HalConfig::default().uart_device_path);
    }

    #[test]
    fn malformed_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let config = HalConfig::load(&path);
        assert_eq!(config.lpm_timeout_ms, HalConfig::default().lpm_timeout_ms);
    }
}

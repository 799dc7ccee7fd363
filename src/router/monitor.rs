//! Monitor filters a registered client declares interest through
//! (C11, spec.md §3/§4.2/§6).
//!
//! A client does not see every packet the router handles; it declares
//! a list of [`Monitor`] filters, each paired with the [`MonitorMode`]
//! it wants applied when that filter matches. [`ClientMonitors::mode_for`]
//! folds a client's whole filter list down to the single mode that
//! applies to a given packet, which [`crate::router::client_agent::ClientAgent`]
//! then aggregates (by `max`) across every registered client.

use crate::packet::HciPacket;
use crate::types::MonitorMode;

/// A single match rule, grounded on spec.md §3's four named variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    /// Matches an outgoing command carrying this opcode.
    Command(u16),
    /// Matches a command-complete event reporting this opcode.
    CommandComplete(u16),
    /// Matches any event with this event code, optionally narrowed to
    /// a specific byte value at a fixed offset into the event's
    /// parameters (e.g. a vendor subcode).
    Event {
        event_code: u8,
        subcode: Option<EventSubcode>,
    },
    /// Matches a BLE Meta (`0x3e`) event with this sub-event code.
    BleMeta(u8),
}

/// A sub-code match narrowing an [`Monitor::Event`] filter: the byte
/// at `offset` into the event's parameters must equal `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubcode {
    pub offset: usize,
    pub value: u8,
}

impl Monitor {
    /// Convenience constructor for an event filter with no subcode
    /// narrowing.
    pub fn event(event_code: u8) -> Self {
        Monitor::Event {
            event_code,
            subcode: None,
        }
    }

    /// Convenience constructor for an event filter narrowed to a
    /// subcode byte at `offset`.
    pub fn event_with_subcode(event_code: u8, offset: usize, value: u8) -> Self {
        Monitor::Event {
            event_code,
            subcode: Some(EventSubcode { offset, value }),
        }
    }

    /// Whether `packet` satisfies this filter.
    pub fn matches(&self, packet: &HciPacket) -> bool {
        match *self {
            Monitor::Command(opcode) => packet.opcode() == Some(opcode),
            Monitor::CommandComplete(opcode) => {
                packet.is_command_complete_or_status()
                    && packet.command_response_opcode() == Some(opcode)
            }
            Monitor::Event { event_code, subcode } => {
                let Some(raw) = packet.raw_event_code() else {
                    return false;
                };
                if raw != event_code {
                    return false;
                }
                match subcode {
                    None => true,
                    Some(EventSubcode { offset, value }) => packet
                        .parameters()
                        .and_then(|params| params.get(offset))
                        .is_some_and(|&b| b == value),
                }
            }
            Monitor::BleMeta(subcode) => packet.ble_subevent_code() == Some(subcode),
        }
    }
}

/// One client's declared `(filter, mode)` list, in the order the
/// client registered them.
#[derive(Debug, Clone, Default)]
pub struct ClientMonitors(Vec<(Monitor, MonitorMode)>);

impl ClientMonitors {
    pub fn new(entries: Vec<(Monitor, MonitorMode)>) -> Self {
        ClientMonitors(entries)
    }

    /// The mode that applies to `packet` for this client: the maximum
    /// mode over every filter that matches, or [`MonitorMode::None`]
    /// if nothing matches.
    pub fn mode_for(&self, packet: &HciPacket) -> MonitorMode {
        self.0
            .iter()
            .filter(|(monitor, _)| monitor.matches(packet))
            .map(|(_, mode)| *mode)
            .max()
            .unwrap_or(MonitorMode::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_command() -> HciPacket {
        HciPacket::new(vec![0x01, 0x03, 0x0c, 0x00])
    }

    fn reset_complete() -> HciPacket {
        HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00])
    }

    #[test]
    fn command_monitor_matches_by_opcode() {
        let monitor = Monitor::Command(0x0c03);
        assert!(monitor.matches(&reset_command()));
        assert!(!monitor.matches(&reset_complete()));
    }

    #[test]
    fn command_complete_monitor_matches_the_reported_opcode() {
        assert!(Monitor::CommandComplete(0x0c03).matches(&reset_complete()));
        assert!(!Monitor::CommandComplete(0x0c04).matches(&reset_complete()));
    }

    #[test]
    fn event_monitor_with_subcode_narrows_the_match() {
        let le_connection_complete =
            HciPacket::new(vec![0x04, 0x3e, 0x13, 0x01, 0x00, 0x23, 0x01]);
        let matches_subevent_1 = Monitor::event_with_subcode(0x3e, 0, 0x01);
        let matches_subevent_2 = Monitor::event_with_subcode(0x3e, 0, 0x02);

        assert!(matches_subevent_1.matches(&le_connection_complete));
        assert!(!matches_subevent_2.matches(&le_connection_complete));
    }

    #[test]
    fn ble_meta_monitor_matches_subevent_code() {
        let monitor = Monitor::BleMeta(0x01);
        let packet = HciPacket::new(vec![0x04, 0x3e, 0x01, 0x01]);
        assert!(monitor.matches(&packet));
        assert!(!Monitor::BleMeta(0x02).matches(&packet));
    }

    #[test]
    fn client_monitors_aggregates_to_the_max_matching_mode() {
        let monitors = ClientMonitors::new(vec![
            (Monitor::Command(0x0c03), MonitorMode::Monitor),
            (Monitor::event(0x05), MonitorMode::Intercept),
        ]);

        assert_eq!(monitors.mode_for(&reset_command()), MonitorMode::Monitor);
        assert_eq!(
            monitors.mode_for(&HciPacket::new(vec![0x04, 0x05, 0x04, 0x00, 0x23, 0x01, 0x13])),
            MonitorMode::Intercept
        );
        assert_eq!(monitors.mode_for(&reset_complete()), MonitorMode::None);
    }
}

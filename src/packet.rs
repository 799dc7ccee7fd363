//! The H4-framed packet value type, [`HciPacket`].

use crate::types::{EventCode, PacketType};

/// An owned HCI packet, including its leading H4 type-indicator byte.
///
/// Accessors that require a particular packet type or a minimum length
/// return `None` rather than panicking; the packetizer is responsible
/// for ensuring frames reaching a [`crate::router::HciRouter`] are
/// well formed, but nothing stops a caller from handing this type a
/// stray byte slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket(Vec<u8>);

impl HciPacket {
    pub fn new(bytes: Vec<u8>) -> Self {
        HciPacket(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.0.first().copied().and_then(PacketType::from_indicator)
    }

    /// The command opcode, for `Command`-type packets.
    pub fn opcode(&self) -> Option<u16> {
        if self.packet_type() != Some(PacketType::Command) {
            return None;
        }
        let b = self.0.get(1..3)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    /// The event code, for `Event`-type packets.
    pub fn event_code(&self) -> Option<EventCode> {
        if self.packet_type() != Some(PacketType::Event) {
            return None;
        }
        self.0.get(1).copied().map(EventCode::from_code)
    }

    /// The raw event code byte, for `Event`-type packets. Unlike
    /// [`Self::event_code`], this is never folded into
    /// [`EventCode::Other`] — callers matching on an arbitrary
    /// (including vendor) event code by its literal value want the
    /// byte itself, not the interpreted enum.
    pub fn raw_event_code(&self) -> Option<u8> {
        if self.packet_type() != Some(PacketType::Event) {
            return None;
        }
        self.0.get(1).copied()
    }

    /// The connection handle carried by an ACL packet, masked to 12 bits.
    pub fn acl_handle(&self) -> Option<u16> {
        if self.packet_type() != Some(PacketType::Acl) {
            return None;
        }
        let b = self.0.get(1..3)?;
        Some(u16::from_le_bytes([b[0], b[1]]) & 0x0fff)
    }

    /// Whether this packet is a command-complete or command-status
    /// event, i.e. one that must be matched against the router's
    /// outstanding command queue rather than dispatched as ordinary
    /// controller-originated traffic.
    pub fn is_command_complete_or_status(&self) -> bool {
        matches!(
            self.event_code(),
            Some(EventCode::CommandComplete) | Some(EventCode::CommandStatus)
        )
    }

    /// The opcode a command-complete or command-status event is
    /// reporting on. `None` for any other packet.
    ///
    /// Command Complete parameters are `[num_hci_command_packets, opcode_lo,
    /// opcode_hi, ...]`; Command Status parameters are `[status,
    /// num_hci_command_packets, opcode_lo, opcode_hi]`.
    pub fn command_response_opcode(&self) -> Option<u16> {
        let params = self.parameters()?;
        match self.event_code()? {
            EventCode::CommandComplete => {
                let b = params.get(1..3)?;
                Some(u16::from_le_bytes([b[0], b[1]]))
            }
            EventCode::CommandStatus => {
                let b = params.get(2..4)?;
                Some(u16::from_le_bytes([b[0], b[1]]))
            }
            _ => None,
        }
    }

    /// The status byte of a command-complete or command-status event.
    pub fn command_response_status(&self) -> Option<u8> {
        let params = self.parameters()?;
        match self.event_code()? {
            EventCode::CommandComplete => params.get(3).copied(),
            EventCode::CommandStatus => params.first().copied(),
            _ => None,
        }
    }

    /// The BLE subevent code of a `BleMeta` event's first parameter byte.
    pub fn ble_subevent_code(&self) -> Option<u8> {
        if self.event_code() != Some(EventCode::BleMeta) {
            return None;
        }
        self.parameters()?.first().copied()
    }

    /// The connection handle carried by this packet, regardless of
    /// whether it is ACL/SCO/ISO data or a Connection/Disconnection
    /// Complete event. Masked to 12 bits where the wire format packs
    /// flag bits alongside the handle.
    pub fn connection_handle(&self) -> Option<u16> {
        match self.packet_type()? {
            PacketType::Acl | PacketType::Iso => {
                let b = self.0.get(1..3)?;
                Some(u16::from_le_bytes([b[0], b[1]]) & 0x0fff)
            }
            PacketType::Sco => {
                let b = self.0.get(1..3)?;
                Some(u16::from_le_bytes([b[0], b[1]]) & 0x0fff)
            }
            PacketType::Event => match self.event_code()? {
                EventCode::ConnectionComplete | EventCode::DisconnectionComplete => {
                    let params = self.parameters()?;
                    let b = params.get(1..3)?;
                    Some(u16::from_le_bytes([b[0], b[1]]))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// The status byte of a Connection/Disconnection Complete event
    /// (`0x00` means success).
    pub fn connection_event_status(&self) -> Option<u8> {
        match self.event_code()? {
            EventCode::ConnectionComplete | EventCode::DisconnectionComplete => {
                self.parameters()?.first().copied()
            }
            _ => None,
        }
    }

    /// The parameter/payload bytes, i.e. everything after the type
    /// indicator and the type's fixed preamble.
    pub fn parameters(&self) -> Option<&[u8]> {
        let pt = self.packet_type()?;
        self.0.get(1 + pt.preamble_len()..)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for HciPacket {
    fn from(bytes: Vec<u8>) -> Self {
        HciPacket::new(bytes)
    }
}

/// A callback invoked with the command-complete/status event
/// correlated to a previously sent command.
pub type HciPacketCallback = Box<dyn FnOnce(&HciPacket) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_opcode_round_trips() {
        let pkt = HciPacket::new(vec![0x01, 0x03, 0x0c, 0x00]);
        assert_eq!(pkt.packet_type(), Some(PacketType::Command));
        assert_eq!(pkt.opcode(), Some(0x0c03));
    }

    #[test]
    fn acl_handle_is_masked_to_12_bits() {
        let pkt = HciPacket::new(vec![0x02, 0xff, 0xff, 0x00, 0x00]);
        assert_eq!(pkt.acl_handle(), Some(0x0fff));
    }

    #[test]
    fn event_code_maps_known_values() {
        let pkt = HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);
        assert_eq!(pkt.event_code(), Some(EventCode::CommandComplete));
    }

    #[test]
    fn short_packet_returns_none_instead_of_panicking() {
        let pkt = HciPacket::new(vec![0x01]);
        assert_eq!(pkt.opcode(), None);
        assert_eq!(pkt.parameters(), None);
    }

    #[test]
    fn command_complete_opcode_and_status_are_read_past_num_packets() {
        // Command Complete for HCI_Reset: num_packets=1, opcode=0x0c03, status=0x00.
        let pkt = HciPacket::new(vec![0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);
        assert!(pkt.is_command_complete_or_status());
        assert_eq!(pkt.command_response_opcode(), Some(0x0c03));
        assert_eq!(pkt.command_response_status(), Some(0x00));
    }

    #[test]
    fn command_status_opcode_is_read_after_status_and_num_packets() {
        let pkt = HciPacket::new(vec![0x04, 0x0f, 0x04, 0x00, 0x01, 0x03, 0x0c]);
        assert!(pkt.is_command_complete_or_status());
        assert_eq!(pkt.command_response_opcode(), Some(0x0c03));
        assert_eq!(pkt.command_response_status(), Some(0x00));
    }

    #[test]
    fn connection_complete_handle_and_status() {
        let mut bytes = vec![0x04, 0x03, 0x0b, 0x00, 0x23, 0x01];
        bytes.extend_from_slice(&[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]); // BD_ADDR
        bytes.push(0x01); // Link_Type
        bytes.push(0x00); // Encryption_Enabled
        let pkt = HciPacket::new(bytes);
        assert_eq!(pkt.connection_event_status(), Some(0x00));
        assert_eq!(pkt.connection_handle(), Some(0x0123));
    }

    #[test]
    fn ble_meta_subevent_code_is_first_parameter_byte() {
        let pkt = HciPacket::new(vec![0x04, 0x3e, 0x01, 0x02]);
        assert_eq!(pkt.ble_subevent_code(), Some(0x02));
    }
}

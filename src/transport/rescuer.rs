//! Re-synchronizes the UART byte stream after a framing error.
//!
//! Grounded on `transport/hci_packet_rescuer.cc`: when the packetizer
//! gets far enough out of sync that a length field can no longer be
//! trusted, the rescuer scans forward byte by byte for a position that
//! looks like a plausible packet start, so the data path can resume
//! instead of hanging waiting for a payload that will never complete.
//!
//! "Plausible" is type-specific:
//! - `Acl`: the connection handle in the preamble must currently be
//!   connected, per [`crate::activities::ConnectionActivities`].
//! - `ThreadData`: bytes `[1]`/`[2]` of the preamble must be zero and
//!   byte `[5]` (the first byte of the 802.15.4 dispatch header) must
//!   fall in `0x80..=0x8F`.
//! - `Event`: the event code must be one this crate knows the fixed
//!   parameter length for (see [`crate::types::EventCode`]), with
//!   three codes needing extra validation beyond a fixed length:
//!   `CommandComplete` (length is variable but must be large enough to
//!   hold the mandatory num-packets + opcode fields),
//!   `NumberOfCompletedPackets` (length must match `1 + 4*num_handles`)
//!   and `BleMeta` (length must be nonzero, since every LE meta event
//!   carries at least a sub-event code).
//!
//! Vendor-specific events are never treated as rescuable (see
//! SPEC_FULL.md §4.3): the vendor payload validator that original uses
//! for those is out of scope here, and guessing would risk resyncing
//! on a false positive.

use crate::activities::ConnectionActivities;
use crate::types::{EventCode, PacketType};

/// Scan `buffer` for the first offset that looks like a plausible
/// packet start. Returns `None` if no plausible start is found in the
/// given buffer (the caller should request more bytes and retry).
pub fn find_resync_point(buffer: &[u8], activities: &ConnectionActivities) -> Option<usize> {
    for offset in 0..buffer.len() {
        if is_plausible_start(&buffer[offset..], activities) {
            return Some(offset);
        }
    }
    None
}

fn is_plausible_start(tail: &[u8], activities: &ConnectionActivities) -> bool {
    let Some(&indicator) = tail.first() else {
        return false;
    };
    let Some(pt) = PacketType::from_indicator(indicator) else {
        return false;
    };

    match pt {
        PacketType::Acl => is_plausible_acl(tail, activities),
        PacketType::ThreadData => is_plausible_thread_data(tail),
        PacketType::Event => is_plausible_event(tail, activities),
        PacketType::Command | PacketType::Sco | PacketType::Iso => false,
    }
}

fn is_plausible_acl(tail: &[u8], activities: &ConnectionActivities) -> bool {
    let Some(handle_bytes) = tail.get(1..3) else {
        return false;
    };
    let handle = u16::from_le_bytes([handle_bytes[0], handle_bytes[1]]) & 0x0fff;
    activities.is_connected(handle)
}

fn is_plausible_thread_data(tail: &[u8]) -> bool {
    let Some(&b1) = tail.get(1) else { return false };
    let Some(&b2) = tail.get(2) else { return false };
    let Some(&b5) = tail.get(5) else { return false };
    b1 == 0x00 && b2 == 0x00 && (0x80..=0x8f).contains(&b5)
}

/// Lowest/highest BLE meta subevent code the rescuer accepts as a
/// plausible resync point. Taken from the original; treat as tunable
/// rather than bit-exact (see SPEC_FULL.md's Open Questions).
const BLE_META_SUBCODE_RANGE: std::ops::RangeInclusive<u8> = 0x01..=0x29;

fn is_plausible_event(tail: &[u8], activities: &ConnectionActivities) -> bool {
    let Some(&code_byte) = tail.get(1) else {
        return false;
    };
    let Some(&length) = tail.get(2) else {
        return false;
    };
    let length = length as usize;
    let code = EventCode::from_code(code_byte);

    match code {
        EventCode::VendorSpecific => false,
        EventCode::CommandComplete => {
            // Parameters are [num_hci_command_packets, opcode_lo, opcode_hi, ...];
            // the controller always reports exactly one outstanding command slot.
            length >= 3 && tail.get(3) == Some(&0x01)
        }
        EventCode::NumberOfCompletedPackets => {
            length >= 1
                && tail.get(3).is_some_and(|&num_handles| {
                    length == 1 + 4 * num_handles as usize
                        && (num_handles as usize) <= activities.count()
                })
        }
        EventCode::BleMeta => {
            length >= 1 && tail.get(3).is_some_and(|&sub| BLE_META_SUBCODE_RANGE.contains(&sub))
        }
        other => other.fixed_param_len() == Some(length),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resyncs_after_garbage_bytes_to_command_complete() {
        let activities = ConnectionActivities::new();
        // Two garbage bytes, then a well-formed Command Complete event.
        let mut buffer = vec![0xde, 0xad];
        buffer.extend_from_slice(&[0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]);

        let offset = find_resync_point(&buffer, &activities).unwrap();
        assert_eq!(offset, 2);
    }

    #[test]
    fn acl_requires_a_connected_handle() {
        let activities = ConnectionActivities::new();
        let buffer = vec![0x02, 0x01, 0x00, 0x02, 0x00, 0xaa, 0xbb];

        assert!(find_resync_point(&buffer, &activities).is_none());

        activities.on_connection_complete(0x0001, true);
        assert_eq!(find_resync_point(&buffer, &activities), Some(0));
    }

    #[test]
    fn vendor_specific_events_are_never_rescuable() {
        let activities = ConnectionActivities::new();
        let buffer = vec![0x04, 0xff, 0x02, 0x00, 0x00];
        assert!(find_resync_point(&buffer, &activities).is_none());
    }

    #[test]
    fn number_of_completed_packets_validates_handle_count() {
        let activities = ConnectionActivities::new();
        activities.on_connection_complete(0x0001, true);
        // num_handles=1, so total length must be 1 + 4*1 = 5.
        let buffer = vec![0x04, 0x13, 0x05, 0x01, 0xaa, 0xbb, 0x01, 0x00];
        assert_eq!(find_resync_point(&buffer, &activities), Some(0));

        let bad_buffer = vec![0x04, 0x13, 0x04, 0x01, 0xaa, 0xbb, 0x01, 0x00];
        assert!(find_resync_point(&bad_buffer, &activities).is_none());
    }

    #[test]
    fn number_of_completed_packets_rejects_more_handles_than_connected() {
        let activities = ConnectionActivities::new();
        // No connections tracked, but the event claims one handle.
        let buffer = vec![0x04, 0x13, 0x05, 0x01, 0xaa, 0xbb, 0x01, 0x00];
        assert!(find_resync_point(&buffer, &activities).is_none());
    }

    #[test]
    fn ble_meta_requires_subcode_in_range() {
        let activities = ConnectionActivities::new();
        let in_range = vec![0x04, 0x3e, 0x01, 0x02];
        assert_eq!(find_resync_point(&in_range, &activities), Some(0));

        let out_of_range = vec![0x04, 0x3e, 0x01, 0x30];
        assert!(find_resync_point(&out_of_range, &activities).is_none());
    }
}

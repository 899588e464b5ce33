use perfetto_protos::trace_packet::trace_packet::SequenceFlags;
use perfetto_protos::trace_packet::TracePacket;

/// Every packet is written on this one sequence.
pub const TRUSTED_PACKET_SEQUENCE_ID: u32 = 1;

/// Stamps the sequence id and incremental-state flags on outgoing packets.
///
/// Only the very first packet clears incremental state; everything after it
/// relies on the interned data accumulated since.
#[derive(Debug)]
pub struct SequenceState {
    first_packet: bool,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self { first_packet: true }
    }
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, packet: &mut TracePacket) {
        packet.set_trusted_packet_sequence_id(TRUSTED_PACKET_SEQUENCE_ID);
        if self.first_packet {
            packet.set_first_packet_on_sequence(true);
            packet.set_previous_packet_dropped(true);
            packet.set_sequence_flags(
                SequenceFlags::SEQ_INCREMENTAL_STATE_CLEARED as u32
                    | SequenceFlags::SEQ_NEEDS_INCREMENTAL_STATE as u32,
            );
            self.first_packet = false;
        } else {
            packet.set_sequence_flags(SequenceFlags::SEQ_NEEDS_INCREMENTAL_STATE as u32);
        }
    }

    #[cfg(test)]
    pub fn started(&self) -> bool {
        !self.first_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_packet_clears_state() {
        let mut seq = SequenceState::new();
        let mut packet = TracePacket::default();
        seq.stamp(&mut packet);

        assert!(packet.first_packet_on_sequence());
        assert!(packet.previous_packet_dropped());
        assert_eq!(packet.trusted_packet_sequence_id(), TRUSTED_PACKET_SEQUENCE_ID);
        assert_eq!(
            packet.sequence_flags(),
            SequenceFlags::SEQ_INCREMENTAL_STATE_CLEARED as u32
                | SequenceFlags::SEQ_NEEDS_INCREMENTAL_STATE as u32
        );
        assert!(seq.started());
    }

    #[test]
    fn test_later_packets_only_need_state() {
        let mut seq = SequenceState::new();
        seq.stamp(&mut TracePacket::default());

        let mut packet = TracePacket::default();
        seq.stamp(&mut packet);
        assert!(!packet.has_first_packet_on_sequence());
        assert!(!packet.has_previous_packet_dropped());
        assert_eq!(
            packet.sequence_flags(),
            SequenceFlags::SEQ_NEEDS_INCREMENTAL_STATE as u32
        );
    }
}

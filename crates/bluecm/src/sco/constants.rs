//! Synchronous packet-type masks and the LMP feature bits gating them.

use bitflags::bitflags;

bitflags! {
    /// HCI synchronous packet-type mask.
    ///
    /// SCO and BR eSCO bits are "may use" bits; the EDR bits are inverted
    /// ("may NOT use"), following the HCI encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncPacketType: u16 {
        const HV1 = 0x0001;
        const HV2 = 0x0002;
        const HV3 = 0x0004;
        const EV3 = 0x0008;
        const EV4 = 0x0010;
        const EV5 = 0x0020;
        const NO_2EV3 = 0x0040;
        const NO_3EV3 = 0x0080;
        const NO_2EV5 = 0x0100;
        const NO_3EV5 = 0x0200;
    }
}

/// All SCO packet bits.
pub const SCO_PACKETS: SyncPacketType = SyncPacketType::HV1
    .union(SyncPacketType::HV2)
    .union(SyncPacketType::HV3);

/// All BR eSCO packet bits.
pub const BR_ESCO_PACKETS: SyncPacketType = SyncPacketType::EV3
    .union(SyncPacketType::EV4)
    .union(SyncPacketType::EV5);

/// All EDR eSCO exclusion bits.
pub const EDR_ESCO_PACKETS: SyncPacketType = SyncPacketType::NO_2EV3
    .union(SyncPacketType::NO_3EV3)
    .union(SyncPacketType::NO_2EV5)
    .union(SyncPacketType::NO_3EV5);

impl SyncPacketType {
    pub fn is_edr_esco(self) -> bool {
        self.intersects(EDR_ESCO_PACKETS)
    }

    pub fn is_br_esco(self) -> bool {
        self.intersects(BR_ESCO_PACKETS)
    }

    pub fn is_sco(self) -> bool {
        self.intersects(SCO_PACKETS)
    }
}

/// LMP feature bit positions (bit index into the 64-bit feature bitmap).
pub const LMP_FEATURE_SCO_LINK: u8 = 11;
pub const LMP_FEATURE_HV2: u8 = 12;
pub const LMP_FEATURE_HV3: u8 = 13;
pub const LMP_FEATURE_EV3: u8 = 31;
pub const LMP_FEATURE_EV4: u8 = 32;
pub const LMP_FEATURE_EV5: u8 = 33;
pub const LMP_FEATURE_EDR_ESCO_2MBPS: u8 = 45;
pub const LMP_FEATURE_EDR_ESCO_3MBPS: u8 = 46;
pub const LMP_FEATURE_3SLOT_EDR_ESCO: u8 = 47;

/// Returns whether `bit` is set in an 8-byte LMP feature bitmap.
pub fn feature_bit_set(features: &[u8; 8], bit: u8) -> bool {
    let byte = (bit / 8) as usize;
    let offset = bit % 8;
    (features[byte] & (1 << offset)) != 0
}

/// One row of the packet-type preference table: the packet type and the
/// feature bit both sides must support for it to be usable.
#[derive(Debug, Clone, Copy)]
pub struct PacketFeature {
    pub packet_type: SyncPacketType,
    pub feature_bit: u8,
}

/// Packet types in negotiation preference order: 3-slot and 2-slot EDR
/// eSCO first, then BR eSCO, then legacy SCO.
pub const PACKET_TYPE_RATING: [PacketFeature; 10] = [
    PacketFeature {
        packet_type: SyncPacketType::NO_3EV5,
        feature_bit: LMP_FEATURE_3SLOT_EDR_ESCO,
    },
    PacketFeature {
        packet_type: SyncPacketType::NO_2EV5,
        feature_bit: LMP_FEATURE_3SLOT_EDR_ESCO,
    },
    PacketFeature {
        packet_type: SyncPacketType::NO_3EV3,
        feature_bit: LMP_FEATURE_EDR_ESCO_3MBPS,
    },
    PacketFeature {
        packet_type: SyncPacketType::NO_2EV3,
        feature_bit: LMP_FEATURE_EDR_ESCO_2MBPS,
    },
    PacketFeature {
        packet_type: SyncPacketType::EV5,
        feature_bit: LMP_FEATURE_EV5,
    },
    PacketFeature {
        packet_type: SyncPacketType::EV4,
        feature_bit: LMP_FEATURE_EV4,
    },
    PacketFeature {
        packet_type: SyncPacketType::EV3,
        feature_bit: LMP_FEATURE_EV3,
    },
    PacketFeature {
        packet_type: SyncPacketType::HV3,
        feature_bit: LMP_FEATURE_HV3,
    },
    PacketFeature {
        packet_type: SyncPacketType::HV2,
        feature_bit: LMP_FEATURE_HV2,
    },
    PacketFeature {
        packet_type: SyncPacketType::HV1,
        feature_bit: LMP_FEATURE_SCO_LINK,
    },
];

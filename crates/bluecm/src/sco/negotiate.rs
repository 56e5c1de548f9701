//! Synchronous-connection parameter negotiation.
//!
//! A restartable, finite iterator over pre-filtered candidate lists. For
//! each requested parameter set the fixed preference table is filtered
//! against local and remote feature support (and link security), yielding
//! an ordered candidate list per set; sets with no surviving candidate are
//! dropped at build time. The cursor advances inner-first, then outer;
//! global exhaustion means the negotiation failed.

use crate::sco::constants::{
    feature_bit_set, SyncPacketType, EDR_ESCO_PACKETS, PACKET_TYPE_RATING,
};
use crate::types::EncryptionType;

/// One requested parameter set for a synchronous link. `packet_types` uses
/// the HCI encoding (EDR bits are exclusion bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParams {
    pub packet_types: SyncPacketType,
    pub tx_bandwidth: u32,
    pub rx_bandwidth: u32,
    pub max_latency: u16,
    pub voice_settings: u16,
    pub retx_effort: u8,
}

impl SyncParams {
    /// Default eSCO request: everything allowed, controller's choice.
    pub fn default_esco() -> Self {
        Self {
            packet_types: SyncPacketType::all() & !EDR_ESCO_PACKETS,
            tx_bandwidth: 8000,
            rx_bandwidth: 8000,
            max_latency: 16,
            voice_settings: 0x0060,
            retx_effort: 0x02,
        }
    }
}

/// Parameters of an established synchronous link, as reported by the
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncNegotiatedParams {
    pub tx_interval: u8,
    pub retransmission_window: u8,
    pub rx_packet_length: u16,
    pub tx_packet_length: u16,
    pub air_mode: u8,
}

/// One parameter set with its filtered, preference-ordered packet types.
#[derive(Debug, Clone)]
struct NegotiationSet {
    params: SyncParams,
    packet_types: Vec<SyncPacketType>,
    index: usize,
}

/// Cursor over the candidate sets. Only advances forward; exhaustion of a
/// set's packet types moves to the next set.
#[derive(Debug, Clone, Default)]
pub struct NegotiationCursor {
    sets: Vec<NegotiationSet>,
    index: usize,
}

/// Filters one requested set against the preference table.
///
/// EDR eSCO types are usable when the request does NOT carry the exclusion
/// bit; the candidate mask then excludes every EDR type but that one. BR
/// eSCO and SCO types are usable when requested, with all EDR types
/// excluded. Legacy SCO packets are forbidden on AES-CCM secured links.
fn filter_packet_types(
    params: &SyncParams,
    local_features: &[u8; 8],
    remote_features: &[u8; 8],
    encryption: EncryptionType,
) -> Vec<SyncPacketType> {
    let mut out = Vec::new();

    for entry in PACKET_TYPE_RATING.iter() {
        let supported = feature_bit_set(local_features, entry.feature_bit)
            && feature_bit_set(remote_features, entry.feature_bit);
        if !supported {
            continue;
        }

        if entry.packet_type.is_edr_esco() {
            if !params.packet_types.intersects(entry.packet_type) {
                // Requested (exclusion bit clear): allow exactly this EDR
                // type by excluding all the others.
                out.push((EDR_ESCO_PACKETS - entry.packet_type) & EDR_ESCO_PACKETS);
            }
        } else if entry.packet_type.is_br_esco() {
            if params.packet_types.intersects(entry.packet_type) {
                out.push(entry.packet_type | EDR_ESCO_PACKETS);
            }
        } else {
            // Legacy SCO packet types.
            if encryption == EncryptionType::AesCcm {
                continue;
            }
            if params.packet_types.intersects(entry.packet_type) {
                out.push(entry.packet_type | EDR_ESCO_PACKETS);
            }
        }
    }

    out
}

impl NegotiationCursor {
    /// Builds the cursor for the requested parameter sets against the
    /// given feature bitmaps and link security. Sets yielding zero
    /// candidates are dropped.
    pub fn build(
        requested: &[SyncParams],
        local_features: &[u8; 8],
        remote_features: &[u8; 8],
        encryption: EncryptionType,
    ) -> Self {
        let sets = requested
            .iter()
            .filter_map(|params| {
                let packet_types =
                    filter_packet_types(params, local_features, remote_features, encryption);
                if packet_types.is_empty() {
                    None
                } else {
                    Some(NegotiationSet {
                        params: *params,
                        packet_types,
                        index: 0,
                    })
                }
            })
            .collect();

        Self { sets, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// The candidate the cursor currently rests on.
    pub fn current(&self) -> Option<SyncParams> {
        let set = self.sets.get(self.index)?;
        let packet_types = *set.packet_types.get(set.index)?;
        let mut params = set.params;
        params.packet_types = packet_types;
        Some(params)
    }

    /// Advances inner-first, then to the next set. Returns the candidate
    /// now under the cursor, or `None` on global exhaustion.
    pub fn advance(&mut self) -> Option<SyncParams> {
        let set = self.sets.get_mut(self.index)?;
        set.index += 1;
        if set.index < set.packet_types.len() {
            return self.current();
        }

        self.index += 1;
        // Every set is guaranteed at least one candidate, so landing on a
        // new set means its first entry is valid.
        if self.index < self.sets.len() {
            return self.current();
        }

        None
    }

    /// Advances until the current candidate is a legacy SCO packet type,
    /// used when responding to a legacy SCO indication. Returns the
    /// candidate, or `None` if no SCO-capable candidate remains.
    pub fn seek_sco_only(&mut self) -> Option<SyncParams> {
        if let Some(current) = self.current() {
            if current.packet_types.is_sco() {
                return Some(current);
            }
        }
        while let Some(params) = self.advance() {
            if params.packet_types.is_sco() {
                return Some(params);
            }
        }
        None
    }
}

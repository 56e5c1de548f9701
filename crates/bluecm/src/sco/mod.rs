//! SCO/eSCO synchronous-link engine.
//!
//! Computes, for a requested audio-link quality, the ordered set of
//! acceptable packet types given local and remote feature support, and
//! walks that set across negotiation rounds. Invoked both for locally
//! initiated eSCO setup and, role-reversed, to pick the acceptable
//! response parameters for an incoming synchronous-connection indication.

pub mod constants;
mod engine;
mod negotiate;
mod pcm;

#[cfg(test)]
mod tests;

pub use engine::ScoNegotiation;
pub use negotiate::{NegotiationCursor, SyncNegotiatedParams, SyncParams};
pub use pcm::{PcmSlot, PcmSlotTable, MAX_PCM_SLOTS};

pub(crate) use engine::*;

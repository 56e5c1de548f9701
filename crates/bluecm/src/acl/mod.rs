//! ACL physical-link management.
//!
//! This module owns the fixed-capacity ACL record table and the lifecycle
//! engine that opens and closes physical links, resolves the early-close
//! race against the controller, runs the post-open read sequence and keeps
//! per-link quality state current.

mod engine;
mod table;


pub use table::{
    AclRecord, AclTable, LogicalChannelMask, QosSettings, DEFAULT_FLUSH_TIMEOUT, DEFAULT_LSTO,
    INVALID_LMP_VERSION, NUM_ACL_CONNECTIONS,
};

pub(crate) use engine::*;

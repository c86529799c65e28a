//! Cluster coordination: who leads, and how many followers a write needs.
//!
//! Both components consume the coordination service only; neither talks to
//! peers directly.

pub mod election;
pub mod membership;

pub use election::{ElectionEngine, ElectionState, Role};
pub use membership::{quorum, MembershipSnapshot, MembershipTracker};

//! Ring membership.
//!
//! The ring keeps members sorted by hash key and derives the routing
//! metadata from that order.

pub mod topology;

pub use topology::RingTopology;

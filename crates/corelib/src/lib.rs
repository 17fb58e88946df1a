//! Core library for the partitioned key-value ring.
//!
//! This crate provides the pure data types the rest of the workspace builds on:
//! - Hash keys and key hash ranges (with wraparound)
//! - Node descriptors and ring members
//! - Metadata snapshots and their tiling invariant
//! - Ring topology with successor/predecessor lookup

pub mod error;
pub mod hash;
pub mod metadata;
pub mod node;
pub mod range;
pub mod ring;

pub use error::{Error, Result};
pub use hash::HashKey;
pub use metadata::Metadata;
pub use node::{NodeDescriptor, NodeInfo};
pub use range::KeyHashRange;
pub use ring::RingTopology;

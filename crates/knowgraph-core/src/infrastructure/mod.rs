//! Infrastructure layer
//!
//! Implementations of the domain repository traits over real storage.

pub mod graph;

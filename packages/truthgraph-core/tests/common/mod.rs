//! Shared fixtures and assertions for truthgraph-core integration tests

#![allow(dead_code)]

mod assertions;
mod fixtures;

pub use assertions::*;
pub use fixtures::*;

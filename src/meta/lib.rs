//! Replicated metadata registry: nodes, files, blocks and their placements
#[macro_use]
extern crate tracing;

pub mod registry;
pub mod schema;

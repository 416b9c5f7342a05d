//! Group membership management and failure detection between Trastero peers
#[macro_use]
extern crate tracing;

pub mod messages;
pub mod system;

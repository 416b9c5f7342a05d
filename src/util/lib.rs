//! Utility crate for the Trastero distributed block store
#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod error;
pub mod persister;
pub mod time;

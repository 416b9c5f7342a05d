//! Local block storage and block exchange between Trastero peers
#[macro_use]
extern crate tracing;

pub mod manager;

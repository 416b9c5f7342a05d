//! Core model of a Trastero node: block placement, file transfer
//! pipelines, the control surface and the wiring between components
#[macro_use]
extern crate tracing;

pub mod control;
pub mod engine;
pub mod mesh;
pub mod placement;

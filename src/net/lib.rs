//! Wire protocol and TCP/UDP transport between Trastero peers
#[macro_use]
extern crate tracing;

pub mod heartbeat;
pub mod message;
pub mod pool;
pub mod server;

use std::time::Duration;

/// Timeout for one reliable-channel request/response exchange
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for requests that carry block data in either direction
pub const BLOCK_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for establishing a TCP connection to a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

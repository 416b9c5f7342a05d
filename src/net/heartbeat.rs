//! Heartbeat datagrams of the unreliable channel
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use trastero_util::error::Error;

use crate::message::{decode_payload, encode_payload};

/// How often a node emits its heartbeat to every known peer
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
/// A peer silent for longer than this is marked offline
pub const HEARTBEAT_EXPIRY: Duration = Duration::from_secs(9);

const MAX_DATAGRAM: usize = 512;

/// One heartbeat datagram. Loss is tolerated: only the latest received
/// sequence number per peer matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
	/// Numeric part of the sender's label
	pub label: u32,
	/// Monotonic per-sender sequence number
	pub seq: u64,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
}

/// The UDP socket of the unreliable channel
pub struct HeartbeatSocket {
	socket: UdpSocket,
}

impl HeartbeatSocket {
	pub async fn bind(port: u16) -> Result<Self, Error> {
		let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
		info!("Heartbeat channel listening on udp port {}", port);
		Ok(Self { socket })
	}

	pub async fn send_to(&self, heartbeat: &Heartbeat, addr: SocketAddr) -> Result<(), Error> {
		let bytes = encode_payload(heartbeat)?;
		self.socket.send_to(&bytes[..], addr).await?;
		Ok(())
	}

	/// Wait for the next parseable heartbeat; garbage datagrams are
	/// dropped without tearing the loop down
	pub async fn recv_from(&self) -> Result<(Heartbeat, SocketAddr), Error> {
		let mut buf = [0u8; MAX_DATAGRAM];
		loop {
			let (len, addr) = self.socket.recv_from(&mut buf[..]).await?;
			match decode_payload::<Heartbeat>(&buf[..len]) {
				Ok(hb) => return Ok((hb, addr)),
				Err(e) => {
					debug!("Ignoring malformed heartbeat from {}: {}", addr, e);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_heartbeat_udp_roundtrip() {
		let a = HeartbeatSocket::bind(0).await.unwrap();
		let b = HeartbeatSocket::bind(0).await.unwrap();
		let b_addr = {
			let local = b.socket.local_addr().unwrap();
			SocketAddr::new("127.0.0.1".parse().unwrap(), local.port())
		};

		let hb = Heartbeat {
			label: 2,
			seq: 17,
			capacity_bytes: 100 * 1024 * 1024,
			used_bytes: 12345,
		};
		a.send_to(&hb, b_addr).await.unwrap();

		let (got, _from) = b.recv_from().await.unwrap();
		assert_eq!(got.label, 2);
		assert_eq!(got.seq, 17);
		assert_eq!(got.used_bytes, 12345);
	}
}

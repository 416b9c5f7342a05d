//! Outbound connections to peers
//!
//! A connection is never shared between two concurrent senders: each
//! request/response exchange holds the per-peer slot for its whole
//! duration. Connections are kept open between exchanges and re-dialed
//! on demand when the previous one broke.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use trastero_util::error::Error;

use crate::message::*;
use crate::CONNECT_TIMEOUT;

/// One established connection to a peer
pub struct Connection {
	stream: TcpStream,
	peer: SocketAddr,
	next_correlation: u32,
	max_payload: u64,
}

impl Connection {
	pub async fn connect(peer: SocketAddr, max_payload: u64) -> Result<Self, Error> {
		let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
			.await
			.map_err(|_| Error::Timeout)??;
		stream.set_nodelay(true)?;
		Ok(Self {
			stream,
			peer,
			next_correlation: 1,
			max_payload,
		})
	}

	/// Send a request and wait for the response that echoes its
	/// correlation id
	pub async fn request(
		&mut self,
		opcode: OpCode,
		payload: Bytes,
		timeout: Duration,
	) -> Result<Frame, Error> {
		let correlation = self.next_correlation;
		self.next_correlation = self.next_correlation.wrapping_add(1);

		let frame = Frame::new(opcode, correlation, payload);
		let resp = tokio::time::timeout(timeout, async {
			write_frame(&mut self.stream, &frame).await?;
			read_frame(&mut self.stream, self.max_payload).await
		})
		.await
		.map_err(|_| Error::Timeout)??;

		if resp.correlation != correlation {
			return Err(Error::Protocol(format!(
				"peer {} answered correlation {} to request {}",
				self.peer, resp.correlation, correlation
			)));
		}
		Ok(resp)
	}
}

/// Pool of outbound connections, keyed by peer address
pub struct ConnectionPool {
	max_payload: u64,
	slots: Mutex<HashMap<SocketAddr, Arc<Mutex<Option<Connection>>>>>,
}

impl ConnectionPool {
	pub fn new(max_payload: u64) -> Arc<Self> {
		Arc::new(Self {
			max_payload,
			slots: Mutex::new(HashMap::new()),
		})
	}

	async fn slot(&self, addr: SocketAddr) -> Arc<Mutex<Option<Connection>>> {
		let mut slots = self.slots.lock().await;
		slots.entry(addr).or_default().clone()
	}

	/// One request/response exchange with the peer at `addr`.
	///
	/// A broken cached connection is thrown away and re-dialed once;
	/// failures after that surface as `peer_unreachable`.
	pub async fn request(
		&self,
		addr: SocketAddr,
		opcode: OpCode,
		payload: Bytes,
		timeout: Duration,
	) -> Result<Frame, Error> {
		let slot = self.slot(addr).await;
		let mut guard = slot.lock().await;

		if guard.is_none() {
			*guard = Some(self.dial(addr).await?);
		}

		match guard.as_mut().unwrap().request(opcode, payload.clone(), timeout).await {
			Ok(resp) => Ok(resp),
			Err(first_err) => {
				trace!("Re-dialing {} after: {}", addr, first_err);
				*guard = None;
				let mut fresh = self.dial(addr).await?;
				match fresh.request(opcode, payload, timeout).await {
					Ok(resp) => {
						*guard = Some(fresh);
						Ok(resp)
					}
					Err(e) => Err(Error::PeerUnreachable(addr.to_string(), e.to_string())),
				}
			}
		}
	}

	/// Like `request`, but interpret the reply: ACK succeeds, ERROR
	/// carries the remote error message, anything else is unexpected.
	pub async fn request_ack(
		&self,
		addr: SocketAddr,
		opcode: OpCode,
		payload: Bytes,
		timeout: Duration,
	) -> Result<(), Error> {
		let resp = self.request(addr, opcode, payload, timeout).await?;
		match resp.opcode {
			OpCode::Ack => Ok(()),
			OpCode::Error => {
				let msg: String = decode_payload(&resp.payload[..])?;
				Err(Error::Message(msg))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	async fn dial(&self, addr: SocketAddr) -> Result<Connection, Error> {
		Connection::connect(addr, self.max_payload)
			.await
			.map_err(|e| Error::PeerUnreachable(addr.to_string(), e.to_string()))
	}

	/// Forget the cached connection to a peer
	pub async fn drop_peer(&self, addr: SocketAddr) {
		self.slots.lock().await.remove(&addr);
	}

	/// Forget every cached connection
	pub async fn clear(&self) {
		self.slots.lock().await.clear();
	}
}

//! Payloads of the membership operations
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use trastero_meta::registry::Snapshot;
use trastero_meta::schema::{NodeEntry, NodeLabel};
use trastero_util::data::Fingerprint;

/// Payload of `HELLO`: sent on the first connection to a group member
/// when joining, and to every other member afterwards to identify
/// ourselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
	/// Label this node held before, if it is reconnecting
	pub claimed_label: Option<NodeLabel>,
	/// Group fingerprint backing the claim
	pub fingerprint: Option<Fingerprint>,
	/// The address the sender dialed to reach the receiver. A node
	/// without an entry for itself learns its own reachable address
	/// from this field.
	pub dialed_addr: SocketAddr,
	/// Port of the sender's reliable channel (its IP is taken from the
	/// connection itself)
	pub tcp_port: u16,
	/// Port of the sender's heartbeat channel
	pub udp_port: u16,
	/// Block size the sender cuts files into. Must be identical on
	/// every member of a group.
	pub block_size: u64,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
}

/// Payload of `WELCOME`, the answer to a `HELLO`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
	pub assigned_label: NodeLabel,
	/// The group fingerprint, once the group has two members
	pub fingerprint: Option<Fingerprint>,
	/// Every member the receiver should open a connection to
	pub peers: Vec<NodeEntry>,
	/// Full metadata so the joiner starts converged
	pub snapshot: Snapshot,
}

/// Payload of `PEER_LIST`, gossiped whenever a member first hears of
/// another one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListMsg {
	pub peers: Vec<NodeEntry>,
}

/// Payload of `CAPACITY_UPDATE`: a node pushes its current capacity
/// and used bytes ahead of the next heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityUpdateMsg {
	pub label: NodeLabel,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
}

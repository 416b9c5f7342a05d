//! Entry types of the metadata tables
//!
//! Entities reference each other only through keys: nodes by label,
//! blocks by `(file name, index)`. Nothing here owns anything else.
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use trastero_util::error::Error;

/// A group-unique node identity of the form `nodo<K>`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeLabel(pub u32);

impl std::fmt::Display for NodeLabel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "nodo{}", self.0)
	}
}

impl std::fmt::Debug for NodeLabel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self)
	}
}

impl FromStr for NodeLabel {
	type Err = Error;
	fn from_str(s: &str) -> Result<Self, Error> {
		let num = s
			.strip_prefix("nodo")
			.ok_or_else(|| Error::Message(format!("invalid node label: {}", s)))?;
		let k: u32 = num
			.parse()
			.map_err(|_| Error::Message(format!("invalid node label: {}", s)))?;
		if k == 0 {
			return Err(Error::Message(format!("invalid node label: {}", s)));
		}
		Ok(NodeLabel(k))
	}
}

/// Liveness of a node as agreed by the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
	Online,
	Offline,
	/// Terminal state, only reached by group dissolution
	Gone,
}

/// One row of the node table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
	pub label: NodeLabel,
	/// Address of the node's reliable channel
	pub addr: SocketAddr,
	/// Port of the node's heartbeat channel (same host as `addr`)
	pub udp_port: u16,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
	pub liveness: Liveness,
	/// Timestamp of the mutation that produced this row, for
	/// last-writer-wins convergence
	pub updated_msec: u64,
}

impl NodeEntry {
	pub fn free_bytes(&self) -> u64 {
		self.capacity_bytes.saturating_sub(self.used_bytes)
	}

	pub fn is_online(&self) -> bool {
		self.liveness == Liveness::Online
	}

	/// Address of the node's heartbeat channel
	pub fn heartbeat_addr(&self) -> SocketAddr {
		SocketAddr::new(self.addr.ip(), self.udp_port)
	}
}

/// Identity of one block: the file it belongs to and its position in
/// the file's byte stream
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
	pub file: String,
	pub index: u32,
}

/// One row of the block table: the block and its two placements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
	pub id: BlockId,
	pub size: u64,
	pub original: NodeLabel,
	pub replica: NodeLabel,
}

/// One row of the file table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
	pub name: String,
	pub size: u64,
	/// Label of the node that uploaded the file
	pub owner: NodeLabel,
	pub created_msec: u64,
	/// Ordered list of block identifiers forming the byte stream
	pub blocks: Vec<BlockId>,
}

/// How one block relates to a given node, as shown by `list_blocks`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
	/// This node hosts the original placement
	OriginalHere,
	/// This node hosts the replica placement
	ReplicaHere,
	/// The block's placements are not both recorded yet
	FreeHere,
	/// Hosted elsewhere and no host is currently online
	OfflineElsewhere,
	/// Hosted elsewhere with at least one host online
	PresentElsewhere,
}

impl std::fmt::Display for BlockStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			BlockStatus::OriginalHere => "original_here",
			BlockStatus::ReplicaHere => "replica_here",
			BlockStatus::FreeHere => "free_here",
			BlockStatus::OfflineElsewhere => "offline_elsewhere",
			BlockStatus::PresentElsewhere => "present_elsewhere",
		};
		write!(f, "{}", s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_label_format() {
		let l = NodeLabel(3);
		assert_eq!(format!("{}", l), "nodo3");
		assert_eq!("nodo3".parse::<NodeLabel>().unwrap(), l);
		assert!("node3".parse::<NodeLabel>().is_err());
		assert!("nodo".parse::<NodeLabel>().is_err());
		assert!("nodo0".parse::<NodeLabel>().is_err());
		assert!("nodoX".parse::<NodeLabel>().is_err());
	}

	#[test]
	fn test_label_ordering_is_numeric() {
		assert!(NodeLabel(2) < NodeLabel(10));
	}
}

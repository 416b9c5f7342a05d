//! The control surface: what an external UI can ask a running node
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use trastero_meta::schema::{BlockStatus, NodeLabel};
use trastero_util::config::{CAPACITY_MAX, CAPACITY_MIN};

use crate::engine::{DeleteOutcome, DownloadOutcome, UploadOutcome};
use crate::mesh::Mesh;

/// Requests an external UI process can send over the `CONTROL`
/// operation of the reliable channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
	/// Join a group through one of its members
	Connect { peer: SocketAddr },
	/// Leave the group, keeping identity and metadata
	Disconnect,
	ListNodes,
	Upload { local_path: PathBuf },
	ListFiles,
	Download { name: String, local_path: PathBuf },
	Delete { name: String },
	ListBlocks,
	SetCapacity { bytes: u64 },
	Status,
}

/// Outcome of a capacity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityOutcome {
	Ok,
	/// Capacity can only change while disconnected
	InGroup,
	/// The requested capacity is below the bytes already stored here
	BelowUsed,
	/// The requested capacity is outside the permitted range
	OutOfRange,
}

/// One node row as reported by `list_nodes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
	pub label: NodeLabel,
	pub online: bool,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
	pub last_seen_secs_ago: Option<u64>,
}

/// One file row as reported by `list_files`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
	pub name: String,
	pub size: u64,
	pub owner: NodeLabel,
	pub created_msec: u64,
	pub retrievable: bool,
}

/// One block row as reported by `list_blocks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
	pub file: String,
	pub index: u32,
	pub size: u64,
	pub original: NodeLabel,
	pub replica: NodeLabel,
	pub status: BlockStatus,
}

/// Answer to `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
	pub label: Option<NodeLabel>,
	/// Online group members other than this node
	pub peer_count: usize,
	pub total_free: u64,
	pub total_used: u64,
	pub capacity_bytes: u64,
	pub used_bytes: u64,
}

/// Replies to control requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlReply {
	Connected { label: NodeLabel },
	Disconnected,
	NodeList(Vec<NodeInfo>),
	Upload(UploadOutcome),
	FileList(Vec<FileInfo>),
	Download(DownloadOutcome),
	Delete(DeleteOutcome),
	BlockList(Vec<BlockInfo>),
	Capacity(CapacityOutcome),
	Status(StatusInfo),
	/// The request itself failed (unreachable peer, disk error, ...)
	Failed(String),
}

impl Mesh {
	/// Serve one control request. Domain outcomes are answers, not
	/// errors; only faults end up in `Failed`.
	pub async fn handle_control(self: &Arc<Self>, req: ControlRequest) -> ControlReply {
		match req {
			ControlRequest::Connect { peer } => match self.system.join(peer).await {
				Ok(label) => ControlReply::Connected { label },
				Err(e) => ControlReply::Failed(format!("{}", e)),
			},
			ControlRequest::Disconnect => {
				self.system.disconnect().await;
				ControlReply::Disconnected
			}
			ControlRequest::ListNodes => ControlReply::NodeList(self.list_nodes()),
			ControlRequest::Upload { local_path } => {
				match self.engine.upload(&local_path).await {
					Ok(outcome) => ControlReply::Upload(outcome),
					Err(e) => ControlReply::Failed(format!("{}", e)),
				}
			}
			ControlRequest::ListFiles => ControlReply::FileList(self.list_files()),
			ControlRequest::Download { name, local_path } => {
				match self.engine.download(&name, &local_path).await {
					Ok(outcome) => ControlReply::Download(outcome),
					Err(e) => ControlReply::Failed(format!("{}", e)),
				}
			}
			ControlRequest::Delete { name } => match self.engine.delete(&name).await {
				Ok(outcome) => ControlReply::Delete(outcome),
				Err(e) => ControlReply::Failed(format!("{}", e)),
			},
			ControlRequest::ListBlocks => ControlReply::BlockList(self.list_blocks()),
			ControlRequest::SetCapacity { bytes } => {
				ControlReply::Capacity(self.set_capacity(bytes))
			}
			ControlRequest::Status => ControlReply::Status(self.status()),
		}
	}

	fn list_nodes(&self) -> Vec<NodeInfo> {
		self.system
			.get_known_nodes()
			.into_iter()
			.map(|n| NodeInfo {
				label: n.entry.label,
				online: n.entry.is_online(),
				capacity_bytes: n.entry.capacity_bytes,
				used_bytes: n.entry.used_bytes,
				last_seen_secs_ago: n.last_seen_secs_ago,
			})
			.collect()
	}

	fn list_files(&self) -> Vec<FileInfo> {
		self.registry
			.list_files()
			.into_iter()
			.map(|f| FileInfo {
				retrievable: self
					.registry
					.file_retrievable(&f.name)
					.unwrap_or(false),
				name: f.name,
				size: f.size,
				owner: f.owner,
				created_msec: f.created_msec,
			})
			.collect()
	}

	fn list_blocks(&self) -> Vec<BlockInfo> {
		let me = match self.system.local_label() {
			Some(label) => label,
			None => return vec![],
		};
		self.registry
			.list_blocks(me)
			.into_iter()
			.map(|(b, status)| BlockInfo {
				file: b.id.file,
				index: b.id.index,
				size: b.size,
				original: b.original,
				replica: b.replica,
				status,
			})
			.collect()
	}

	/// Change the declared capacity, guarded: only while disconnected,
	/// only inside the permitted range, never below what is stored
	pub fn set_capacity(&self, bytes: u64) -> CapacityOutcome {
		if self.system.is_in_group() {
			return CapacityOutcome::InGroup;
		}
		if !(CAPACITY_MIN..=CAPACITY_MAX).contains(&bytes) {
			return CapacityOutcome::OutOfRange;
		}
		if bytes < self.system.used_bytes() {
			return CapacityOutcome::BelowUsed;
		}
		self.system.set_capacity(bytes);
		if let Err(e) = self.persist_capacity.save(&bytes) {
			warn!("Could not persist the new capacity: {}", e);
		}
		CapacityOutcome::Ok
	}

	fn status(&self) -> StatusInfo {
		let me = self.system.local_label();
		let (total_free, total_used) = self.registry.totals();
		let peer_count = self
			.registry
			.online_nodes()
			.into_iter()
			.filter(|n| Some(n.label) != me)
			.count();
		StatusInfo {
			label: me,
			peer_count,
			total_free,
			total_used,
			capacity_bytes: self.system.capacity_bytes(),
			used_bytes: self.system.used_bytes(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use trastero_rpc::messages::Hello;
	use trastero_util::config::Config;

	const MIB: u64 = 1024 * 1024;

	async fn test_mesh(dir: &std::path::Path, capacity: u64) -> Arc<Mesh> {
		let config = Config {
			capacity_bytes: capacity,
			tcp_port: 8888,
			udp_port: 0,
			storage_dir: dir.join("blocks"),
			metadata_dir: dir.to_path_buf(),
			block_size: MIB,
		};
		Mesh::new(config).await.unwrap()
	}

	/// Put the mesh in a two-member group by letting a fake peer join
	async fn join_fake_peer(mesh: &Arc<Mesh>) {
		let hello = Hello {
			claimed_label: None,
			fingerprint: None,
			dialed_addr: "10.0.0.1:8888".parse().unwrap(),
			tcp_port: 8888,
			udp_port: 8889,
			block_size: MIB,
			capacity_bytes: 100 * MIB,
			used_bytes: 0,
		};
		mesh.system
			.handle_hello(hello, "10.0.0.2:44444".parse().unwrap())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn test_capacity_guards() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mesh = test_mesh(&dir.to_path_buf(), 60 * MIB).await;

		join_fake_peer(&mesh).await;
		mesh.system.update_local_usage(55 * MIB);

		// in a group: capacity is immovable
		assert_eq!(mesh.set_capacity(80 * MIB), CapacityOutcome::InGroup);

		match mesh.handle_control(ControlRequest::Disconnect).await {
			ControlReply::Disconnected => (),
			other => panic!("unexpected reply: {:?}", other),
		}

		assert_eq!(mesh.set_capacity(50 * MIB), CapacityOutcome::BelowUsed);
		assert_eq!(mesh.set_capacity(55 * MIB), CapacityOutcome::Ok);
		assert_eq!(mesh.system.capacity_bytes(), 55 * MIB);
		assert_eq!(mesh.set_capacity(120 * MIB), CapacityOutcome::OutOfRange);
		assert_eq!(mesh.set_capacity(40 * MIB), CapacityOutcome::OutOfRange);
	}

	#[tokio::test]
	async fn test_capacity_survives_restart() {
		let dir = mktemp::Temp::new_dir().unwrap();
		{
			let mesh = test_mesh(&dir.to_path_buf(), 60 * MIB).await;
			assert_eq!(mesh.set_capacity(72 * MIB), CapacityOutcome::Ok);
		}
		let mesh = test_mesh(&dir.to_path_buf(), 60 * MIB).await;
		assert_eq!(mesh.system.capacity_bytes(), 72 * MIB);
	}

	#[tokio::test]
	async fn test_upload_needs_two_online_nodes() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mesh = test_mesh(&dir.to_path_buf(), 60 * MIB).await;

		join_fake_peer(&mesh).await;
		// the fake peer drops off: a single-node group cannot take an
		// upload
		mesh.registry
			.mark_node(trastero_meta::schema::NodeLabel(2), trastero_meta::schema::Liveness::Offline);

		let outcome = mesh
			.engine
			.upload_bytes("solo.bin".into(), bytes::Bytes::from_static(b"some data"))
			.await
			.unwrap();
		assert_eq!(outcome, UploadOutcome::InsufficientCapacity);
	}

	#[tokio::test]
	async fn test_status_reports_the_group() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mesh = test_mesh(&dir.to_path_buf(), 60 * MIB).await;

		join_fake_peer(&mesh).await;
		let status = mesh.status();
		assert_eq!(status.label, Some(NodeLabel(1)));
		assert_eq!(status.peer_count, 1);
		assert_eq!(status.capacity_bytes, 60 * MIB);
	}
}

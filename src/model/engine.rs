//! Upload, download and delete pipelines
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::{mpsc, watch};

use trastero_block::manager::{BlockManager, PutOutcome};
use trastero_meta::registry::Registry;
use trastero_meta::schema::*;
use trastero_net::message::*;
use trastero_net::REQUEST_TIMEOUT;
use trastero_rpc::system::System;
use trastero_util::error::*;
use trastero_util::time::now_msec;

use crate::placement::*;

/// Outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadOutcome {
	Ok,
	/// Aggregate free bytes or peer count cannot satisfy two copies
	InsufficientCapacity,
	/// A live file with this name already exists in the group
	DuplicateName,
}

/// Outcome of a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
	Ok,
	/// Both hosts of the block at this index are offline
	Unavailable(u32),
	/// No file with this name is known
	Missing,
}

/// Outcome of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
	Ok,
	Missing,
}

/// Payload of `FILE_ANNOUNCE`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnnounceMsg {
	pub file: FileEntry,
	pub blocks: Vec<BlockEntry>,
}

/// Payload of `FILE_DELETE`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDeleteMsg {
	pub name: String,
}

/// One placement that was actually stored somewhere, for rollback
#[derive(Debug, Clone)]
struct PlacedBlock {
	id: BlockId,
	host: NodeLabel,
}

/// The replication and placement engine
pub struct Engine {
	registry: Arc<Registry>,
	system: Arc<System>,
	blocks: Arc<BlockManager>,
	block_size: u64,

	/// Block deletions that could not reach their (offline) host yet,
	/// retried when the host comes back
	pending_deletes: Mutex<HashMap<NodeLabel, Vec<BlockId>>>,
}

impl Engine {
	pub fn new(
		registry: Arc<Registry>,
		system: Arc<System>,
		blocks: Arc<BlockManager>,
		block_size: u64,
	) -> Arc<Self> {
		Arc::new(Self {
			registry,
			system,
			blocks,
			block_size,
			pending_deletes: Mutex::new(HashMap::new()),
		})
	}

	// ---- Upload ----

	/// Upload a local file into the group under its file name
	pub async fn upload(self: &Arc<Self>, local_path: &Path) -> Result<UploadOutcome, Error> {
		let name = local_path
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or_message(format!(
				"{} has no usable file name",
				local_path.display()
			))?
			.to_string();
		let data: Bytes = tokio::fs::read(local_path).await?.into();
		self.upload_bytes(name, data).await
	}

	/// Split a byte stream into blocks, choose hosts, ship every block
	/// and announce the file once all of them are acknowledged
	pub async fn upload_bytes(
		self: &Arc<Self>,
		name: String,
		data: Bytes,
	) -> Result<UploadOutcome, Error> {
		if self.registry.file(&name).is_some() {
			return Ok(UploadOutcome::DuplicateName);
		}

		let me = self
			.system
			.local_label()
			.ok_or_message("this node has not joined a group")?;

		let online = self.registry.online_nodes();
		let candidates = online
			.iter()
			.map(|n| Candidate {
				label: n.label,
				free_bytes: n.free_bytes(),
			})
			.collect::<Vec<_>>();

		let plans = match plan_placement(&candidates, data.len() as u64, self.block_size) {
			Some(plans) => plans,
			None => return Ok(UploadOutcome::InsufficientCapacity),
		};

		// ship the blocks; remember everything that landed somewhere
		// so a failed upload can be rolled back
		let placed: Arc<Mutex<Vec<PlacedBlock>>> = Arc::new(Mutex::new(Vec::new()));
		let transfers = plans
			.iter()
			.enumerate()
			.map(|(index, plan)| {
				let id = BlockId {
					file: name.clone(),
					index: index as u32,
				};
				let offset = index as u64 * self.block_size;
				let bytes = data.slice(offset as usize..(offset + plan.size) as usize);
				self.place_block(id, plan.clone(), bytes, placed.clone())
			})
			.collect::<Vec<_>>();

		let results: Result<Vec<(BlockId, NodeLabel, NodeLabel)>, Error> =
			futures::future::try_join_all(transfers).await;

		let hosts = match results {
			Ok(hosts) => hosts,
			Err(e) => {
				warn!("Upload of {} aborted, rolling back: {}", name, e);
				let placed = placed.lock().unwrap().split_off(0);
				self.rollback(placed).await;
				return Err(e);
			}
		};

		let block_entries = hosts
			.into_iter()
			.map(|(id, original, replica)| {
				let size = plans[id.index as usize].size;
				BlockEntry {
					id,
					size,
					original,
					replica,
				}
			})
			.collect::<Vec<_>>();
		let file = FileEntry {
			name: name.clone(),
			size: data.len() as u64,
			owner: me,
			created_msec: now_msec(),
			blocks: block_entries.iter().map(|b| b.id.clone()).collect(),
		};

		if let Err(e) = self.registry.add_file(file.clone(), block_entries.clone()) {
			// somebody else announced the same name while we uploaded
			warn!("Upload of {} lost a name race: {}", name, e);
			let placed = placed.lock().unwrap().split_off(0);
			self.rollback(placed).await;
			return Ok(UploadOutcome::DuplicateName);
		}

		self.broadcast_announce(FileAnnounceMsg {
			file,
			blocks: block_entries,
		})
		.await;
		self.system.broadcast_usage().await;

		info!("Uploaded {} ({} bytes)", name, data.len());
		Ok(UploadOutcome::Ok)
	}

	/// Store one block on an original and a replica host, walking the
	/// fallback order when a host refuses or cannot be reached
	async fn place_block(
		self: &Arc<Self>,
		id: BlockId,
		plan: BlockPlan,
		bytes: Bytes,
		placed: Arc<Mutex<Vec<PlacedBlock>>>,
	) -> Result<(BlockId, NodeLabel, NodeLabel), Error> {
		let original = self
			.store_on_first(&id, &plan, bytes.clone(), false, None, &placed)
			.await?;
		let replica = self
			.store_on_first(&id, &plan, bytes, true, Some(original), &placed)
			.await?;
		Ok((id, original, replica))
	}

	async fn store_on_first(
		self: &Arc<Self>,
		id: &BlockId,
		plan: &BlockPlan,
		bytes: Bytes,
		is_replica: bool,
		exclude: Option<NodeLabel>,
		placed: &Arc<Mutex<Vec<PlacedBlock>>>,
	) -> Result<NodeLabel, Error> {
		let preferred = if is_replica { plan.replica } else { plan.original };
		let mut candidates = vec![preferred];
		candidates.extend(plan.fallbacks.iter().filter(|l| **l != preferred).copied());

		let mut last_err = None;
		for host in candidates {
			if Some(host) == exclude {
				continue;
			}
			match self.store_on(host, id, is_replica, bytes.clone()).await {
				Ok(()) => {
					placed.lock().unwrap().push(PlacedBlock {
						id: id.clone(),
						host,
					});
					return Ok(host);
				}
				Err(e) => {
					debug!(
						"Could not store block {}#{} on {}: {}",
						id.file, id.index, host, e
					);
					last_err = Some(e);
				}
			}
		}
		Err(last_err.unwrap_or_else(|| {
			Error::Message(format!(
				"no candidate host left for block {}#{}",
				id.file, id.index
			))
		}))
	}

	/// Store one block on one host, locally or over the wire
	async fn store_on(
		&self,
		host: NodeLabel,
		id: &BlockId,
		is_replica: bool,
		bytes: Bytes,
	) -> Result<(), Error> {
		if Some(host) == self.system.local_label() {
			match self.blocks.put(id, &bytes[..]).await? {
				PutOutcome::Ok => Ok(()),
				PutOutcome::NoSpace => Err(Error::Message("no_space".into())),
			}
		} else {
			let addr = self.addr_of(host)?;
			let res = self.blocks.send_block(addr, id, is_replica, bytes).await;
			if let Err(Error::PeerUnreachable(_, _)) = &res {
				self.system.note_unreachable(host);
			}
			res
		}
	}

	/// Best-effort teardown of the placements of a failed upload
	async fn rollback(&self, placed: Vec<PlacedBlock>) {
		for p in placed {
			if let Err(e) = self.delete_on(p.host, &p.id).await {
				debug!(
					"Rollback of block {}#{} on {} failed: {}",
					p.id.file, p.id.index, p.host, e
				);
				self.remember_pending_delete(p.host, p.id);
			}
		}
	}

	// ---- Download ----

	/// Reassemble a file into `local_path`, preferring original hosts
	/// and falling back to replicas. Nothing is left behind on failure.
	pub async fn download(
		self: &Arc<Self>,
		name: &str,
		local_path: &Path,
	) -> Result<DownloadOutcome, Error> {
		let file = match self.registry.file(name) {
			Some(f) => f,
			None => return Ok(DownloadOutcome::Missing),
		};

		let mut tmp_path = local_path.to_path_buf();
		tmp_path.set_extension("part");
		let mut out = tokio::fs::File::create(&tmp_path).await?;

		for id in file.blocks.iter() {
			match self.fetch_one_block(id).await {
				Some(bytes) => {
					if let Err(e) = out.write_all(&bytes[..]).await {
						drop(out);
						let _ = tokio::fs::remove_file(&tmp_path).await;
						return Err(e.into());
					}
				}
				None => {
					drop(out);
					let _ = tokio::fs::remove_file(&tmp_path).await;
					return Ok(DownloadOutcome::Unavailable(id.index));
				}
			}
		}

		out.sync_all().await?;
		drop(out);
		tokio::fs::rename(&tmp_path, local_path).await?;

		info!("Downloaded {} to {}", name, local_path.display());
		Ok(DownloadOutcome::Ok)
	}

	/// Try the original host, then the replica. None when no online
	/// host could produce the block.
	async fn fetch_one_block(&self, id: &BlockId) -> Option<Bytes> {
		let entry = self.registry.block(id)?;
		for host in [entry.original, entry.replica] {
			let online = self
				.registry
				.node(host)
				.map(|n| n.is_online())
				.unwrap_or(false);
			if !online {
				continue;
			}
			match self.fetch_from(host, id).await {
				Ok(Some(bytes)) if bytes.len() as u64 == entry.size => return Some(bytes),
				Ok(Some(bytes)) => {
					warn!(
						"Host {} returned {} bytes for block {}#{}, expected {}",
						host,
						bytes.len(),
						id.file,
						id.index,
						entry.size
					);
				}
				Ok(None) => {
					warn!("Host {} does not hold block {}#{}", host, id.file, id.index);
				}
				Err(e) => {
					warn!(
						"Could not fetch block {}#{} from {}: {}",
						id.file, id.index, host, e
					);
				}
			}
		}
		None
	}

	async fn fetch_from(&self, host: NodeLabel, id: &BlockId) -> Result<Option<Bytes>, Error> {
		if Some(host) == self.system.local_label() {
			self.blocks.get(id).await
		} else {
			let addr = self.addr_of(host)?;
			let res = self.blocks.fetch_block(addr, id).await;
			if let Err(Error::PeerUnreachable(_, _)) = &res {
				self.system.note_unreachable(host);
			}
			res
		}
	}

	// ---- Delete ----

	/// Remove a file everywhere: metadata first (broadcast
	/// immediately), block placements best effort with a retry queue
	/// for offline hosts
	pub async fn delete(self: &Arc<Self>, name: &str) -> Result<DeleteOutcome, Error> {
		let (_file, blocks) = match self.registry.remove_file(name) {
			Some(removed) => removed,
			None => return Ok(DeleteOutcome::Missing),
		};

		self.broadcast_delete(FileDeleteMsg {
			name: name.to_string(),
		})
		.await;

		for entry in blocks.iter() {
			for host in [entry.original, entry.replica] {
				if let Err(e) = self.delete_on(host, &entry.id).await {
					debug!(
						"Delete of block {}#{} on {} deferred: {}",
						entry.id.file, entry.id.index, host, e
					);
					self.remember_pending_delete(host, entry.id.clone());
				}
			}
		}
		self.system.broadcast_usage().await;

		info!("Deleted {}", name);
		Ok(DeleteOutcome::Ok)
	}

	async fn delete_on(&self, host: NodeLabel, id: &BlockId) -> Result<(), Error> {
		if Some(host) == self.system.local_label() {
			self.blocks.delete(id).await
		} else {
			let online = self
				.registry
				.node(host)
				.map(|n| n.is_online())
				.unwrap_or(false);
			if !online {
				return Err(Error::Message(format!("{} is offline", host)));
			}
			let addr = self.addr_of(host)?;
			self.blocks.drop_block(addr, id).await
		}
	}

	fn remember_pending_delete(&self, host: NodeLabel, id: BlockId) {
		if Some(host) == self.system.local_label() {
			return;
		}
		self.pending_deletes
			.lock()
			.unwrap()
			.entry(host)
			.or_default()
			.push(id);
	}

	/// Retry deferred block deletions whenever their host comes back
	pub async fn pending_delete_worker(
		self: Arc<Self>,
		mut peer_return_rx: mpsc::UnboundedReceiver<NodeLabel>,
		mut must_exit: watch::Receiver<bool>,
	) {
		while !*must_exit.borrow() {
			let label = select! {
				label = peer_return_rx.recv() => match label {
					Some(l) => l,
					None => return,
				},
				_ = must_exit.changed() => continue,
			};

			let ids = self
				.pending_deletes
				.lock()
				.unwrap()
				.remove(&label)
				.unwrap_or_default();
			if ids.is_empty() {
				continue;
			}
			info!(
				"{} is back, retrying {} deferred block deletions",
				label,
				ids.len()
			);
			for id in ids {
				if let Err(e) = self.delete_on(label, &id).await {
					debug!(
						"Deferred delete of {}#{} on {} failed again: {}",
						id.file, id.index, label, e
					);
					self.remember_pending_delete(label, id);
				}
			}
		}
	}

	// ---- Wire protocol service ----

	/// Handle the file subset of the reliable channel
	pub async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<Frame, Error> {
		match frame.opcode {
			OpCode::FileAnnounce => {
				let msg: FileAnnounceMsg = decode_payload(&frame.payload[..])?;
				self.registry.apply_announce(msg.file, msg.blocks);
				Ok(Frame::ack(&frame))
			}
			OpCode::FileDelete => {
				let msg: FileDeleteMsg = decode_payload(&frame.payload[..])?;
				if let Some((file, _blocks)) = self.registry.remove_file(&msg.name) {
					// drop whatever we hold for this file
					for id in file.blocks.iter() {
						if let Err(e) = self.blocks.delete(id).await {
							warn!(
								"Could not drop block {}#{}: {}",
								id.file, id.index, e
							);
						}
					}
				}
				Ok(Frame::ack(&frame))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	async fn broadcast_announce(&self, msg: FileAnnounceMsg) {
		let payload = match encode_payload(&msg) {
			Ok(p) => p,
			Err(e) => {
				error!("Could not encode file announce: {}", e);
				return;
			}
		};
		self.broadcast(OpCode::FileAnnounce, payload).await;
	}

	async fn broadcast_delete(&self, msg: FileDeleteMsg) {
		let payload = match encode_payload(&msg) {
			Ok(p) => p,
			Err(e) => {
				error!("Could not encode file delete: {}", e);
				return;
			}
		};
		self.broadcast(OpCode::FileDelete, payload).await;
	}

	async fn broadcast(&self, opcode: OpCode, payload: Bytes) {
		let me = self.system.local_label();
		for peer in self.registry.online_nodes() {
			if Some(peer.label) == me {
				continue;
			}
			if let Err(e) = self
				.system
				.pool
				.request_ack(peer.addr, opcode, payload.clone(), REQUEST_TIMEOUT)
				.await
			{
				debug!("Could not broadcast to {}: {}", peer.label, e);
			}
		}
	}

	fn addr_of(&self, label: NodeLabel) -> Result<SocketAddr, Error> {
		self.registry
			.node(label)
			.map(|n| n.addr)
			.ok_or_message(format!("no such node: {}", label))
	}
}

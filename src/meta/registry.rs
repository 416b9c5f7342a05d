//! The canonical metadata tables and their convergence rules
//!
//! Every node holds a full replica of these tables. Mutations happen
//! under one mutex, are stamped with a monotonic version number, and
//! are persisted by a write-behind snapshot worker. Convergence
//! between replicas is last-writer-wins per whole entity; deleting a
//! file is terminal.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::{watch, Notify};

use trastero_util::error::Error;
use trastero_util::persister::Persister;
use trastero_util::time::now_msec;

use crate::schema::*;

const SNAPSHOT_FILE: &str = "metadata_snapshot";

/// The full replicated state: what is persisted to disk and what
/// crosses the wire in a `META_SYNC` answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
	/// Counts mutations applied by this replica; only ever grows
	pub version: u64,
	pub nodes: HashMap<NodeLabel, NodeEntry>,
	pub files: HashMap<String, FileEntry>,
	pub blocks: HashMap<BlockId, BlockEntry>,
	/// Deleted file names with their deletion timestamp. Terminal: an
	/// entry here wins against any announce not strictly newer.
	pub deleted_files: HashMap<String, u64>,
}

impl Snapshot {
	/// Whether at least one of the block's two hosts is online
	pub fn block_available(&self, entry: &BlockEntry) -> bool {
		let online = |label: NodeLabel| {
			self.nodes
				.get(&label)
				.map(|n| n.is_online())
				.unwrap_or(false)
		};
		online(entry.original) || online(entry.replica)
	}

	/// Whether every block of the file has at least one online host
	pub fn file_retrievable(&self, file: &FileEntry) -> bool {
		file.blocks.iter().all(|id| {
			self.blocks
				.get(id)
				.map(|b| self.block_available(b))
				.unwrap_or(false)
		})
	}

	/// How one block relates to the node `me`
	pub fn block_status(&self, entry: &BlockEntry, me: NodeLabel) -> BlockStatus {
		if entry.original == me {
			BlockStatus::OriginalHere
		} else if entry.replica == me {
			BlockStatus::ReplicaHere
		} else if !self.nodes.contains_key(&entry.original)
			|| !self.nodes.contains_key(&entry.replica)
		{
			BlockStatus::FreeHere
		} else if self.block_available(entry) {
			BlockStatus::PresentElsewhere
		} else {
			BlockStatus::OfflineElsewhere
		}
	}
}

/// The registry owning the canonical tables of this node
pub struct Registry {
	inner: Mutex<Snapshot>,
	persister: Persister<Snapshot>,
	dirty: Notify,
}

impl Registry {
	/// Load the persisted snapshot, or start empty if there is none.
	/// A snapshot that exists but cannot be decoded refuses to load,
	/// leaving the file intact for inspection.
	pub fn load(metadata_dir: &Path) -> Result<Arc<Self>, Error> {
		let persister = Persister::new(metadata_dir, SNAPSHOT_FILE);
		let snapshot = match persister.load() {
			Ok(snap) => snap,
			Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
				info!("No metadata snapshot found, starting with empty tables");
				Snapshot::default()
			}
			Err(e) => return Err(e),
		};
		Ok(Arc::new(Self {
			inner: Mutex::new(snapshot),
			persister,
			dirty: Notify::new(),
		}))
	}

	#[cfg(test)]
	pub fn new_in_memory(dir: &Path) -> Arc<Self> {
		Self::load(dir).unwrap()
	}

	fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
		f(&self.inner.lock().unwrap())
	}

	fn mutate<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
		let mut inner = self.inner.lock().unwrap();
		let r = f(&mut inner);
		inner.version += 1;
		drop(inner);
		self.dirty.notify_one();
		r
	}

	// ---- Mutators ----

	/// Insert or replace a node row
	pub fn upsert_node(&self, entry: NodeEntry) {
		self.mutate(|snap| {
			snap.nodes.insert(entry.label, entry);
		})
	}

	/// Change the liveness of a node. Returns false if the node is
	/// unknown or already in the requested state.
	pub fn mark_node(&self, label: NodeLabel, liveness: Liveness) -> bool {
		self.mutate(|snap| match snap.nodes.get_mut(&label) {
			Some(node) if node.liveness != liveness => {
				node.liveness = liveness;
				node.updated_msec = now_msec();
				true
			}
			_ => false,
		})
	}

	/// Refresh a node's declared capacity and used bytes, as carried
	/// by heartbeats and `CAPACITY_UPDATE`
	pub fn update_node_usage(&self, label: NodeLabel, capacity_bytes: u64, used_bytes: u64) {
		self.mutate(|snap| {
			if let Some(node) = snap.nodes.get_mut(&label) {
				node.capacity_bytes = capacity_bytes;
				node.used_bytes = used_bytes;
				node.updated_msec = now_msec();
			}
		})
	}

	/// Pick the label for a joining node: its claimed label if that
	/// slot exists, is offline and the claim was authenticated, else
	/// one past the current maximum.
	pub fn allocate_label(&self, claimed: Option<NodeLabel>, claim_ok: bool) -> NodeLabel {
		self.read(|snap| {
			if let Some(c) = claimed {
				if claim_ok
					&& snap
						.nodes
						.get(&c)
						.map(|n| n.liveness == Liveness::Offline)
						.unwrap_or(false)
				{
					return c;
				}
			}
			NodeLabel(snap.nodes.keys().map(|l| l.0).max().unwrap_or(0) + 1)
		})
	}

	/// Record a freshly uploaded file and its blocks. The caller built
	/// the entries; this checks the structural invariants hold.
	pub fn add_file(&self, file: FileEntry, blocks: Vec<BlockEntry>) -> Result<(), Error> {
		check_file_shape(&file, &blocks)?;
		self.mutate(|snap| {
			if let Some(ts) = snap.deleted_files.get(&file.name) {
				if *ts >= file.created_msec {
					return Err(Error::Message(format!(
						"file {} was deleted at {}, refusing to resurrect it",
						file.name, ts
					)));
				}
			}
			if snap.files.contains_key(&file.name) {
				return Err(Error::Message(format!(
					"file {} already exists",
					file.name
				)));
			}
			for b in blocks {
				snap.blocks.insert(b.id.clone(), b);
			}
			snap.files.insert(file.name.clone(), file);
			Ok(())
		})
	}

	/// Apply a `FILE_ANNOUNCE` received from a peer. Unlike `add_file`
	/// this is idempotent and silently loses against tombstones.
	/// Returns whether anything changed.
	pub fn apply_announce(&self, file: FileEntry, blocks: Vec<BlockEntry>) -> bool {
		if check_file_shape(&file, &blocks).is_err() {
			warn!("Ignoring malformed announce for file {}", file.name);
			return false;
		}
		self.mutate(|snap| {
			if let Some(ts) = snap.deleted_files.get(&file.name) {
				if *ts >= file.created_msec {
					return false;
				}
			}
			if snap.files.contains_key(&file.name) {
				return false;
			}
			for b in blocks {
				snap.blocks.insert(b.id.clone(), b);
			}
			snap.files.insert(file.name.clone(), file);
			true
		})
	}

	/// Delete a file: its entry and blocks go away, a terminal
	/// tombstone remains. Returns the removed rows so the caller can
	/// tear the block placements down.
	pub fn remove_file(&self, name: &str) -> Option<(FileEntry, Vec<BlockEntry>)> {
		self.mutate(|snap| {
			let entry = snap.files.remove(name)?;
			let blocks = entry
				.blocks
				.iter()
				.filter_map(|id| snap.blocks.remove(id))
				.collect();
			snap.deleted_files.insert(name.to_string(), now_msec());
			Some((entry, blocks))
		})
	}

	/// Replace the two placements of one block
	pub fn set_block_hosts(
		&self,
		id: &BlockId,
		original: NodeLabel,
		replica: NodeLabel,
	) -> Result<(), Error> {
		if original == replica {
			return Err(Error::Message(format!(
				"block {}#{} would have both placements on {}",
				id.file, id.index, original
			)));
		}
		self.mutate(|snap| match snap.blocks.get_mut(id) {
			Some(entry) => {
				entry.original = original;
				entry.replica = replica;
				Ok(())
			}
			None => Err(Error::Message(format!(
				"unknown block {}#{}",
				id.file, id.index
			))),
		})
	}

	/// Merge a snapshot received from a peer (`META_SYNC` or
	/// `WELCOME`). Returns whether anything changed locally.
	pub fn merge(&self, remote: &Snapshot) -> bool {
		self.mutate(|snap| {
			let mut changed = false;

			// Node rows: last-writer-wins, preferring the highest
			// observed (used_bytes, timestamp) pair
			for (label, rnode) in remote.nodes.iter() {
				match snap.nodes.get(label) {
					None => {
						snap.nodes.insert(*label, rnode.clone());
						changed = true;
					}
					Some(lnode) => {
						let lkey = (lnode.used_bytes, lnode.updated_msec);
						let rkey = (rnode.used_bytes, rnode.updated_msec);
						if rkey > lkey {
							snap.nodes.insert(*label, rnode.clone());
							changed = true;
						}
					}
				}
			}

			// Tombstones: union, newest deletion timestamp wins
			for (name, rts) in remote.deleted_files.iter() {
				let lts = snap.deleted_files.get(name).copied();
				if lts.map(|t| t < *rts).unwrap_or(true) {
					snap.deleted_files.insert(name.clone(), *rts);
					changed = true;
				}
			}

			// Apply tombstones to our live files: deletes are terminal
			let dead = snap
				.files
				.iter()
				.filter(|(name, f)| {
					snap.deleted_files
						.get(*name)
						.map(|ts| *ts >= f.created_msec)
						.unwrap_or(false)
				})
				.map(|(name, _)| name.clone())
				.collect::<Vec<_>>();
			for name in dead {
				let entry = snap.files.remove(&name).unwrap();
				for id in entry.blocks.iter() {
					snap.blocks.remove(id);
				}
				changed = true;
			}

			// Files and their blocks are created once: adopt the ones
			// we have never seen, unless a tombstone covers them
			for (name, rfile) in remote.files.iter() {
				if snap.files.contains_key(name) {
					continue;
				}
				if snap
					.deleted_files
					.get(name)
					.map(|ts| *ts >= rfile.created_msec)
					.unwrap_or(false)
				{
					continue;
				}
				for id in rfile.blocks.iter() {
					if let Some(rblock) = remote.blocks.get(id) {
						snap.blocks.insert(id.clone(), rblock.clone());
					}
				}
				snap.files.insert(name.clone(), rfile.clone());
				changed = true;
			}

			if remote.version > snap.version {
				snap.version = remote.version;
			}

			changed
		})
	}

	// ---- Read views ----

	/// Clone the full state, for META_SYNC answers and WELCOME
	pub fn snapshot(&self) -> Snapshot {
		self.read(|snap| snap.clone())
	}

	pub fn version(&self) -> u64 {
		self.read(|snap| snap.version)
	}

	pub fn node(&self, label: NodeLabel) -> Option<NodeEntry> {
		self.read(|snap| snap.nodes.get(&label).cloned())
	}

	/// All node rows, sorted by label
	pub fn list_nodes(&self) -> Vec<NodeEntry> {
		self.read(|snap| {
			let mut nodes = snap.nodes.values().cloned().collect::<Vec<_>>();
			nodes.sort_by_key(|n| n.label);
			nodes
		})
	}

	/// Online node rows, sorted by label
	pub fn online_nodes(&self) -> Vec<NodeEntry> {
		self.read(|snap| {
			let mut nodes = snap
				.nodes
				.values()
				.filter(|n| n.is_online())
				.cloned()
				.collect::<Vec<_>>();
			nodes.sort_by_key(|n| n.label);
			nodes
		})
	}

	pub fn file(&self, name: &str) -> Option<FileEntry> {
		self.read(|snap| snap.files.get(name).cloned())
	}

	/// All file rows, sorted by name
	pub fn list_files(&self) -> Vec<FileEntry> {
		self.read(|snap| {
			let mut files = snap.files.values().cloned().collect::<Vec<_>>();
			files.sort_by(|a, b| a.name.cmp(&b.name));
			files
		})
	}

	pub fn block(&self, id: &BlockId) -> Option<BlockEntry> {
		self.read(|snap| snap.blocks.get(id).cloned())
	}

	/// All block rows with their status relative to `me`, sorted by
	/// (file, index)
	pub fn list_blocks(&self, me: NodeLabel) -> Vec<(BlockEntry, BlockStatus)> {
		self.read(|snap| {
			let mut blocks = snap
				.blocks
				.values()
				.map(|b| (b.clone(), snap.block_status(b, me)))
				.collect::<Vec<_>>();
			blocks.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
			blocks
		})
	}

	pub fn file_retrievable(&self, name: &str) -> Option<bool> {
		self.read(|snap| {
			snap.files
				.get(name)
				.map(|f| snap.file_retrievable(f))
		})
	}

	/// (total free bytes, total used bytes) over online nodes
	pub fn totals(&self) -> (u64, u64) {
		self.read(|snap| {
			snap.nodes
				.values()
				.filter(|n| n.is_online())
				.fold((0, 0), |(free, used), n| {
					(free + n.free_bytes(), used + n.used_bytes)
				})
		})
	}

	// ---- Snapshot write-behind ----

	/// Persist the tables whenever they change. At most one write is
	/// in flight; mutations arriving during a write coalesce into the
	/// next one. A final write happens on shutdown.
	pub async fn snapshot_worker(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			select! {
				_ = self.dirty.notified() => {
					let snap = self.snapshot();
					if let Err(e) = self.persister.save_async(&snap).await {
						error!("Could not persist metadata snapshot: {}", e);
					}
				}
				_ = must_exit.changed() => (),
			}
		}
		let snap = self.snapshot();
		if let Err(e) = self.persister.save_async(&snap).await {
			error!("Could not persist final metadata snapshot: {}", e);
		}
	}
}

fn check_file_shape(file: &FileEntry, blocks: &[BlockEntry]) -> Result<(), Error> {
	if blocks.len() != file.blocks.len() {
		return Err(Error::Message(format!(
			"file {} lists {} blocks but {} were given",
			file.name,
			file.blocks.len(),
			blocks.len()
		)));
	}
	let mut total = 0;
	for (i, b) in blocks.iter().enumerate() {
		if b.id.file != file.name || b.id.index != i as u32 || file.blocks[i] != b.id {
			return Err(Error::Message(format!(
				"file {} has inconsistent block identifiers",
				file.name
			)));
		}
		if b.original == b.replica {
			return Err(Error::Message(format!(
				"block {}#{} has both placements on {}",
				b.id.file, b.id.index, b.original
			)));
		}
		total += b.size;
	}
	if total != file.size {
		return Err(Error::Message(format!(
			"file {} declares {} bytes but its blocks sum to {}",
			file.name, file.size, total
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(k: u32, liveness: Liveness, used: u64, updated: u64) -> NodeEntry {
		NodeEntry {
			label: NodeLabel(k),
			addr: format!("10.0.0.{}:8888", k).parse().unwrap(),
			udp_port: 8889,
			capacity_bytes: 100 * 1024 * 1024,
			used_bytes: used,
			liveness,
			updated_msec: updated,
		}
	}

	fn file_with_blocks(name: &str, sizes: &[u64], hosts: &[(u32, u32)]) -> (FileEntry, Vec<BlockEntry>) {
		let blocks = sizes
			.iter()
			.zip(hosts.iter())
			.enumerate()
			.map(|(i, (size, (o, r)))| BlockEntry {
				id: BlockId {
					file: name.to_string(),
					index: i as u32,
				},
				size: *size,
				original: NodeLabel(*o),
				replica: NodeLabel(*r),
			})
			.collect::<Vec<_>>();
		let file = FileEntry {
			name: name.to_string(),
			size: sizes.iter().sum(),
			owner: NodeLabel(1),
			created_msec: now_msec(),
			blocks: blocks.iter().map(|b| b.id.clone()).collect(),
		};
		(file, blocks)
	}

	fn test_registry() -> (Arc<Registry>, mktemp::Temp) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let reg = Registry::new_in_memory(&dir.to_path_buf());
		(reg, dir)
	}

	#[test]
	fn test_allocate_label() {
		let (reg, _dir) = test_registry();
		assert_eq!(reg.allocate_label(None, false), NodeLabel(1));

		reg.upsert_node(node(1, Liveness::Online, 0, 1));
		reg.upsert_node(node(2, Liveness::Online, 0, 1));
		reg.upsert_node(node(3, Liveness::Offline, 0, 1));

		// a fresh joiner goes one past the maximum, even though nodo3
		// is offline
		assert_eq!(reg.allocate_label(None, false), NodeLabel(4));
		// an authenticated claim on the offline slot reclaims it
		assert_eq!(reg.allocate_label(Some(NodeLabel(3)), true), NodeLabel(3));
		// an unauthenticated claim does not
		assert_eq!(reg.allocate_label(Some(NodeLabel(3)), false), NodeLabel(4));
		// claiming an online slot does not work either
		assert_eq!(reg.allocate_label(Some(NodeLabel(2)), true), NodeLabel(4));
	}

	#[test]
	fn test_add_file_checks_shape() {
		let (reg, _dir) = test_registry();

		let (file, blocks) = file_with_blocks("a.bin", &[10, 10, 4], &[(1, 2), (2, 1), (1, 2)]);
		reg.add_file(file.clone(), blocks.clone()).unwrap();
		assert!(reg.add_file(file, blocks).is_err());

		let (mut bad, blocks) = file_with_blocks("b.bin", &[10], &[(1, 2)]);
		bad.size = 11;
		assert!(reg.add_file(bad, blocks).is_err());

		let (file, mut blocks) = file_with_blocks("c.bin", &[10], &[(1, 2)]);
		blocks[0].replica = NodeLabel(1);
		assert!(reg.add_file(file, blocks).is_err());
	}

	#[test]
	fn test_delete_is_terminal() {
		let (reg, _dir) = test_registry();
		let (file, blocks) = file_with_blocks("doc.bin", &[10, 10], &[(1, 2), (2, 1)]);
		let created = file.created_msec;
		reg.add_file(file.clone(), blocks.clone()).unwrap();

		let (removed, removed_blocks) = reg.remove_file("doc.bin").unwrap();
		assert_eq!(removed_blocks.len(), 2);
		assert!(reg.file("doc.bin").is_none());
		assert!(reg.block(&removed.blocks[0]).is_none());
		// second delete reports missing
		assert!(reg.remove_file("doc.bin").is_none());

		// a replayed announce of the deleted file is ignored
		let mut old = file.clone();
		old.created_msec = created;
		assert!(!reg.apply_announce(old, blocks.clone()));
		assert!(reg.file("doc.bin").is_none());

		// but a genuinely new upload with the same name is accepted
		let (mut fresh, fresh_blocks) =
			file_with_blocks("doc.bin", &[10, 10], &[(1, 2), (2, 1)]);
		fresh.created_msec = now_msec() + 10;
		assert!(reg.apply_announce(fresh, fresh_blocks));
		assert!(reg.file("doc.bin").is_some());
	}

	#[test]
	fn test_merge_converges() {
		let (a, _da) = test_registry();
		let (b, _db) = test_registry();

		a.upsert_node(node(1, Liveness::Online, 0, 10));
		a.upsert_node(node(2, Liveness::Online, 0, 10));
		b.merge(&a.snapshot());

		let (file, blocks) = file_with_blocks("x.bin", &[5, 5], &[(1, 2), (2, 1)]);
		a.add_file(file, blocks).unwrap();
		let (file2, blocks2) = file_with_blocks("y.bin", &[7], &[(2, 1)]);
		b.add_file(file2, blocks2).unwrap();
		b.remove_file("y.bin");

		// one sync round in each direction
		b.merge(&a.snapshot());
		a.merge(&b.snapshot());
		b.merge(&a.snapshot());

		let sa = a.snapshot();
		let sb = b.snapshot();
		assert_eq!(sa.nodes, sb.nodes);
		assert_eq!(sa.files, sb.files);
		assert_eq!(sa.blocks, sb.blocks);
		assert_eq!(sa.deleted_files, sb.deleted_files);
		assert!(sa.files.contains_key("x.bin"));
		assert!(!sa.files.contains_key("y.bin"));
	}

	#[test]
	fn test_merge_node_tie_break() {
		let (a, _da) = test_registry();
		a.upsert_node(node(1, Liveness::Online, 100, 5));

		// lower (used, timestamp) pair loses even if it arrives later
		let mut remote = Snapshot::default();
		remote.nodes.insert(NodeLabel(1), node(1, Liveness::Offline, 50, 9));
		assert!(!a.merge(&remote));
		assert_eq!(a.node(NodeLabel(1)).unwrap().used_bytes, 100);

		// higher pair wins
		let mut remote = Snapshot::default();
		remote.nodes.insert(NodeLabel(1), node(1, Liveness::Offline, 100, 6));
		assert!(a.merge(&remote));
		let n = a.node(NodeLabel(1)).unwrap();
		assert_eq!(n.updated_msec, 6);
		assert_eq!(n.liveness, Liveness::Offline);
	}

	#[test]
	fn test_availability_views() {
		let (reg, _dir) = test_registry();
		reg.upsert_node(node(1, Liveness::Online, 0, 1));
		reg.upsert_node(node(2, Liveness::Offline, 0, 1));
		reg.upsert_node(node(3, Liveness::Online, 0, 1));

		let (file, blocks) = file_with_blocks("f.bin", &[4, 4], &[(1, 2), (2, 1)]);
		reg.add_file(file, blocks).unwrap();
		// both blocks have one online host
		assert_eq!(reg.file_retrievable("f.bin"), Some(true));

		let (file2, blocks2) = file_with_blocks("g.bin", &[4], &[(2, 2)]);
		// shape check refuses same-host placements outright
		assert!(reg.add_file(file2, blocks2).is_err());

		reg.mark_node(NodeLabel(1), Liveness::Offline);
		// now both hosts of block 0 are offline
		assert_eq!(reg.file_retrievable("f.bin"), Some(false));

		let statuses = reg
			.list_blocks(NodeLabel(1))
			.into_iter()
			.map(|(_, s)| s)
			.collect::<Vec<_>>();
		assert_eq!(statuses, vec![BlockStatus::OriginalHere, BlockStatus::ReplicaHere]);

		let statuses = reg
			.list_blocks(NodeLabel(3))
			.into_iter()
			.map(|(_, s)| s)
			.collect::<Vec<_>>();
		assert_eq!(
			statuses,
			vec![BlockStatus::OfflineElsewhere, BlockStatus::OfflineElsewhere]
		);
	}

	#[test]
	fn test_set_block_hosts() {
		let (reg, _dir) = test_registry();
		let (file, blocks) = file_with_blocks("m.bin", &[8], &[(1, 2)]);
		let id = blocks[0].id.clone();
		reg.add_file(file, blocks).unwrap();

		reg.set_block_hosts(&id, NodeLabel(3), NodeLabel(2)).unwrap();
		let entry = reg.block(&id).unwrap();
		assert_eq!(entry.original, NodeLabel(3));
		assert_eq!(entry.replica, NodeLabel(2));

		// both placements on one node is never acceptable
		assert!(reg.set_block_hosts(&id, NodeLabel(2), NodeLabel(2)).is_err());
		// unknown blocks are reported
		let ghost = BlockId {
			file: "ghost".into(),
			index: 0,
		};
		assert!(reg.set_block_hosts(&ghost, NodeLabel(1), NodeLabel(2)).is_err());
	}

	#[test]
	fn test_version_is_monotonic() {
		let (reg, _dir) = test_registry();
		let v0 = reg.version();
		reg.upsert_node(node(1, Liveness::Online, 0, 1));
		let v1 = reg.version();
		assert!(v1 > v0);
		reg.mark_node(NodeLabel(1), Liveness::Offline);
		assert!(reg.version() > v1);
	}

	#[tokio::test]
	async fn test_snapshot_worker_persists() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let reg = Registry::load(&dir.to_path_buf()).unwrap();

		let (_tx, rx) = watch::channel(false);
		let worker = tokio::spawn(reg.clone().snapshot_worker(rx));

		reg.upsert_node(node(1, Liveness::Online, 0, 1));

		let mut path = dir.to_path_buf();
		path.push(SNAPSHOT_FILE);
		for _ in 0..200 {
			if path.exists() {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
		}
		assert!(path.exists());

		// a fresh registry rehydrates from the snapshot
		let reg2 = Registry::load(&dir.to_path_buf()).unwrap();
		assert_eq!(reg2.node(NodeLabel(1)).unwrap().label, NodeLabel(1));

		worker.abort();
	}
}

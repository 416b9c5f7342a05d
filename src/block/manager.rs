//! On-disk block files and the block subset of the reliable channel
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use trastero_meta::schema::BlockId;
use trastero_net::message::*;
use trastero_net::BLOCK_TRANSFER_TIMEOUT;
use trastero_rpc::system::System;
use trastero_util::error::*;

/// Extension of every block file in the shared directory
const BLOCK_FILE_SUFFIX: &str = ".blk";

/// Outcome of storing a block locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
	Ok,
	/// The block does not fit in this node's declared capacity
	NoSpace,
}

/// The block manager: owns the bytes of every block whose placement
/// host is this node, and answers the block operations of the wire
/// protocol.
pub struct BlockManager {
	/// Directory in which block files are stored
	pub storage_dir: PathBuf,

	used_bytes: AtomicU64,
	mutation_lock: Mutex<BlockManagerLocked>,

	system: Arc<System>,
}

// Functions in here run with the write lock held: there is never more
// than one mutation of the on-disk store at a time.
struct BlockManagerLocked();

impl BlockManager {
	/// Open the store: create the directory if needed, drop stray
	/// temporary files from an earlier crash, and recompute the
	/// used-bytes counter by scanning the block files.
	pub fn new(storage_dir: PathBuf, system: Arc<System>) -> Result<Arc<Self>, Error> {
		std::fs::create_dir_all(&storage_dir)
			.ok_or_message("Unable to create the block storage directory")?;

		let mut used = 0u64;
		for entry in std::fs::read_dir(&storage_dir)? {
			let entry = entry?;
			if !entry.file_type()?.is_file() {
				continue;
			}
			let name = entry.file_name();
			let name = match name.to_str() {
				Some(n) => n,
				None => continue,
			};
			if name.ends_with(".tmp") {
				warn!("Dropping leftover temporary file {}", name);
				std::fs::remove_file(entry.path())?;
			} else if name.ends_with(BLOCK_FILE_SUFFIX) {
				used += entry.metadata()?.len();
			}
		}
		info!(
			"Block store at {} holds {} bytes",
			storage_dir.display(),
			used
		);

		let manager = Arc::new(Self {
			storage_dir,
			used_bytes: AtomicU64::new(used),
			mutation_lock: Mutex::new(BlockManagerLocked()),
			system,
		});
		manager.system.update_local_usage(used);
		Ok(manager)
	}

	pub fn used_bytes(&self) -> u64 {
		self.used_bytes.load(Ordering::SeqCst)
	}

	pub fn free_bytes(&self) -> u64 {
		self.system
			.capacity_bytes()
			.saturating_sub(self.used_bytes())
	}

	/// Path of the file holding one block: `<filename>__<index>.blk`
	fn block_path(&self, id: &BlockId) -> Result<PathBuf, Error> {
		if id.file.contains('/') || id.file.contains('\\') || id.file.contains("..") {
			return Err(Error::Message(format!(
				"file name {} cannot be used as a block file",
				id.file
			)));
		}
		let mut path = self.storage_dir.clone();
		path.push(format!("{}__{}{}", id.file, id.index, BLOCK_FILE_SUFFIX));
		Ok(path)
	}

	// ---- Local store interface ----

	/// Store a block, replacing a previous copy if there was one
	pub async fn put(&self, id: &BlockId, data: &[u8]) -> Result<PutOutcome, Error> {
		self.mutation_lock
			.lock()
			.await
			.write_block(id, data, self)
			.await
	}

	/// Read a block, None if this node does not hold it
	pub async fn get(&self, id: &BlockId) -> Result<Option<Bytes>, Error> {
		let path = self.block_path(id)?;
		match fs::read(&path).await {
			Ok(data) => Ok(Some(data.into())),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Drop a block. Deleting a block this node does not hold is fine.
	pub async fn delete(&self, id: &BlockId) -> Result<(), Error> {
		self.mutation_lock
			.lock()
			.await
			.delete_block(id, self)
			.await
	}

	fn usage_changed(&self, used: u64) {
		self.used_bytes.store(used, Ordering::SeqCst);
		self.system.update_local_usage(used);
	}

	// ---- Wire protocol service ----

	/// Handle the block subset of the reliable channel
	pub async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<Frame, Error> {
		match frame.opcode {
			OpCode::BlockPut => {
				let put = BlockPutPayload::decode(frame.payload.clone())?;
				let id = BlockId {
					file: put.file,
					index: put.index,
				};
				match self.put(&id, &put.data[..]).await? {
					PutOutcome::Ok => Ok(Frame::ack(&frame)),
					PutOutcome::NoSpace => Err(Error::Message("no_space".into())),
				}
			}
			OpCode::BlockGet => {
				let id: BlockRef = decode_payload(&frame.payload[..])?;
				let id = BlockId {
					file: id.file,
					index: id.index,
				};
				let reply = match self.get(&id).await? {
					Some(data) => BlockGetReplyPayload::found(data),
					None => BlockGetReplyPayload::missing(),
				};
				Ok(Frame::new(
					OpCode::BlockGetReply,
					frame.correlation,
					reply.encode(),
				))
			}
			OpCode::BlockDelete => {
				let id: BlockRef = decode_payload(&frame.payload[..])?;
				let id = BlockId {
					file: id.file,
					index: id.index,
				};
				self.delete(&id).await?;
				Ok(Frame::ack(&frame))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	// ---- Remote block operations ----

	/// Ship one block to a peer and wait for its acknowledgement
	pub async fn send_block(
		&self,
		peer: SocketAddr,
		id: &BlockId,
		is_replica: bool,
		data: Bytes,
	) -> Result<(), Error> {
		let payload = BlockPutPayload {
			file: id.file.clone(),
			index: id.index,
			is_replica,
			data,
		}
		.encode()?;
		self.system
			.pool
			.request_ack(peer, OpCode::BlockPut, payload, BLOCK_TRANSFER_TIMEOUT)
			.await
	}

	/// Fetch one block from a peer, None if the peer does not hold it
	pub async fn fetch_block(
		&self,
		peer: SocketAddr,
		id: &BlockId,
	) -> Result<Option<Bytes>, Error> {
		let payload = encode_payload(&BlockRef {
			file: id.file.clone(),
			index: id.index,
		})?;
		let resp = self
			.system
			.pool
			.request(peer, OpCode::BlockGet, payload, BLOCK_TRANSFER_TIMEOUT)
			.await?;
		match resp.opcode {
			OpCode::BlockGetReply => {
				let reply = BlockGetReplyPayload::decode(resp.payload)?;
				match reply.status {
					BlockGetStatus::Found => Ok(Some(reply.data)),
					BlockGetStatus::Missing => Ok(None),
				}
			}
			OpCode::Error => {
				let msg: String = decode_payload(&resp.payload[..])?;
				Err(Error::Message(msg))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	/// Ask a peer to drop one block
	pub async fn drop_block(&self, peer: SocketAddr, id: &BlockId) -> Result<(), Error> {
		let payload = encode_payload(&BlockRef {
			file: id.file.clone(),
			index: id.index,
		})?;
		self.system
			.pool
			.request_ack(peer, OpCode::BlockDelete, payload, BLOCK_TRANSFER_TIMEOUT)
			.await
	}
}

impl BlockManagerLocked {
	async fn write_block(
		&self,
		id: &BlockId,
		data: &[u8],
		mgr: &BlockManager,
	) -> Result<PutOutcome, Error> {
		let path = mgr.block_path(id)?;

		let previous_len = match fs::metadata(&path).await {
			Ok(meta) => Some(meta.len()),
			Err(_) => None,
		};

		let used = mgr.used_bytes();
		let used_after = used.saturating_sub(previous_len.unwrap_or(0)) + data.len() as u64;
		if used_after > mgr.system.capacity_bytes() {
			return Ok(PutOutcome::NoSpace);
		}

		let mut tmp_path = path.clone();
		tmp_path.set_extension("tmp");
		let mut f = fs::File::create(&tmp_path).await?;
		f.write_all(data).await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(&tmp_path, &path).await?;

		mgr.usage_changed(used_after);
		Ok(PutOutcome::Ok)
	}

	async fn delete_block(&self, id: &BlockId, mgr: &BlockManager) -> Result<(), Error> {
		let path = mgr.block_path(id)?;
		match fs::metadata(&path).await {
			Ok(meta) => {
				let len = meta.len();
				fs::remove_file(&path).await?;
				mgr.usage_changed(mgr.used_bytes().saturating_sub(len));
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
			Err(e) => return Err(e.into()),
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use trastero_meta::registry::Registry;
	use trastero_net::pool::ConnectionPool;
	use trastero_util::config::Config;

	async fn test_manager(dir: &std::path::Path) -> Arc<BlockManager> {
		let config = Config {
			capacity_bytes: 50 * 1024 * 1024,
			tcp_port: 8888,
			udp_port: 0,
			storage_dir: dir.join("blocks"),
			metadata_dir: dir.to_path_buf(),
			block_size: 1024 * 1024,
		};
		let registry = Registry::load(dir).unwrap();
		let pool = ConnectionPool::new(2 * 1024 * 1024);
		let (system, _rx) = System::new(&config, registry, pool).await.unwrap();
		BlockManager::new(config.storage_dir, system).unwrap()
	}

	fn bid(file: &str, index: u32) -> BlockId {
		BlockId {
			file: file.to_string(),
			index,
		}
	}

	#[tokio::test]
	async fn test_put_get_delete() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = test_manager(&dir.to_path_buf()).await;

		let id = bid("doc.bin", 0);
		assert_eq!(mgr.get(&id).await.unwrap(), None);

		assert_eq!(mgr.put(&id, b"hello").await.unwrap(), PutOutcome::Ok);
		assert_eq!(mgr.used_bytes(), 5);
		assert_eq!(&mgr.get(&id).await.unwrap().unwrap()[..], b"hello");

		// the file is named <filename>__<index>.blk
		assert!(mgr.storage_dir.join("doc.bin__0.blk").exists());

		// overwriting replaces, it does not accumulate
		assert_eq!(mgr.put(&id, b"hi").await.unwrap(), PutOutcome::Ok);
		assert_eq!(mgr.used_bytes(), 2);

		mgr.delete(&id).await.unwrap();
		assert_eq!(mgr.used_bytes(), 0);
		assert_eq!(mgr.get(&id).await.unwrap(), None);
		// deleting again is fine
		mgr.delete(&id).await.unwrap();
	}

	#[tokio::test]
	async fn test_no_space() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = test_manager(&dir.to_path_buf()).await;

		for i in 0..3 {
			assert_eq!(
				mgr.put(&bid("fill.bin", i), &[0u8; 1024]).await.unwrap(),
				PutOutcome::Ok
			);
		}
		assert_eq!(mgr.used_bytes(), 3 * 1024);

		// capacity is 50 MiB: a block that would push past it is
		// refused and changes nothing
		let huge = vec![0u8; (50 * 1024 * 1024) as usize];
		assert_eq!(
			mgr.put(&bid("huge.bin", 0), &huge).await.unwrap(),
			PutOutcome::NoSpace
		);
		assert_eq!(mgr.used_bytes(), 3 * 1024);
		assert_eq!(mgr.get(&bid("huge.bin", 0)).await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_used_bytes_rescan_on_startup() {
		let dir = mktemp::Temp::new_dir().unwrap();
		{
			let mgr = test_manager(&dir.to_path_buf()).await;
			mgr.put(&bid("a.bin", 0), &[1u8; 100]).await.unwrap();
			mgr.put(&bid("a.bin", 1), &[2u8; 50]).await.unwrap();
			// leave a stray temporary behind, as a crash would
			std::fs::write(mgr.storage_dir.join("b.bin__0.tmp"), b"junk").unwrap();
		}
		let mgr = test_manager(&dir.to_path_buf()).await;
		assert_eq!(mgr.used_bytes(), 150);
		assert!(!mgr.storage_dir.join("b.bin__0.tmp").exists());
	}

	#[tokio::test]
	async fn test_path_traversal_is_refused() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = test_manager(&dir.to_path_buf()).await;
		assert!(mgr.put(&bid("../evil", 0), b"x").await.is_err());
		assert!(mgr.get(&bid("a/b", 0)).await.is_err());
	}
}

//! An entire Trastero node and the wiring between its components
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use tokio::sync::{mpsc, watch};

use trastero_block::manager::BlockManager;
use trastero_meta::registry::Registry;
use trastero_meta::schema::NodeLabel;
use trastero_net::message::*;
use trastero_net::pool::ConnectionPool;
use trastero_net::server::{run_listener, FrameHandler};
use trastero_rpc::system::System;
use trastero_util::config::Config;
use trastero_util::error::*;
use trastero_util::persister::Persister;

use crate::control::ControlRequest;
use crate::engine::Engine;

/// An entire Trastero node
pub struct Mesh {
	/// The parsed configuration this node is running
	pub config: Config,
	/// The canonical metadata tables
	pub registry: Arc<Registry>,
	/// The membership manager and failure detector
	pub system: Arc<System>,
	/// The local block store
	pub blocks: Arc<BlockManager>,
	/// The placement and transfer engine
	pub engine: Arc<Engine>,

	/// Capacity chosen at runtime through the control surface; wins
	/// over the configuration file on the next boot
	pub(crate) persist_capacity: Persister<u64>,

	peer_return_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<NodeLabel>>>,
}

impl Mesh {
	/// Create a node: load persisted state and wire every component
	pub async fn new(config: Config) -> Result<Arc<Self>, Error> {
		std::fs::create_dir_all(&config.metadata_dir)
			.ok_or_message("Unable to create the metadata directory")?;

		info!("Loading metadata tables...");
		let registry = Registry::load(&config.metadata_dir)?;

		let pool = ConnectionPool::new(config.block_size + PAYLOAD_SLACK);

		info!("Initializing membership manager...");
		let (system, peer_return_rx) = System::new(&config, registry.clone(), pool).await?;

		let persist_capacity = Persister::new(&config.metadata_dir, "capacity_override");
		match persist_capacity.load() {
			Ok(capacity) => {
				if capacity != config.capacity_bytes {
					info!(
						"Using capacity of {} bytes chosen through the control surface",
						capacity
					);
					system.set_capacity(capacity);
				}
			}
			Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => (),
			Err(e) => return Err(e),
		}

		info!("Opening block store...");
		let blocks = BlockManager::new(config.storage_dir.clone(), system.clone())?;

		let engine = Engine::new(
			registry.clone(),
			system.clone(),
			blocks.clone(),
			config.block_size,
		);

		Ok(Arc::new(Self {
			config,
			registry,
			system,
			blocks,
			engine,
			persist_capacity,
			peer_return_rx: std::sync::Mutex::new(Some(peer_return_rx)),
		}))
	}

	/// Spawn every long-running task of the node
	pub fn spawn_workers(self: &Arc<Self>, must_exit: watch::Receiver<bool>) {
		tokio::spawn(self.registry.clone().snapshot_worker(must_exit.clone()));
		tokio::spawn(self.system.clone().run(must_exit.clone()));

		let bind_addr = SocketAddr::new("0.0.0.0".parse().unwrap(), self.config.tcp_port);
		tokio::spawn(run_listener(
			bind_addr,
			self.clone(),
			self.config.block_size + PAYLOAD_SLACK,
			must_exit.clone(),
		));

		if let Some(rx) = self.peer_return_rx.lock().unwrap().take() {
			tokio::spawn(self.engine.clone().pending_delete_worker(rx, must_exit));
		}

		let system = self.system.clone();
		tokio::spawn(async move {
			system.reconnect_stored_peers().await;
		});
	}
}

#[async_trait]
impl FrameHandler for Mesh {
	async fn handle(self: &Arc<Self>, frame: Frame, from: SocketAddr) -> Result<Frame, Error> {
		match frame.opcode {
			OpCode::Hello | OpCode::PeerList | OpCode::MetaSync | OpCode::CapacityUpdate => {
				self.system.handle_frame(frame, from).await
			}
			OpCode::BlockPut | OpCode::BlockGet | OpCode::BlockDelete => {
				self.blocks.handle_frame(frame).await
			}
			OpCode::FileAnnounce | OpCode::FileDelete => self.engine.handle_frame(frame).await,
			OpCode::Control => {
				let req: ControlRequest = decode_payload(&frame.payload[..])?;
				let reply = self.handle_control(req).await;
				Ok(Frame::new(
					OpCode::ControlReply,
					frame.correlation,
					encode_payload(&reply)?,
				))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}
}

//! Module containing structs related to membership management
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::{mpsc, watch};

use trastero_meta::registry::{Registry, Snapshot};
use trastero_meta::schema::*;
use trastero_net::heartbeat::*;
use trastero_net::message::*;
use trastero_net::pool::ConnectionPool;
use trastero_net::REQUEST_TIMEOUT;
use trastero_util::config::Config;
use trastero_util::data::{blake2sum, Fingerprint};
use trastero_util::error::*;
use trastero_util::persister::Persister;
use trastero_util::time::now_msec;

use crate::messages::*;

/// How often the expiry sweeper looks for silent peers
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Consecutive reliable-channel failures after which a peer is flipped
/// to offline ahead of its heartbeat expiry
const UNREACHABLE_FAILURES_LIMIT: u32 = 3;

/// This node's identity within its group, persisted across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
	pub label: Option<NodeLabel>,
	pub group_fingerprint: Option<Fingerprint>,
}

/// Last known addresses of the group, persisted so a restarted node
/// can re-dial without operator help
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerList(pub Vec<(NodeLabel, SocketAddr)>);

/// A node row enriched with what the failure detector knows locally
#[derive(Debug, Clone)]
pub struct KnownNodeInfo {
	pub entry: NodeEntry,
	pub last_seen_secs_ago: Option<u64>,
}

/// This node's membership manager
pub struct System {
	/// The canonical metadata tables
	pub registry: Arc<Registry>,
	/// Outbound reliable-channel connections
	pub pool: Arc<ConnectionPool>,

	heartbeat: HeartbeatSocket,

	persist_node_state: Persister<NodeState>,
	persist_peer_list: Persister<PeerList>,

	identity: RwLock<NodeState>,
	in_group: AtomicBool,

	capacity_bytes: AtomicU64,
	used_bytes: AtomicU64,
	heartbeat_seq: AtomicU64,

	/// When each peer was last heard from, over either channel
	last_seen: RwLock<HashMap<NodeLabel, Instant>>,
	/// Consecutive reliable-channel failures per peer, to accelerate
	/// the offline decision without waiting for heartbeat expiry
	unreachable_count: RwLock<HashMap<NodeLabel, u32>>,

	/// Labels of peers that just came back online, consumed by the
	/// pending-delete retry worker
	peer_return_tx: mpsc::UnboundedSender<NodeLabel>,

	tcp_port: u16,
	udp_port: u16,
	block_size: u64,
}

impl System {
	/// Create this node's membership manager. The receiving end of the
	/// returned channel is woken whenever an offline peer comes back.
	pub async fn new(
		config: &Config,
		registry: Arc<Registry>,
		pool: Arc<ConnectionPool>,
	) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NodeLabel>), Error> {
		let persist_node_state: Persister<NodeState> = Persister::new(&config.metadata_dir, "node_state");
		let persist_peer_list: Persister<PeerList> = Persister::new(&config.metadata_dir, "peer_list");

		let identity = match persist_node_state.load() {
			Ok(state) => {
				if let Some(label) = state.label {
					info!("This node was {} in its group", label);
				}
				state
			}
			Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => NodeState::default(),
			Err(e) => return Err(e),
		};

		let heartbeat = HeartbeatSocket::bind(config.udp_port).await?;

		let (peer_return_tx, peer_return_rx) = mpsc::unbounded_channel();

		let sys = Arc::new(System {
			registry,
			pool,
			heartbeat,
			persist_node_state,
			persist_peer_list,
			identity: RwLock::new(identity),
			in_group: AtomicBool::new(false),
			capacity_bytes: AtomicU64::new(config.capacity_bytes),
			used_bytes: AtomicU64::new(0),
			heartbeat_seq: AtomicU64::new(0),
			last_seen: RwLock::new(HashMap::new()),
			unreachable_count: RwLock::new(HashMap::new()),
			peer_return_tx,
			tcp_port: config.tcp_port,
			udp_port: config.udp_port,
			block_size: config.block_size,
		});
		Ok((sys, peer_return_rx))
	}

	/// Run the periodic membership tasks until shutdown
	pub async fn run(self: Arc<Self>, must_exit: watch::Receiver<bool>) {
		futures::join!(
			self.clone().heartbeat_emit_loop(must_exit.clone()),
			self.clone().heartbeat_recv_loop(must_exit.clone()),
			self.clone().sweep_loop(must_exit.clone()),
		);
	}

	// ---- Accessors ----

	pub fn local_label(&self) -> Option<NodeLabel> {
		self.identity.read().unwrap().label
	}

	pub fn group_fingerprint(&self) -> Option<Fingerprint> {
		self.identity.read().unwrap().group_fingerprint
	}

	/// Whether this node currently participates in a group
	pub fn is_in_group(&self) -> bool {
		self.in_group.load(Ordering::SeqCst)
	}

	pub fn capacity_bytes(&self) -> u64 {
		self.capacity_bytes.load(Ordering::SeqCst)
	}

	pub fn used_bytes(&self) -> u64 {
		self.used_bytes.load(Ordering::SeqCst)
	}

	/// Called by the block store whenever its used-bytes counter moved
	pub fn update_local_usage(&self, used_bytes: u64) {
		self.used_bytes.store(used_bytes, Ordering::SeqCst);
		if let Some(label) = self.local_label() {
			self.registry
				.update_node_usage(label, self.capacity_bytes(), used_bytes);
		}
	}

	/// Change the declared capacity. The caller enforces the guards
	/// (disconnected, range, not below used).
	pub fn set_capacity(&self, capacity_bytes: u64) {
		self.capacity_bytes.store(capacity_bytes, Ordering::SeqCst);
		if let Some(label) = self.local_label() {
			self.registry
				.update_node_usage(label, capacity_bytes, self.used_bytes());
		}
	}

	/// Node rows enriched with how long ago each peer was heard
	pub fn get_known_nodes(&self) -> Vec<KnownNodeInfo> {
		let last_seen = self.last_seen.read().unwrap();
		self.registry
			.list_nodes()
			.into_iter()
			.map(|entry| KnownNodeInfo {
				last_seen_secs_ago: last_seen
					.get(&entry.label)
					.map(|t| Instant::now().saturating_duration_since(*t).as_secs()),
				entry,
			})
			.collect()
	}

	// ---- Joining a group ----

	/// Connect to a group through one of its members and take (or take
	/// back) a label in it.
	pub async fn join(self: &Arc<Self>, peer: SocketAddr) -> Result<NodeLabel, Error> {
		let hello = self.local_hello(peer);
		let resp = self
			.pool
			.request(peer, OpCode::Hello, encode_payload(&hello)?, REQUEST_TIMEOUT)
			.await?;
		let welcome: Welcome = match resp.opcode {
			OpCode::Welcome => decode_payload(&resp.payload[..])?,
			OpCode::Error => {
				let msg: String = decode_payload(&resp.payload[..])?;
				return Err(Error::Message(msg));
			}
			other => return Err(Error::unexpected_message(other)),
		};

		if let Some(claimed) = hello.claimed_label {
			if claimed != welcome.assigned_label {
				info!(
					"Label {} could not be reclaimed, we are now {}",
					claimed, welcome.assigned_label
				);
			}
		}

		self.adopt_identity(welcome.assigned_label, welcome.fingerprint)?;
		self.registry.merge(&welcome.snapshot);
		self.registry
			.update_node_usage(welcome.assigned_label, self.capacity_bytes(), self.used_bytes());
		self.in_group.store(true, Ordering::SeqCst);

		// consider every advertised peer freshly seen, the sweeper
		// will take over from here
		{
			let mut last_seen = self.last_seen.write().unwrap();
			for peer in welcome.peers.iter() {
				if peer.is_online() && peer.label != welcome.assigned_label {
					last_seen.insert(peer.label, Instant::now());
				}
			}
		}

		// introduce ourselves to every other member
		for entry in welcome.peers.iter() {
			if entry.label == welcome.assigned_label || !entry.is_online() {
				continue;
			}
			if let Err(e) = self.hello_to(entry.addr).await {
				warn!("Could not greet {} at {}: {}", entry.label, entry.addr, e);
			}
		}

		self.save_peer_list().await;

		Ok(welcome.assigned_label)
	}

	/// Leave the group: close connections and stop heartbeating, but
	/// keep our identity and metadata so we can come back.
	pub async fn disconnect(&self) {
		self.in_group.store(false, Ordering::SeqCst);
		self.last_seen.write().unwrap().clear();
		self.unreachable_count.write().unwrap().clear();
		self.pool.clear().await;
		// a disconnected node observes nobody: everything is offline
		// from its point of view, itself included
		for node in self.registry.list_nodes() {
			self.registry.mark_node(node.label, Liveness::Offline);
		}
		info!("Left the group");
	}

	/// Try to re-enter the group whose peers we stored before a
	/// restart. Best effort: the first reachable peer wins.
	pub async fn reconnect_stored_peers(self: &Arc<Self>) {
		let peers = match self.persist_peer_list.load_async().await {
			Ok(PeerList(peers)) => peers,
			Err(_) => return,
		};
		let me = self.local_label();
		for (label, addr) in peers {
			if Some(label) == me {
				continue;
			}
			match self.join(addr).await {
				Ok(assigned) => {
					info!("Rejoined group via {} as {}", addr, assigned);
					return;
				}
				Err(e) => {
					debug!("Stored peer {} at {} not reachable: {}", label, addr, e);
				}
			}
		}
	}

	fn local_hello(&self, dialed_addr: SocketAddr) -> Hello {
		let identity = self.identity.read().unwrap();
		Hello {
			claimed_label: identity.label,
			fingerprint: identity.group_fingerprint,
			dialed_addr,
			tcp_port: self.tcp_port,
			udp_port: self.udp_port,
			block_size: self.block_size,
			capacity_bytes: self.capacity_bytes(),
			used_bytes: self.used_bytes(),
		}
	}

	async fn hello_to(self: &Arc<Self>, addr: SocketAddr) -> Result<(), Error> {
		let hello = self.local_hello(addr);
		let resp = self
			.pool
			.request(addr, OpCode::Hello, encode_payload(&hello)?, REQUEST_TIMEOUT)
			.await?;
		if let OpCode::Welcome = resp.opcode {
			let welcome: Welcome = decode_payload(&resp.payload[..])?;
			self.registry.merge(&welcome.snapshot);
		}
		Ok(())
	}

	fn adopt_identity(
		&self,
		label: NodeLabel,
		fingerprint: Option<Fingerprint>,
	) -> Result<(), Error> {
		let mut identity = self.identity.write().unwrap();
		identity.label = Some(label);
		if let Some(fp) = fingerprint {
			identity.group_fingerprint = Some(fp);
		}
		self.persist_node_state.save(&identity)?;
		Ok(())
	}

	async fn save_peer_list(&self) {
		let peers = PeerList(
			self.registry
				.list_nodes()
				.into_iter()
				.map(|n| (n.label, n.addr))
				.collect(),
		);
		if let Err(e) = self.persist_peer_list.save_async(&peers).await {
			warn!("Could not save peer list: {}", e);
		}
	}

	// ---- Frame handling ----

	/// Handle the membership subset of the reliable channel
	pub async fn handle_frame(
		self: &Arc<Self>,
		frame: Frame,
		from: SocketAddr,
	) -> Result<Frame, Error> {
		match frame.opcode {
			OpCode::Hello => {
				let hello: Hello = decode_payload(&frame.payload[..])?;
				let welcome = self.handle_hello(hello, from).await?;
				Ok(Frame::new(
					OpCode::Welcome,
					frame.correlation,
					encode_payload(&welcome)?,
				))
			}
			OpCode::PeerList => {
				let msg: PeerListMsg = decode_payload(&frame.payload[..])?;
				self.handle_peer_list(msg).await;
				Ok(Frame::ack(&frame))
			}
			OpCode::MetaSync => {
				// an empty payload asks for our snapshot; a non-empty
				// one is a snapshot being pushed at us
				if frame.payload.is_empty() {
					let snapshot = self.registry.snapshot();
					Ok(Frame::new(
						OpCode::MetaSync,
						frame.correlation,
						encode_payload(&snapshot)?,
					))
				} else {
					let snapshot: Snapshot = decode_payload(&frame.payload[..])?;
					self.registry.merge(&snapshot);
					Ok(Frame::ack(&frame))
				}
			}
			OpCode::CapacityUpdate => {
				let msg: CapacityUpdateMsg = decode_payload(&frame.payload[..])?;
				self.note_seen(msg.label);
				self.registry
					.update_node_usage(msg.label, msg.capacity_bytes, msg.used_bytes);
				Ok(Frame::ack(&frame))
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	/// Answer a `HELLO`: assign or confirm a label and hand out the
	/// peer list and metadata snapshot.
	pub async fn handle_hello(
		self: &Arc<Self>,
		hello: Hello,
		from: SocketAddr,
	) -> Result<Welcome, Error> {
		let joiner_addr = SocketAddr::new(from.ip(), hello.tcp_port);

		// a group cuts every file with one block size; refuse members
		// that would disagree
		if hello.block_size != self.block_size {
			return Err(Error::Message(format!(
				"your block size is {} but this group uses {}",
				hello.block_size, self.block_size
			)));
		}

		// if nobody ever joined us and we have no identity, this HELLO
		// founds the group: we take the first free label ourselves
		if self.local_label().is_none() {
			let label = self.registry.allocate_label(None, false);
			self.adopt_identity(label, None)?;
			self.registry.upsert_node(NodeEntry {
				label,
				addr: SocketAddr::new(hello.dialed_addr.ip(), self.tcp_port),
				udp_port: self.udp_port,
				capacity_bytes: self.capacity_bytes(),
				used_bytes: self.used_bytes(),
				liveness: Liveness::Online,
				updated_msec: now_msec(),
			});
			info!("Founding a group as {}", label);
		}

		let fingerprint_ok = match (hello.fingerprint, self.group_fingerprint()) {
			(Some(theirs), Some(ours)) => theirs == ours,
			_ => false,
		};

		let assigned = match hello.claimed_label {
			Some(claimed) if fingerprint_ok => match self.registry.node(claimed) {
				// reclaiming an offline slot, or re-identifying on a
				// second connection from the same address
				Some(n) if n.liveness == Liveness::Offline => claimed,
				Some(n) if n.addr == joiner_addr => claimed,
				// the slot is actively held by somebody else
				Some(_) => self.registry.allocate_label(None, false),
				// an authenticated member holding a label we have not
				// heard of yet: the gossip is still on its way, take
				// its word for it
				None => claimed,
			},
			_ => self.registry.allocate_label(None, false),
		};

		let first_sighting = match self.registry.node(assigned) {
			Some(n) => !n.is_online() || n.addr != joiner_addr,
			None => true,
		};

		self.registry.upsert_node(NodeEntry {
			label: assigned,
			addr: joiner_addr,
			udp_port: hello.udp_port,
			capacity_bytes: hello.capacity_bytes,
			used_bytes: hello.used_bytes,
			liveness: Liveness::Online,
			updated_msec: now_msec(),
		});
		self.note_seen(assigned);
		self.in_group.store(true, Ordering::SeqCst);

		// the group exists as soon as two labels do: fingerprint it
		if self.group_fingerprint().is_none() {
			let nodes = self.registry.list_nodes();
			if nodes.len() >= 2 {
				let fp = group_fingerprint_of(nodes[0].label, nodes[1].label);
				let label = self.local_label();
				let mut identity = self.identity.write().unwrap();
				identity.label = label;
				identity.group_fingerprint = Some(fp);
				self.persist_node_state.save(&identity)?;
				info!("Group fingerprint is {:?}", fp);
			}
		}

		if first_sighting {
			info!("{} joined from {}", assigned, joiner_addr);
			let this = self.clone();
			tokio::spawn(async move {
				this.broadcast_peer_list(assigned).await;
				this.save_peer_list().await;
			});
		}

		Ok(Welcome {
			assigned_label: assigned,
			fingerprint: self.group_fingerprint(),
			peers: self.registry.list_nodes(),
			snapshot: self.registry.snapshot(),
		})
	}

	async fn handle_peer_list(self: &Arc<Self>, msg: PeerListMsg) {
		let me = self.local_label();
		let mut newly_known = vec![];
		for entry in msg.peers {
			if Some(entry.label) == me {
				continue;
			}
			if self.registry.node(entry.label).is_none() {
				newly_known.push(entry.label);
				self.registry.upsert_node(entry);
			}
		}
		if !newly_known.is_empty() {
			// first time we hear about these nodes: pass it on so the
			// whole mesh learns them within another round-trip
			for label in newly_known.iter() {
				info!("Learned about {} by gossip", label);
				self.broadcast_peer_list(*label).await;
			}
			self.save_peer_list().await;
		}
	}

	/// Tell every other member about the full peer list, typically
	/// because `about` was just first heard of
	async fn broadcast_peer_list(self: &Arc<Self>, about: NodeLabel) {
		let me = self.local_label();
		let msg = PeerListMsg {
			peers: self.registry.list_nodes(),
		};
		let payload = match encode_payload(&msg) {
			Ok(p) => p,
			Err(e) => {
				error!("Could not encode peer list: {}", e);
				return;
			}
		};
		for peer in self.registry.online_nodes() {
			if Some(peer.label) == me || peer.label == about {
				continue;
			}
			if let Err(e) = self
				.pool
				.request_ack(peer.addr, OpCode::PeerList, payload.clone(), REQUEST_TIMEOUT)
				.await
			{
				debug!("Could not gossip peer list to {}: {}", peer.label, e);
			}
		}
	}

	/// Push our capacity and used bytes to every peer ahead of the
	/// next heartbeat
	pub async fn broadcast_usage(self: &Arc<Self>) {
		let label = match self.local_label() {
			Some(l) => l,
			None => return,
		};
		let msg = CapacityUpdateMsg {
			label,
			capacity_bytes: self.capacity_bytes(),
			used_bytes: self.used_bytes(),
		};
		let payload = match encode_payload(&msg) {
			Ok(p) => p,
			Err(e) => {
				error!("Could not encode capacity update: {}", e);
				return;
			}
		};
		for peer in self.registry.online_nodes() {
			if peer.label == label {
				continue;
			}
			if let Err(e) = self
				.pool
				.request_ack(
					peer.addr,
					OpCode::CapacityUpdate,
					payload.clone(),
					REQUEST_TIMEOUT,
				)
				.await
			{
				debug!("Could not push usage to {}: {}", peer.label, e);
			}
		}
	}

	// ---- Failure detection ----

	/// Note that a peer was heard from over any channel. Brings an
	/// offline peer back online and triggers reconciliation with it.
	pub fn note_seen(self: &Arc<Self>, label: NodeLabel) {
		if Some(label) == self.local_label() {
			return;
		}
		self.last_seen.write().unwrap().insert(label, Instant::now());
		self.unreachable_count.write().unwrap().remove(&label);

		let was_offline = self
			.registry
			.node(label)
			.map(|n| n.liveness == Liveness::Offline)
			.unwrap_or(false);
		if was_offline {
			self.registry.mark_node(label, Liveness::Online);
			info!("{} is back online", label);
			let _ = self.peer_return_tx.send(label);
			let this = self.clone();
			tokio::spawn(async move {
				if let Err(e) = this.meta_sync_with(label).await {
					warn!("Reconciliation with returning {} failed: {}", label, e);
				}
			});
		}
	}

	/// Note that a reliable-channel exchange with a peer failed.
	/// Repeat failures flip the peer to offline without waiting for
	/// the heartbeat expiry.
	pub fn note_unreachable(&self, label: NodeLabel) {
		let failures = {
			let mut counts = self.unreachable_count.write().unwrap();
			let count = counts.entry(label).or_insert(0);
			*count += 1;
			*count
		};
		if failures >= UNREACHABLE_FAILURES_LIMIT {
			if self.registry.mark_node(label, Liveness::Offline) {
				warn!(
					"{} failed {} consecutive exchanges, marking it offline",
					label, failures
				);
			}
		}
	}

	/// Ask one peer for its snapshot and merge it into ours
	pub async fn meta_sync_with(self: &Arc<Self>, label: NodeLabel) -> Result<(), Error> {
		let peer = self
			.registry
			.node(label)
			.ok_or_message(format!("no such node: {}", label))?;
		let resp = self
			.pool
			.request(peer.addr, OpCode::MetaSync, bytes::Bytes::new(), REQUEST_TIMEOUT)
			.await?;
		match resp.opcode {
			OpCode::MetaSync => {
				let snapshot: Snapshot = decode_payload(&resp.payload[..])?;
				if self.registry.merge(&snapshot) {
					debug!("Reconciliation with {} brought changes", label);
				}
				Ok(())
			}
			other => Err(Error::unexpected_message(other)),
		}
	}

	async fn heartbeat_emit_loop(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			let restart_at = Instant::now() + HEARTBEAT_INTERVAL;

			if self.is_in_group() {
				if let Some(label) = self.local_label() {
					// keep our own row fresh too
					self.registry
						.update_node_usage(label, self.capacity_bytes(), self.used_bytes());

					let hb = Heartbeat {
						label: label.0,
						seq: self.heartbeat_seq.fetch_add(1, Ordering::SeqCst),
						capacity_bytes: self.capacity_bytes(),
						used_bytes: self.used_bytes(),
					};
					for peer in self.registry.list_nodes() {
						if peer.label == label || peer.liveness == Liveness::Gone {
							continue;
						}
						if let Err(e) = self.heartbeat.send_to(&hb, peer.heartbeat_addr()).await {
							debug!("Could not send heartbeat to {}: {}", peer.label, e);
						}
					}
				}
			}

			select! {
				_ = tokio::time::sleep_until(restart_at.into()) => {},
				_ = must_exit.changed() => {},
			}
		}
	}

	async fn heartbeat_recv_loop(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			select! {
				received = self.heartbeat.recv_from() => match received {
					Ok((hb, _from)) => {
						let label = NodeLabel(hb.label);
						if self.registry.node(label).is_some() {
							self.note_seen(label);
							self.registry.update_node_usage(
								label,
								hb.capacity_bytes,
								hb.used_bytes,
							);
						}
					}
					Err(e) => {
						warn!("Heartbeat channel error: {}", e);
						tokio::time::sleep(std::time::Duration::from_secs(1)).await;
					}
				},
				_ = must_exit.changed() => {},
			}
		}
	}

	async fn sweep_loop(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow() {
			let restart_at = Instant::now() + SWEEP_INTERVAL;

			if self.is_in_group() {
				let expired = {
					let last_seen = self.last_seen.read().unwrap();
					last_seen
						.iter()
						.filter(|(_, seen)| seen.elapsed() > HEARTBEAT_EXPIRY)
						.map(|(label, _)| *label)
						.collect::<Vec<_>>()
				};
				for label in expired {
					if self.registry.mark_node(label, Liveness::Offline) {
						warn!(
							"{} has not been heard from for {}s, marking it offline",
							label,
							HEARTBEAT_EXPIRY.as_secs()
						);
					}
				}
			}

			select! {
				_ = tokio::time::sleep_until(restart_at.into()) => {},
				_ = must_exit.changed() => {},
			}
		}
	}
}

/// The stable fingerprint of a group: a hash over its first two labels
pub fn group_fingerprint_of(a: NodeLabel, b: NodeLabel) -> Fingerprint {
	let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
	blake2sum(format!("{}|{}", lo, hi).as_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config(dir: &std::path::Path) -> Config {
		Config {
			capacity_bytes: 100 * 1024 * 1024,
			tcp_port: 8888,
			udp_port: 0,
			storage_dir: dir.join("blocks"),
			metadata_dir: dir.to_path_buf(),
			block_size: 1024 * 1024,
		}
	}

	async fn test_system(dir: &std::path::Path) -> Arc<System> {
		let registry = Registry::load(dir).unwrap();
		let pool = ConnectionPool::new(2 * 1024 * 1024);
		let (sys, _rx) = System::new(&test_config(dir), registry, pool)
			.await
			.unwrap();
		sys
	}

	fn hello_from(k: Option<u32>, fp: Option<Fingerprint>, ip: &str) -> (Hello, SocketAddr) {
		let hello = Hello {
			claimed_label: k.map(NodeLabel),
			fingerprint: fp,
			dialed_addr: "10.0.0.1:8888".parse().unwrap(),
			tcp_port: 8888,
			udp_port: 8889,
			block_size: 1024 * 1024,
			capacity_bytes: 100 * 1024 * 1024,
			used_bytes: 0,
		};
		let from = format!("{}:54321", ip).parse().unwrap();
		(hello, from)
	}

	#[test]
	fn test_group_fingerprint_is_stable_and_symmetric() {
		let a = group_fingerprint_of(NodeLabel(1), NodeLabel(2));
		let b = group_fingerprint_of(NodeLabel(2), NodeLabel(1));
		assert_eq!(a, b);
		assert_ne!(a, group_fingerprint_of(NodeLabel(1), NodeLabel(3)));
	}

	#[tokio::test]
	async fn test_founding_and_label_assignment() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sys = test_system(&dir.to_path_buf()).await;

		// first HELLO founds the group: we become nodo1, they nodo2
		let (hello, from) = hello_from(None, None, "10.0.0.2");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(sys.local_label(), Some(NodeLabel(1)));
		assert_eq!(welcome.assigned_label, NodeLabel(2));
		// the fingerprint is minted as soon as two labels exist
		let fp = welcome.fingerprint.unwrap();
		assert_eq!(fp, group_fingerprint_of(NodeLabel(1), NodeLabel(2)));

		// a third joiner with no claim gets nodo3
		let (hello, from) = hello_from(None, None, "10.0.0.3");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(welcome.assigned_label, NodeLabel(3));
	}

	#[tokio::test]
	async fn test_label_recovery_needs_offline_slot_and_fingerprint() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sys = test_system(&dir.to_path_buf()).await;

		let (hello, from) = hello_from(None, None, "10.0.0.2");
		sys.handle_hello(hello, from).await.unwrap();
		let (hello, from) = hello_from(None, None, "10.0.0.3");
		sys.handle_hello(hello, from).await.unwrap();
		let fp = sys.group_fingerprint().unwrap();

		// nodo3 goes silent
		sys.registry.mark_node(NodeLabel(3), Liveness::Offline);

		// a fresh node joining now must not be handed the offline slot
		let (hello, from) = hello_from(None, None, "10.0.0.4");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(welcome.assigned_label, NodeLabel(4));

		// nodo3 coming back with the right fingerprint reclaims it
		let (hello, from) = hello_from(Some(3), Some(fp), "10.0.0.3");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(welcome.assigned_label, NodeLabel(3));
		assert_eq!(
			sys.registry.node(NodeLabel(3)).unwrap().liveness,
			Liveness::Online
		);

		// a forged claim without the fingerprint gets a fresh label
		sys.registry.mark_node(NodeLabel(3), Liveness::Offline);
		let (hello, from) = hello_from(Some(3), None, "10.0.0.9");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(welcome.assigned_label, NodeLabel(5));

		// an authenticated claim of a label we never heard of is
		// accepted: the claimant is ahead of our gossip
		let (hello, from) = hello_from(Some(9), Some(fp), "10.0.0.11");
		let welcome = sys.handle_hello(hello, from).await.unwrap();
		assert_eq!(welcome.assigned_label, NodeLabel(9));
	}

	#[tokio::test]
	async fn test_identity_survives_restart() {
		let dir = mktemp::Temp::new_dir().unwrap();
		{
			let sys = test_system(&dir.to_path_buf()).await;
			let (hello, from) = hello_from(None, None, "10.0.0.2");
			sys.handle_hello(hello, from).await.unwrap();
			assert_eq!(sys.local_label(), Some(NodeLabel(1)));
		}
		// a new System over the same metadata dir remembers who it was
		let sys = test_system(&dir.to_path_buf()).await;
		assert_eq!(sys.local_label(), Some(NodeLabel(1)));
		assert!(sys.group_fingerprint().is_some());
	}
}

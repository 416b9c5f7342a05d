use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use structopt::StructOpt;

use format_table::format_table;

use trastero_model::control::*;
use trastero_model::engine::{DeleteOutcome, DownloadOutcome, UploadOutcome};
use trastero_net::message::*;
use trastero_net::pool::Connection;
use trastero_net::REQUEST_TIMEOUT;
use trastero_util::error::*;
use trastero_util::time::msec_to_rfc3339;

/// List replies can outgrow the block-sized frame limit of the peer
/// channel, be generous on the control client side
const CONTROL_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;
/// Upload and download commands wait for whole files to move
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Run the Trastero node
	#[structopt(name = "server")]
	Server,

	/// Show this node and its group
	#[structopt(name = "status")]
	Status,

	/// Join a group through the given member address
	#[structopt(name = "connect")]
	Connect {
		/// <ip>:<port> of any member's reliable channel
		peer: SocketAddr,
	},

	/// Leave the current group (identity and metadata are kept)
	#[structopt(name = "disconnect")]
	Disconnect,

	/// List the nodes of the group
	#[structopt(name = "nodes")]
	Nodes,

	/// Upload a local file into the group
	#[structopt(name = "upload")]
	Upload {
		/// Path of the file to upload
		local_path: PathBuf,
	},

	/// List the files stored in the group
	#[structopt(name = "files")]
	Files,

	/// Download a file from the group
	#[structopt(name = "download")]
	Download {
		/// Name the file was uploaded under
		name: String,
		/// Where to write it
		local_path: PathBuf,
	},

	/// Delete a file from the group
	#[structopt(name = "delete")]
	Delete {
		/// Name the file was uploaded under
		name: String,
	},

	/// List every block and where its copies live
	#[structopt(name = "blocks")]
	Blocks,

	/// Change this node's declared capacity (only while disconnected)
	#[structopt(name = "set-capacity")]
	SetCapacity {
		/// New capacity, e.g. "60MiB"
		capacity: ByteSize,
	},
}

pub async fn cli_command_dispatch(cmd: Command, node_addr: SocketAddr) -> Result<(), Error> {
	let (req, timeout) = match cmd {
		Command::Server => unreachable!(),
		Command::Status => (ControlRequest::Status, REQUEST_TIMEOUT),
		Command::Connect { peer } => (ControlRequest::Connect { peer }, REQUEST_TIMEOUT),
		Command::Disconnect => (ControlRequest::Disconnect, REQUEST_TIMEOUT),
		Command::Nodes => (ControlRequest::ListNodes, REQUEST_TIMEOUT),
		Command::Upload { local_path } => (
			ControlRequest::Upload {
				local_path: absolute(local_path)?,
			},
			TRANSFER_TIMEOUT,
		),
		Command::Files => (ControlRequest::ListFiles, REQUEST_TIMEOUT),
		Command::Download { name, local_path } => (
			ControlRequest::Download {
				name,
				local_path: absolute(local_path)?,
			},
			TRANSFER_TIMEOUT,
		),
		Command::Delete { name } => (ControlRequest::Delete { name }, REQUEST_TIMEOUT),
		Command::Blocks => (ControlRequest::ListBlocks, REQUEST_TIMEOUT),
		Command::SetCapacity { capacity } => (
			ControlRequest::SetCapacity {
				bytes: capacity.as_u64(),
			},
			REQUEST_TIMEOUT,
		),
	};

	let reply = control_request(node_addr, req, timeout).await?;
	render_reply(reply)
}

/// The node resolves paths in its own working directory: make them
/// absolute before they leave this process
fn absolute(path: PathBuf) -> Result<PathBuf, Error> {
	if path.is_absolute() {
		Ok(path)
	} else {
		Ok(std::env::current_dir()?.join(path))
	}
}

async fn control_request(
	node_addr: SocketAddr,
	req: ControlRequest,
	timeout: Duration,
) -> Result<ControlReply, Error> {
	let mut conn = Connection::connect(node_addr, CONTROL_MAX_PAYLOAD)
		.await
		.err_context(format!(
			"Could not reach the Trastero node at {}. Is it running?",
			node_addr
		))?;
	let resp = conn
		.request(OpCode::Control, encode_payload(&req)?, timeout)
		.await?;
	match resp.opcode {
		OpCode::ControlReply => decode_payload(&resp.payload[..]),
		OpCode::Error => {
			let msg: String = decode_payload(&resp.payload[..])?;
			Err(Error::Message(msg))
		}
		other => Err(Error::unexpected_message(other)),
	}
}

fn render_reply(reply: ControlReply) -> Result<(), Error> {
	match reply {
		ControlReply::Connected { label } => {
			println!("Connected. This node is {}.", label);
			Ok(())
		}
		ControlReply::Disconnected => {
			println!("Left the group.");
			Ok(())
		}
		ControlReply::NodeList(nodes) => {
			let mut table = vec!["Label\tStatus\tCapacity\tUsed\tLast seen".to_string()];
			let tf = timeago::Formatter::new();
			for n in nodes {
				table.push(format!(
					"{}\t{}\t{}\t{}\t{}",
					n.label,
					if n.online { "online" } else { "offline" },
					ByteSize::b(n.capacity_bytes),
					ByteSize::b(n.used_bytes),
					n.last_seen_secs_ago
						.map(|s| tf.convert(Duration::from_secs(s)))
						.unwrap_or_else(|| "never".into()),
				));
			}
			format_table(table);
			Ok(())
		}
		ControlReply::FileList(files) => {
			let mut table = vec!["Name\tSize\tOwner\tCreated\tState".to_string()];
			for f in files {
				table.push(format!(
					"{}\t{}\t{}\t{}\t{}",
					f.name,
					ByteSize::b(f.size),
					f.owner,
					msec_to_rfc3339(f.created_msec),
					if f.retrievable {
						"retrievable"
					} else {
						"not retrievable"
					},
				));
			}
			format_table(table);
			Ok(())
		}
		ControlReply::BlockList(blocks) => {
			let mut table = vec!["File\tIndex\tSize\tOriginal\tReplica\tStatus".to_string()];
			for b in blocks {
				table.push(format!(
					"{}\t{}\t{}\t{}\t{}\t{}",
					b.file,
					b.index,
					ByteSize::b(b.size),
					b.original,
					b.replica,
					b.status,
				));
			}
			format_table(table);
			Ok(())
		}
		ControlReply::Status(s) => {
			match s.label {
				Some(label) => println!("This node is {}.", label),
				None => println!("This node has not joined a group."),
			}
			println!("Online peers:  {}", s.peer_count);
			println!(
				"Local space:   {} used of {}",
				ByteSize::b(s.used_bytes),
				ByteSize::b(s.capacity_bytes)
			);
			println!(
				"Group space:   {} used, {} free",
				ByteSize::b(s.total_used),
				ByteSize::b(s.total_free)
			);
			Ok(())
		}
		ControlReply::Upload(outcome) => match outcome {
			UploadOutcome::Ok => {
				println!("File uploaded.");
				Ok(())
			}
			UploadOutcome::InsufficientCapacity => Err(Error::Message(
				"the group cannot hold two copies of this file (not enough free space or fewer than two nodes online)"
					.into(),
			)),
			UploadOutcome::DuplicateName => Err(Error::Message(
				"a file with this name already exists in the group".into(),
			)),
		},
		ControlReply::Download(outcome) => match outcome {
			DownloadOutcome::Ok => {
				println!("File downloaded.");
				Ok(())
			}
			DownloadOutcome::Unavailable(index) => Err(Error::Message(format!(
				"block {} is unavailable: both of its hosts are offline",
				index
			))),
			DownloadOutcome::Missing => Err(Error::Message("no such file".into())),
		},
		ControlReply::Delete(outcome) => match outcome {
			DeleteOutcome::Ok => {
				println!("File deleted.");
				Ok(())
			}
			DeleteOutcome::Missing => Err(Error::Message("no such file".into())),
		},
		ControlReply::Capacity(outcome) => match outcome {
			CapacityOutcome::Ok => {
				println!("Capacity updated.");
				Ok(())
			}
			CapacityOutcome::InGroup => Err(Error::Message(
				"capacity can only be changed while disconnected from the group".into(),
			)),
			CapacityOutcome::BelowUsed => Err(Error::Message(
				"the requested capacity is below the bytes already stored on this node".into(),
			)),
			CapacityOutcome::OutOfRange => Err(Error::Message(
				"capacity must be between 50 MiB and 100 MiB".into(),
			)),
		},
		ControlReply::Failed(msg) => Err(Error::Message(msg)),
	}
}

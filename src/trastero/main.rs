//! Trastero CLI, used to interact with a running Trastero node, and to
//! launch a Trastero node
#[macro_use]
extern crate tracing;

mod cli;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use structopt::StructOpt;

use cli::*;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "trastero",
	about = "Peer-to-peer distributed block store for small self-hosted groups"
)]
struct Opt {
	/// Path to configuration file
	#[structopt(
		short = "c",
		long = "config",
		env = "TRASTERO_CONFIG_FILE",
		default_value = "/etc/trastero.toml"
	)]
	pub config_file: PathBuf,

	/// Reliable-channel address of the node to send control commands
	/// to
	#[structopt(
		short = "h",
		long = "node",
		env = "TRASTERO_NODE",
		default_value = "127.0.0.1:8888"
	)]
	pub node_addr: SocketAddr,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	// Tokio would keep running when a task panics; we prefer to exit
	// the whole process and come back up in a known state.
	std::panic::set_hook(Box::new(move |panic_info| {
		eprintln!("======== PANIC (internal Trastero error) ========");
		eprintln!("{}", panic_info);
		eprintln!();
		eprintln!("TRASTERO VERSION: {}", env!("CARGO_PKG_VERSION"));
		eprintln!();
		eprintln!("BACKTRACE:");
		eprintln!("{:?}", backtrace::Backtrace::new());
		std::process::abort();
	}));

	let opt = Opt::from_args();

	if std::env::var("RUST_LOG").is_err() {
		let default_log = match &opt.cmd {
			Command::Server => "trastero=info",
			_ => "trastero=warn",
		};
		std::env::set_var("RUST_LOG", default_log)
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let res = match opt.cmd {
		Command::Server => server::run_server(opt.config_file).await,
		cmd => cli_command_dispatch(cmd, opt.node_addr).await,
	};

	if let Err(e) = res {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

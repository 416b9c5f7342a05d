//! Contains type and functions related to Trastero configuration file
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Smallest declarable capacity for a node
pub const CAPACITY_MIN: u64 = 50 * 1024 * 1024;
/// Largest declarable capacity for a node
pub const CAPACITY_MAX: u64 = 100 * 1024 * 1024;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Disk capacity this node contributes to the group, in bytes.
	/// Must lie in [CAPACITY_MIN, CAPACITY_MAX].
	pub capacity_bytes: u64,

	/// TCP port for the reliable peer channel
	#[serde(default = "default_tcp_port")]
	pub tcp_port: u16,
	/// UDP port for heartbeat datagrams
	#[serde(default = "default_udp_port")]
	pub udp_port: u16,

	/// Directory where block files are stored
	#[serde(default = "default_storage_dir")]
	pub storage_dir: PathBuf,
	/// Directory where node identity and the metadata snapshot live
	#[serde(default = "default_metadata_dir")]
	pub metadata_dir: PathBuf,

	/// Size of data blocks. Must be identical on every node of a group.
	#[serde(default = "default_block_size")]
	pub block_size: u64,
}

fn default_tcp_port() -> u16 {
	8888
}
fn default_udp_port() -> u16 {
	8889
}
fn default_block_size() -> u64 {
	1048576
}

fn default_storage_dir() -> PathBuf {
	match dirs::data_local_dir() {
		Some(mut dir) => {
			dir.push("espacioCompartido");
			dir
		}
		None => {
			warn!("Could not determine the platform data directory, storing blocks in ./espacioCompartido");
			PathBuf::from("espacioCompartido")
		}
	}
}

fn default_metadata_dir() -> PathBuf {
	match dirs::data_local_dir() {
		Some(mut dir) => {
			dir.push("trastero-meta");
			dir
		}
		None => PathBuf::from("trastero-meta"),
	}
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	let config: Config = toml::from_str(&config)?;

	if !(CAPACITY_MIN..=CAPACITY_MAX).contains(&config.capacity_bytes) {
		return Err(Error::Message(format!(
			"capacity_bytes = {} is outside the permitted range [{}, {}]",
			config.capacity_bytes, CAPACITY_MIN, CAPACITY_MAX
		)));
	}
	if config.block_size == 0 || config.block_size > CAPACITY_MIN {
		return Err(Error::Message(format!(
			"block_size = {} is not usable (must be nonzero and at most {})",
			config.block_size, CAPACITY_MIN
		)));
	}

	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_config_defaults() {
		let path = mktemp::Temp::new_file().unwrap();
		let mut file = std::fs::File::create(path.to_path_buf()).unwrap();
		writeln!(file, "capacity_bytes = 52428800").unwrap();
		drop(file);

		let config = read_config(path.to_path_buf()).unwrap();
		assert_eq!(config.tcp_port, 8888);
		assert_eq!(config.udp_port, 8889);
		assert_eq!(config.block_size, 1048576);
		assert_eq!(config.capacity_bytes, 52428800);
	}

	#[test]
	fn test_config_rejects_bad_capacity() {
		let path = mktemp::Temp::new_file().unwrap();
		let mut file = std::fs::File::create(path.to_path_buf()).unwrap();
		writeln!(file, "capacity_bytes = 1024").unwrap();
		drop(file);

		assert!(read_config(path.to_path_buf()).is_err());
	}
}

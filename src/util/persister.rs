//! Atomically-replaced files holding one rmp-encoded value
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// A single value persisted to disk, replaced atomically on save.
/// Saves go to a `.tmp` sibling which is fsynced and then renamed over
/// the destination, so a crash leaves either the old or the new value.
pub struct Persister<T: Serialize + DeserializeOwned + Send + 'static> {
	path: PathBuf,
	tmp_path: PathBuf,

	_marker: std::marker::PhantomData<T>,
}

impl<T> Persister<T>
where
	T: Serialize + DeserializeOwned + Send + 'static,
{
	/// Create a persister for a file in the given directory
	pub fn new(base_dir: &Path, file_name: &str) -> Self {
		let mut path = base_dir.to_path_buf();
		path.push(file_name);
		let mut tmp_path = base_dir.to_path_buf();
		tmp_path.push(format!("{}.tmp", file_name));
		Self {
			path,
			tmp_path,
			_marker: Default::default(),
		}
	}

	/// The path of the persisted file
	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn load(&self) -> Result<T, Error> {
		let mut file = std::fs::File::open(&self.path)?;

		let mut bytes = vec![];
		file.read_to_end(&mut bytes)?;

		let value = rmp_serde::from_slice(&bytes[..]).map_err(|e| {
			Error::CorruptSnapshot(self.path.to_string_lossy().to_string(), e.to_string())
		})?;
		Ok(value)
	}

	pub fn save(&self, t: &T) -> Result<(), Error> {
		let bytes = rmp_serde::to_vec_named(t)?;

		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&self.tmp_path)?;
		file.write_all(&bytes[..])?;
		file.sync_all()?;
		drop(file);

		std::fs::rename(&self.tmp_path, &self.path)?;

		Ok(())
	}

	pub async fn load_async(&self) -> Result<T, Error> {
		let this = self.clone_paths();
		tokio::task::spawn_blocking(move || this.load()).await?
	}

	pub async fn save_async(&self, t: &T) -> Result<(), Error> {
		let this = self.clone_paths();
		let bytes = rmp_serde::to_vec_named(t)?;
		tokio::task::spawn_blocking(move || this.save_bytes(&bytes)).await?
	}

	fn clone_paths(&self) -> Persister<T> {
		Persister {
			path: self.path.clone(),
			tmp_path: self.tmp_path.clone(),
			_marker: Default::default(),
		}
	}

	fn save_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&self.tmp_path)?;
		file.write_all(bytes)?;
		file.sync_all()?;
		drop(file);

		std::fs::rename(&self.tmp_path, &self.path)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::Deserialize;

	#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
	struct Sample {
		label: u32,
		name: String,
	}

	#[test]
	fn test_save_load_roundtrip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<Sample> = Persister::new(&dir.to_path_buf(), "sample");

		assert!(persister.load().is_err());

		let v = Sample {
			label: 3,
			name: "nodo3".into(),
		};
		persister.save(&v).unwrap();
		assert_eq!(persister.load().unwrap(), v);
	}

	#[test]
	fn test_corrupt_file_is_reported_and_kept() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<Sample> = Persister::new(&dir.to_path_buf(), "sample");

		std::fs::write(persister.path(), b"not msgpack at all").unwrap();
		match persister.load() {
			Err(Error::CorruptSnapshot(_, _)) => (),
			other => panic!("unexpected result: {:?}", other),
		}
		// the corrupt file must still be there for inspection
		assert!(persister.path().exists());
	}
}

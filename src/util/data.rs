//! Fixed-size binary values and hashing helpers
use serde::{Deserialize, Serialize};

/// An array of 32 bytes
#[derive(Default, PartialOrd, Ord, Clone, Hash, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub struct FixedBytes32([u8; 32]);

impl From<[u8; 32]> for FixedBytes32 {
	fn from(x: [u8; 32]) -> FixedBytes32 {
		FixedBytes32(x)
	}
}

impl std::convert::TryFrom<&[u8]> for FixedBytes32 {
	type Error = std::array::TryFromSliceError;
	fn try_from(by: &[u8]) -> Result<Self, Self::Error> {
		Ok(Self(*<&[u8; 32]>::try_from(by)?))
	}
}

impl std::fmt::Debug for FixedBytes32 {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}…", hex::encode(&self.0[..8]))
	}
}

impl FixedBytes32 {
	/// Access the content as a slice
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
	/// Access the content as a mutable slice
	pub fn as_slice_mut(&mut self) -> &mut [u8] {
		&mut self.0
	}
	/// Copy to a slice
	pub fn to_vec(self) -> Vec<u8> {
		self.0.to_vec()
	}
	/// Try building a FixedBytes32 from a slice, None if the size is wrong
	pub fn try_from(by: &[u8]) -> Option<Self> {
		if by.len() != 32 {
			return None;
		}
		let mut ret = [0u8; 32];
		ret.copy_from_slice(by);
		Some(Self(ret))
	}
}

/// A stable identity fingerprint, e.g. of the founding members of a group
pub type Fingerprint = FixedBytes32;

/// Compute the Blake2 of some data, truncated to 32 bytes
pub fn blake2sum(data: &[u8]) -> FixedBytes32 {
	use blake2::{Blake2b512, Digest};

	let mut hasher = Blake2b512::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..32]);
	hash.into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_blake2sum_is_stable() {
		let a = blake2sum(b"nodo1|nodo2");
		let b = blake2sum(b"nodo1|nodo2");
		assert_eq!(a, b);
		assert_ne!(a, blake2sum(b"nodo1|nodo3"));
	}

	#[test]
	fn test_fixed_bytes_roundtrip() {
		let h = blake2sum(b"x");
		let v = h.to_vec();
		assert_eq!(FixedBytes32::try_from(&v[..]), Some(h));
		assert_eq!(FixedBytes32::try_from(&v[1..]), None);
	}
}

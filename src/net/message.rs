//! Frame layout of the reliable peer channel
//!
//! Every message starts with a 16-byte header: a 4-byte operation
//! code, a 4-byte correlation id and an 8-byte payload length, all
//! big-endian, followed by the payload itself. Responses echo the
//! correlation id of the request they answer.
use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use trastero_util::error::Error;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 16;

/// Slack allowed on top of one block for the largest frame payload
/// (block metadata inside `BLOCK_PUT`, rmp envelopes, etc.)
pub const PAYLOAD_SLACK: u64 = 64 * 1024;

/// Operations of the reliable channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
	/// Join or identify on a fresh connection
	Hello = 1,
	/// Reply to a joining HELLO: assigned label, peer list, snapshot
	Welcome = 2,
	/// Gossip of the full peer list
	PeerList = 3,
	/// Metadata reconciliation: empty payload asks, snapshot payload answers
	MetaSync = 4,
	/// Store one block on the receiving node
	BlockPut = 5,
	/// Fetch one block from the receiving node
	BlockGet = 6,
	/// Reply to BLOCK_GET
	BlockGetReply = 7,
	/// Drop one block from the receiving node
	BlockDelete = 8,
	/// A file upload completed, here are its blocks
	FileAnnounce = 9,
	/// A file was deleted
	FileDelete = 10,
	/// A node changed its declared capacity
	CapacityUpdate = 11,
	/// Control-surface request from a local UI process
	Control = 12,
	/// Reply to a control-surface request
	ControlReply = 13,
	/// Positive reply carrying no data
	Ack = 14,
	/// Negative reply carrying an error message
	Error = 15,
}

impl TryFrom<u32> for OpCode {
	type Error = trastero_util::error::Error;
	fn try_from(v: u32) -> Result<Self, Error> {
		use OpCode::*;
		Ok(match v {
			1 => Hello,
			2 => Welcome,
			3 => PeerList,
			4 => MetaSync,
			5 => BlockPut,
			6 => BlockGet,
			7 => BlockGetReply,
			8 => BlockDelete,
			9 => FileAnnounce,
			10 => FileDelete,
			11 => CapacityUpdate,
			12 => Control,
			13 => ControlReply,
			14 => Ack,
			15 => Error,
			x => return Err(trastero_util::error::Error::Protocol(format!("unknown opcode {}", x))),
		})
	}
}

/// One message of the reliable channel
#[derive(Debug, Clone)]
pub struct Frame {
	pub opcode: OpCode,
	pub correlation: u32,
	pub payload: Bytes,
}

impl Frame {
	pub fn new(opcode: OpCode, correlation: u32, payload: Bytes) -> Self {
		Self {
			opcode,
			correlation,
			payload,
		}
	}

	/// An ACK reply to the given request frame
	pub fn ack(request: &Frame) -> Self {
		Self::new(OpCode::Ack, request.correlation, Bytes::new())
	}
}

/// Read one frame, tolerating arbitrary fragmentation of the stream
pub async fn read_frame<R>(reader: &mut R, max_payload: u64) -> Result<Frame, Error>
where
	R: AsyncRead + Unpin,
{
	let mut header = [0u8; HEADER_LEN];
	reader.read_exact(&mut header[..]).await?;

	let mut buf = &header[..];
	let opcode = OpCode::try_from(buf.get_u32())?;
	let correlation = buf.get_u32();
	let length = buf.get_u64();

	if length > max_payload {
		return Err(Error::Protocol(format!(
			"payload of {} bytes exceeds the {} byte limit",
			length, max_payload
		)));
	}

	let mut payload = vec![0u8; length as usize];
	reader.read_exact(&mut payload[..]).await?;

	Ok(Frame {
		opcode,
		correlation,
		payload: payload.into(),
	})
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
	W: AsyncWrite + Unpin,
{
	let mut header = BytesMut::with_capacity(HEADER_LEN);
	header.put_u32(frame.opcode as u32);
	header.put_u32(frame.correlation);
	header.put_u64(frame.payload.len() as u64);

	writer.write_all(&header[..]).await?;
	writer.write_all(&frame.payload[..]).await?;
	writer.flush().await?;

	Ok(())
}

/// Encode a structured payload (everything except raw block frames)
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, Error> {
	Ok(rmp_serde::to_vec_named(value)?.into())
}

/// Decode a structured payload
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
	Ok(rmp_serde::from_slice(bytes)?)
}

/// Reference to one block, used by BLOCK_GET and BLOCK_DELETE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
	pub file: String,
	pub index: u32,
}

/// Payload of BLOCK_PUT, hand-framed because it carries raw block
/// bytes: `file_name_len (2 B) | file_name | index (4 B) |
/// is_replica (1 B) | block_bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPutPayload {
	pub file: String,
	pub index: u32,
	pub is_replica: bool,
	pub data: Bytes,
}

impl BlockPutPayload {
	pub fn encode(&self) -> Result<Bytes, Error> {
		let name = self.file.as_bytes();
		if name.len() > u16::MAX as usize {
			return Err(Error::Protocol("file name too long".into()));
		}
		let mut buf = BytesMut::with_capacity(2 + name.len() + 5 + self.data.len());
		buf.put_u16(name.len() as u16);
		buf.put_slice(name);
		buf.put_u32(self.index);
		buf.put_u8(self.is_replica as u8);
		buf.put_slice(&self.data[..]);
		Ok(buf.freeze())
	}

	pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
		if buf.len() < 2 {
			return Err(Error::Protocol("truncated BLOCK_PUT payload".into()));
		}
		let name_len = buf.get_u16() as usize;
		if buf.len() < name_len + 5 {
			return Err(Error::Protocol("truncated BLOCK_PUT payload".into()));
		}
		let name = buf.split_to(name_len);
		let file = std::str::from_utf8(&name[..])
			.map_err(|_| Error::Protocol("file name is not UTF-8".into()))?
			.to_string();
		let index = buf.get_u32();
		let is_replica = match buf.get_u8() {
			0 => false,
			1 => true,
			x => return Err(Error::Protocol(format!("bad is_replica byte {}", x))),
		};
		Ok(Self {
			file,
			index,
			is_replica,
			data: buf,
		})
	}
}

/// Status byte of BLOCK_GET_REPLY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockGetStatus {
	Found = 0,
	Missing = 1,
}

/// Payload of BLOCK_GET_REPLY, hand-framed: `status (1 B) |
/// block_bytes?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGetReplyPayload {
	pub status: BlockGetStatus,
	pub data: Bytes,
}

impl BlockGetReplyPayload {
	pub fn found(data: Bytes) -> Self {
		Self {
			status: BlockGetStatus::Found,
			data,
		}
	}

	pub fn missing() -> Self {
		Self {
			status: BlockGetStatus::Missing,
			data: Bytes::new(),
		}
	}

	pub fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(1 + self.data.len());
		buf.put_u8(self.status as u8);
		buf.put_slice(&self.data[..]);
		buf.freeze()
	}

	pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
		if buf.is_empty() {
			return Err(Error::Protocol("empty BLOCK_GET_REPLY payload".into()));
		}
		let status = match buf.get_u8() {
			0 => BlockGetStatus::Found,
			1 => BlockGetStatus::Missing,
			x => return Err(Error::Protocol(format!("bad block status byte {}", x))),
		};
		Ok(Self { status, data: buf })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_frame_roundtrip() {
		let (mut a, mut b) = tokio::io::duplex(256);

		let frame = Frame::new(OpCode::FileDelete, 42, Bytes::from_static(b"doc.bin"));
		write_frame(&mut a, &frame).await.unwrap();

		let back = read_frame(&mut b, 1024).await.unwrap();
		assert_eq!(back.opcode, OpCode::FileDelete);
		assert_eq!(back.correlation, 42);
		assert_eq!(&back.payload[..], b"doc.bin");
	}

	#[tokio::test]
	async fn test_frame_tolerates_partial_writes() {
		let (mut a, mut b) = tokio::io::duplex(4);

		let payload = Bytes::from(vec![7u8; 100]);
		let frame = Frame::new(OpCode::BlockGet, 7, payload.clone());

		let reader = tokio::spawn(async move { read_frame(&mut b, 1024).await });
		// the duplex buffer is 4 bytes wide, so the writer dribbles the
		// frame out in many small chunks
		write_frame(&mut a, &frame).await.unwrap();

		let back = reader.await.unwrap().unwrap();
		assert_eq!(back.correlation, 7);
		assert_eq!(back.payload, payload);
	}

	#[tokio::test]
	async fn test_oversized_payload_is_refused() {
		let (mut a, mut b) = tokio::io::duplex(256);

		let frame = Frame::new(OpCode::BlockPut, 1, Bytes::from(vec![0u8; 64]));
		write_frame(&mut a, &frame).await.unwrap();

		match read_frame(&mut b, 16).await {
			Err(Error::Protocol(_)) => (),
			other => panic!("expected protocol error, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_unknown_opcode_is_refused() {
		let (mut a, mut b) = tokio::io::duplex(256);

		let mut header = BytesMut::new();
		header.put_u32(9999);
		header.put_u32(0);
		header.put_u64(0);
		a.write_all(&header[..]).await.unwrap();

		match read_frame(&mut b, 16).await {
			Err(Error::Protocol(_)) => (),
			other => panic!("expected protocol error, got {:?}", other),
		}
	}

	#[test]
	fn test_block_put_payload_roundtrip() {
		let p = BlockPutPayload {
			file: "doc.bin".into(),
			index: 3,
			is_replica: true,
			data: Bytes::from_static(b"hello blocks"),
		};
		let enc = p.encode().unwrap();
		// layout check: 2-byte name length prefix, then the name
		assert_eq!(&enc[..2], &(7u16).to_be_bytes()[..]);
		assert_eq!(&enc[2..9], b"doc.bin");
		assert_eq!(BlockPutPayload::decode(enc).unwrap(), p);
	}

	#[test]
	fn test_block_get_reply_roundtrip() {
		let found = BlockGetReplyPayload::found(Bytes::from_static(b"abc"));
		assert_eq!(
			BlockGetReplyPayload::decode(found.encode()).unwrap(),
			found
		);

		let missing = BlockGetReplyPayload::missing();
		let enc = missing.encode();
		assert_eq!(enc.len(), 1);
		assert_eq!(BlockGetReplyPayload::decode(enc).unwrap(), missing);
	}

	#[test]
	fn test_truncated_block_put_is_refused() {
		assert!(BlockPutPayload::decode(Bytes::from_static(b"\x00")).is_err());
		// name length says 10 but only 3 bytes follow
		assert!(BlockPutPayload::decode(Bytes::from_static(b"\x00\x0aabc")).is_err());
	}
}

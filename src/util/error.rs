//! Module containing error types used in Trastero
use err_derive::Error;
use serde::{Deserialize, Serialize};

/// Regroup all Trastero errors
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] #[error(from)] std::io::Error),

	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(source)] #[error(from)] rmp_serde::encode::Error),
	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(source)] #[error(from)] rmp_serde::decode::Error),
	#[error(display = "Tokio join error: {}", _0)]
	TokioJoin(#[error(source)] #[error(from)] tokio::task::JoinError),
	#[error(display = "Toml decode error: {}", _0)]
	TomlDecode(#[error(source)] #[error(from)] toml::de::Error),

	#[error(display = "Timeout")]
	Timeout,

	#[error(display = "Unexpected message: {}", _0)]
	UnexpectedMessage(String),

	#[error(display = "Malformed frame: {}", _0)]
	Protocol(String),

	#[error(display = "Peer {} is unreachable: {}", _0, _1)]
	PeerUnreachable(String, String),

	#[error(display = "Corrupt snapshot at {}: {}", _0, _1)]
	CorruptSnapshot(String, String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	pub fn unexpected_message<M: std::fmt::Debug>(msg: M) -> Self {
		Error::UnexpectedMessage(format!("{:?}", msg))
	}
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::watch::error::SendError<T>) -> Error {
		Error::Message("Watch send error".into())
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC send error".into())
	}
}

/// Trait to map any error type to Error::Message with a context message
pub trait ErrorContext<T, E> {
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error>;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
	E: std::fmt::Display,
{
	#[inline]
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}\n{}", ctx.borrow(), e)))
	}
}

/// Trait to map an Option or a faillible result to Error::Message
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", message.into(), e)))
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(message.into()))
	}
}

// Errors sometimes cross the wire inside reply payloads; only the
// rendered message survives the trip.
impl Serialize for Error {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(&format!("{}", self))
	}
}

impl<'de> Deserialize<'de> for Error {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(Error::Message(s))
	}
}

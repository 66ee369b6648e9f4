//! Error handling subsystem. Implements the crate-wide Error type.

use tracing::warn;

pub type SyResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// API called before `init` completed.
	NotInitialized,
	/// `connect` called without a signaling URL or room token.
	ConfigurationMissing(&'static str),
	/// Signaling could not be established on initial connect.
	TransportUnavailable(String),
	/// A request was outstanding when the peer's channel closed.
	PeerGone,
	/// A file-list or file request exceeded its deadline.
	Timeout,
	/// Entity id not present (catalog row or blob).
	NotFound,
	/// Underlying database or blob-store failure.
	StoreFailure(String),

	// Ambient
	Parse,
	Io(std::io::Error),
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!("json error: {}", err);
		Self::Parse
	}
}

impl From<std::num::ParseIntError> for Error {
	fn from(err: std::num::ParseIntError) -> Self {
		warn!("parse int error: {}", err);
		Self::Parse
	}
}

// vim: ts=4

//! File-transfer sub-protocol, multiplexed on the peer channel inside the
//! `custom` envelope with channel tag `file-transfer`.
//!
//! Request/response pairs (`file-list-request`/`file-list`) discover a
//! site's files; each file then streams as `file-start`, base64 `file-chunk`
//! frames of at most 64 KiB of payload, and `file-end`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use scrapyard_types::content_store::FileMeta;
use scrapyard_types::error::SyResult;

use crate::peer::ChannelMessage;

mod service;

pub use service::{FileTransfer, TransferProgress};

/// Channel tag inside the `custom` envelope.
pub const CHANNEL_TAG: &str = "file-transfer";

/// Decoded chunk payload ceiling.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Deadline for a `file-list` answer.
pub const FILE_LIST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Deadline for one complete file.
pub const FILE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferMessage {
	#[serde(rename_all = "camelCase")]
	FileListRequest { site_id: String },
	#[serde(rename_all = "camelCase")]
	FileList { site_id: String, files: Vec<FileMeta> },
	#[serde(rename_all = "camelCase")]
	FileRequest { site_id: String, path: String },
	#[serde(rename_all = "camelCase")]
	FileStart { site_id: String, path: String, content_type: String, size: u64 },
	#[serde(rename_all = "camelCase")]
	FileChunk { site_id: String, path: String, data: String },
	#[serde(rename_all = "camelCase")]
	FileEnd { site_id: String, path: String },
}

impl TransferMessage {
	/// Wrap for the peer channel.
	pub fn envelope(&self) -> SyResult<ChannelMessage> {
		Ok(ChannelMessage::Custom {
			channel: CHANNEL_TAG.to_string(),
			data: serde_json::to_value(self)?,
		})
	}

	pub fn parse(data: Value) -> SyResult<Self> {
		Ok(serde_json::from_value(data)?)
	}
}


// vim: ts=4

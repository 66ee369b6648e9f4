//! Peer sessions: one WebRTC connection and one ordered reliable data
//! channel (`ledger`) per remote peer.
//!
//! A single channel carries the catalog sync protocol and, through the
//! `custom` envelope, the file-transfer sub-protocol. Unknown message types
//! are ignored by receivers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scrapyard_types::crdt_store::ChangeRecord;
use scrapyard_types::error::SyResult;

mod manager;

pub use manager::PeerManager;

/// Name of the per-peer data channel.
pub const CHANNEL_LABEL: &str = "ledger";

/// Messages carried on a peer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
	/// Sent when a channel opens: asks the remote for everything newer
	/// than our version.
	SyncRequest { version: i64 },
	/// Reply to a sync request.
	SyncResponse { changes: Vec<ChangeRecord>, version: i64 },
	/// Incremental broadcast after local writes.
	Changes { changes: Vec<ChangeRecord>, version: i64 },
	Ping,
	Pong,
	/// Envelope for sub-protocols, discriminated by `channel`.
	Custom { channel: String, data: Value },
}

/// Events emitted by peer sessions toward the engine.
#[derive(Debug)]
pub enum PeerEvent {
	/// The data channel to this peer opened; sync can start.
	Ready { peer_id: String },
	/// A parsed channel message arrived.
	Message { peer_id: String, message: ChannelMessage },
	/// The channel closed or the connection failed.
	Left { peer_id: String },
	/// A local ICE candidate was gathered and must reach the remote peer
	/// through signaling.
	IceCandidate { peer_id: String, candidate: Value },
}

/// Sending half of the peer layer, as consumed by protocol services.
/// `send_bulk` applies channel back-pressure and is meant for chunk
/// streams; `send` is for small control messages.
#[async_trait]
pub trait ChannelSender: Send + Sync {
	async fn send(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()>;
	async fn send_bulk(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()>;
}


// vim: ts=4

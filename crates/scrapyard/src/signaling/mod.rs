//! Signaling protocol: JSON over WebSocket.
//!
//! The server's only job is to echo addressed messages to peers in the same
//! room and to broadcast membership changes. Authentication is the opaque
//! `token` URL parameter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod client;

pub use client::SignalingClient;

/// Messages this node sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutgoingMessage {
	#[serde(rename_all = "camelCase")]
	Join { peer_id: String },
	Offer { to: String, sdp: String },
	Answer { to: String, sdp: String },
	Ice { to: String, candidate: Value },
}

/// Messages the signaling server delivers to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingMessage {
	/// Current room roster, sent once after `join`. The receiving node
	/// initiates connections to every listed peer.
	#[serde(rename_all = "camelCase")]
	Peers { peer_ids: Vec<String> },
	#[serde(rename_all = "camelCase")]
	PeerJoin { peer_id: String },
	#[serde(rename_all = "camelCase")]
	PeerLeave { peer_id: String },
	Offer { from: String, sdp: String },
	Answer { from: String, sdp: String },
	Ice { from: String, candidate: Value },
}

/// Typed event stream emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
	Message(IncomingMessage),
	Reconnecting { attempt: u32 },
	Reconnected,
	Disconnected,
}


// vim: ts=4

//! Engine events surfaced to API consumers.

/// Emitted on the engine's broadcast channel. Subscribers unsubscribe by
/// dropping their receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
	/// A change batch from a peer was folded into the catalog.
	Sync { count: usize, from_peer: String },
	/// A peer's data channel opened.
	PeerReady { peer_id: String },
	/// A peer left the room or its connection failed.
	PeerLeave { peer_id: String },
	/// Signaling dropped; a reconnect attempt is scheduled.
	Reconnecting { attempt: u32 },
	/// Signaling re-established after a drop.
	Reconnected,
	/// Reconnect attempts exhausted; sync is stopped until `connect` is
	/// called again.
	Disconnected,
}

// vim: ts=4

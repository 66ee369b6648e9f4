//! WebRTC peer connection management.
//!
//! The manager owns one `RTCPeerConnection` per remote peer. The initiator
//! creates the `ledger` data channel; the non-initiator adopts the
//! remote-opened one. All session events funnel into one mpsc consumed by
//! the engine's event loop, which also relays gathered ICE candidates back
//! through signaling.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::prelude::*;

use super::{ChannelMessage, ChannelSender, PeerEvent, CHANNEL_LABEL};

/// Keep this much headroom on the channel before pushing more bulk data.
const BUFFERED_HIGH_WATER: usize = 1 << 20;
/// How long a congested channel may stall a bulk send before it fails.
const CONGESTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for channel headroom.
const CONGESTION_POLL: Duration = Duration::from_millis(10);

struct PeerSession {
	peer_id: String,
	connection: Arc<RTCPeerConnection>,
	channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
	ready: Arc<AtomicBool>,
	last_synced_version: AtomicI64,
	/// Set when a keepalive ping goes out, cleared by the pong.
	awaiting_pong: AtomicBool,
	pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

pub struct PeerManager {
	ice_servers: Vec<String>,
	event_tx: mpsc::UnboundedSender<PeerEvent>,
	/// Insertion-ordered: broadcast walks peers in join order.
	peers: RwLock<Vec<Arc<PeerSession>>>,
}

impl PeerManager {
	pub fn new(ice_servers: Vec<String>, event_tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
		Self { ice_servers, event_tx, peers: RwLock::new(Vec::new()) }
	}

	pub async fn has_peer(&self, peer_id: &str) -> bool {
		self.peers.read().await.iter().any(|p| p.peer_id == peer_id)
	}

	pub async fn peer_ids(&self) -> Vec<String> {
		self.peers.read().await.iter().map(|p| p.peer_id.clone()).collect()
	}

	pub async fn ready_peers(&self) -> Vec<String> {
		self.peers
			.read()
			.await
			.iter()
			.filter(|p| p.ready.load(Ordering::SeqCst))
			.map(|p| p.peer_id.clone())
			.collect()
	}

	pub async fn set_last_synced(&self, peer_id: &str, version: i64) {
		let peers = self.peers.read().await;
		if let Some(session) = peers.iter().find(|p| p.peer_id == peer_id) {
			session.last_synced_version.store(version, Ordering::SeqCst);
		}
	}

	pub async fn last_synced(&self, peer_id: &str) -> Option<i64> {
		let peers = self.peers.read().await;
		peers
			.iter()
			.find(|p| p.peer_id == peer_id)
			.map(|p| p.last_synced_version.load(Ordering::SeqCst))
	}

	/// Initiator path: create the connection and the `ledger` channel,
	/// return the SDP offer to forward through signaling.
	pub async fn create_offer(&self, peer_id: &str) -> SyResult<String> {
		let session = self.create_session(peer_id).await?;

		let dc = session
			.connection
			.create_data_channel(CHANNEL_LABEL, None)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		self.adopt_channel(&session, dc).await;

		let offer = session
			.connection
			.create_offer(None)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		session
			.connection
			.set_local_description(offer.clone())
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;

		info!("created offer for peer {}", peer_id);
		Ok(offer.sdp)
	}

	/// Non-initiator path: accept a remote offer and return the answer SDP.
	pub async fn handle_offer(&self, peer_id: &str, sdp: &str) -> SyResult<String> {
		let session = match self.find(peer_id).await {
			Some(session) => session,
			None => self.create_session(peer_id).await?,
		};

		let offer = RTCSessionDescription::offer(sdp.to_string())
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		session
			.connection
			.set_remote_description(offer)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		self.drain_candidates(&session).await;

		let answer = session
			.connection
			.create_answer(None)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		session
			.connection
			.set_local_description(answer.clone())
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;

		info!("answered offer from peer {}", peer_id);
		Ok(answer.sdp)
	}

	pub async fn handle_answer(&self, peer_id: &str, sdp: &str) -> SyResult<()> {
		let session = self.find(peer_id).await.ok_or(Error::PeerGone)?;
		let answer = RTCSessionDescription::answer(sdp.to_string())
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		session
			.connection
			.set_remote_description(answer)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		self.drain_candidates(&session).await;
		Ok(())
	}

	/// Fold in a remote ICE candidate, queueing it if the remote
	/// description has not arrived yet.
	pub async fn handle_ice(&self, peer_id: &str, candidate: serde_json::Value) -> SyResult<()> {
		let session = self.find(peer_id).await.ok_or(Error::PeerGone)?;
		let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;

		if session.connection.remote_description().await.is_none() {
			session.pending_candidates.lock().await.push(init);
			return Ok(());
		}
		session
			.connection
			.add_ice_candidate(init)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		Ok(())
	}

	/// Send to every ready peer in insertion order. Per-peer failures are
	/// logged and swallowed; returns the number of successful sends.
	pub async fn broadcast(&self, message: &ChannelMessage) -> usize {
		let text = match serde_json::to_string(message) {
			Ok(text) => text,
			Err(err) => {
				warn!("unserializable channel message: {}", err);
				return 0;
			}
		};

		let sessions: Vec<Arc<PeerSession>> = self.peers.read().await.clone();
		let mut sent = 0;
		for session in sessions {
			if !session.ready.load(Ordering::SeqCst) {
				continue;
			}
			let channel = session.channel.read().await.clone();
			if let Some(dc) = channel {
				match dc.send_text(text.clone()).await {
					Ok(_) => sent += 1,
					Err(err) => warn!("broadcast to {} failed: {}", session.peer_id, err),
				}
			}
		}
		sent
	}

	/// Ping every ready peer, logging any that never answered the previous
	/// keepalive. Unanswered peers are not torn down; connection failure
	/// handling owns that.
	pub async fn keepalive_tick(&self) {
		let text = match serde_json::to_string(&ChannelMessage::Ping) {
			Ok(text) => text,
			Err(_) => return,
		};

		let sessions: Vec<Arc<PeerSession>> = self.peers.read().await.clone();
		for session in sessions {
			if !session.ready.load(Ordering::SeqCst) {
				continue;
			}
			if session.awaiting_pong.swap(true, Ordering::SeqCst) {
				warn!("peer {} did not answer the last keepalive ping", session.peer_id);
			}
			let channel = session.channel.read().await.clone();
			if let Some(dc) = channel {
				if let Err(err) = dc.send_text(text.clone()).await {
					warn!("keepalive to {} failed: {}", session.peer_id, err);
				}
			}
		}
	}

	/// The peer answered a keepalive ping.
	pub async fn note_pong(&self, peer_id: &str) {
		let peers = self.peers.read().await;
		if let Some(session) = peers.iter().find(|p| p.peer_id == peer_id) {
			session.awaiting_pong.store(false, Ordering::SeqCst);
		}
	}

	pub async fn close_peer(&self, peer_id: &str) {
		let session = {
			let mut peers = self.peers.write().await;
			match peers.iter().position(|p| p.peer_id == peer_id) {
				Some(idx) => peers.remove(idx),
				None => return,
			}
		};
		session.ready.store(false, Ordering::SeqCst);

		// Detach the close-side handlers first: an explicit close must not
		// produce a `Left` event, which could tear down a replacement
		// session for the same peer id.
		session
			.connection
			.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
		if let Some(dc) = session.channel.read().await.clone() {
			dc.on_close(Box::new(|| Box::pin(async {})));
		}

		if let Err(err) = session.connection.close().await {
			debug!("closing connection to {}: {}", peer_id, err);
		}
		info!("peer {} closed", peer_id);
	}

	pub async fn close_all(&self) {
		let peers: Vec<String> = {
			let peers = self.peers.read().await;
			peers.iter().map(|p| p.peer_id.clone()).collect()
		};
		for peer_id in peers {
			self.close_peer(&peer_id).await;
		}
	}

	async fn find(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
		self.peers.read().await.iter().find(|p| p.peer_id == peer_id).cloned()
	}

	async fn drain_candidates(&self, session: &Arc<PeerSession>) {
		let pending: Vec<RTCIceCandidateInit> =
			session.pending_candidates.lock().await.drain(..).collect();
		for init in pending {
			if let Err(err) = session.connection.add_ice_candidate(init).await {
				warn!("queued ICE candidate for {} rejected: {}", session.peer_id, err);
			}
		}
	}

	async fn create_session(&self, peer_id: &str) -> SyResult<Arc<PeerSession>> {
		// A stale session for the same peer is replaced.
		if self.has_peer(peer_id).await {
			self.close_peer(peer_id).await;
		}

		let mut media_engine = MediaEngine::default();
		media_engine
			.register_default_codecs()
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		let mut registry = Registry::new();
		registry = register_default_interceptors(registry, &mut media_engine)
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		let api = APIBuilder::new()
			.with_media_engine(media_engine)
			.with_interceptor_registry(registry)
			.build();

		let urls = if self.ice_servers.is_empty() {
			vec![
				"stun:stun.l.google.com:19302".to_string(),
				"stun:stun1.l.google.com:19302".to_string(),
			]
		} else {
			self.ice_servers.clone()
		};
		let config = RTCConfiguration {
			ice_servers: vec![RTCIceServer { urls, ..Default::default() }],
			..Default::default()
		};

		let connection = Arc::new(
			api.new_peer_connection(config)
				.await
				.map_err(|err| Error::TransportUnavailable(err.to_string()))?,
		);

		let session = Arc::new(PeerSession {
			peer_id: peer_id.to_string(),
			connection: connection.clone(),
			channel: Arc::new(RwLock::new(None)),
			ready: Arc::new(AtomicBool::new(false)),
			last_synced_version: AtomicI64::new(0),
			awaiting_pong: AtomicBool::new(false),
			pending_candidates: Mutex::new(Vec::new()),
		});

		let event_tx = self.event_tx.clone();
		let pid = peer_id.to_string();
		connection.on_peer_connection_state_change(Box::new(move |state| {
			let tx = event_tx.clone();
			let pid = pid.clone();
			Box::pin(async move {
				debug!("peer {} connection state: {}", pid, state);
				if matches!(
					state,
					RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
				) {
					let _ = tx.send(PeerEvent::Left { peer_id: pid });
				}
			})
		}));

		let event_tx = self.event_tx.clone();
		let pid = peer_id.to_string();
		connection.on_ice_candidate(Box::new(move |candidate| {
			let tx = event_tx.clone();
			let pid = pid.clone();
			Box::pin(async move {
				if let Some(candidate) = candidate {
					match candidate.to_json().map(serde_json::to_value) {
						Ok(Ok(json)) => {
							let _ = tx.send(PeerEvent::IceCandidate {
								peer_id: pid,
								candidate: json,
							});
						}
						_ => warn!("unserializable ICE candidate from {}", pid),
					}
				}
			})
		}));

		// Non-initiator: adopt the channel the remote side opens.
		let event_tx = self.event_tx.clone();
		let pid = peer_id.to_string();
		let ready = session.ready.clone();
		let slot = session.channel.clone();
		connection.on_data_channel(Box::new(move |dc| {
			let event_tx = event_tx.clone();
			let pid = pid.clone();
			let ready = ready.clone();
			let slot = slot.clone();
			Box::pin(async move {
				if dc.label() != CHANNEL_LABEL {
					debug!("ignoring channel {:?} from {}", dc.label(), pid);
					return;
				}
				wire_channel(&event_tx, &pid, &ready, dc.clone());
				*slot.write().await = Some(dc);
			})
		}));

		self.peers.write().await.push(session.clone());
		debug!("created peer connection for {}", peer_id);
		Ok(session)
	}

	async fn adopt_channel(&self, session: &Arc<PeerSession>, dc: Arc<RTCDataChannel>) {
		wire_channel(&self.event_tx, &session.peer_id, &session.ready, dc.clone());
		*session.channel.write().await = Some(dc);
	}

	async fn channel_for(&self, peer_id: &str) -> SyResult<Arc<RTCDataChannel>> {
		let session = self.find(peer_id).await.ok_or(Error::PeerGone)?;
		let channel = session.channel.read().await.clone();
		channel.ok_or(Error::PeerGone)
	}
}

#[async_trait]
impl ChannelSender for PeerManager {
	async fn send(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		let dc = self.channel_for(peer_id).await?;
		let text = serde_json::to_string(message)?;
		dc.send_text(text).await.map_err(|_| Error::PeerGone)?;
		Ok(())
	}

	async fn send_bulk(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		let dc = self.channel_for(peer_id).await?;

		// Wait for headroom instead of blind-throttling; a channel that
		// stays congested past the deadline fails the transfer loudly.
		let start = tokio::time::Instant::now();
		while dc.buffered_amount().await > BUFFERED_HIGH_WATER {
			if start.elapsed() > CONGESTION_TIMEOUT {
				warn!("channel to {} congested beyond deadline", peer_id);
				return Err(Error::Timeout);
			}
			tokio::time::sleep(CONGESTION_POLL).await;
		}

		let text = serde_json::to_string(message)?;
		dc.send_text(text).await.map_err(|_| Error::PeerGone)?;
		Ok(())
	}
}

/// Install open/message/close handlers on a `ledger` channel.
fn wire_channel(
	event_tx: &mpsc::UnboundedSender<PeerEvent>,
	peer_id: &str,
	ready: &Arc<AtomicBool>,
	dc: Arc<RTCDataChannel>,
) {
	let tx = event_tx.clone();
	let pid = peer_id.to_string();
	let ready_flag = ready.clone();
	dc.on_open(Box::new(move || {
		let tx = tx.clone();
		let pid = pid.clone();
		let ready_flag = ready_flag.clone();
		Box::pin(async move {
			ready_flag.store(true, Ordering::SeqCst);
			info!("data channel to {} open", pid);
			let _ = tx.send(PeerEvent::Ready { peer_id: pid });
		})
	}));

	let tx = event_tx.clone();
	let pid = peer_id.to_string();
	dc.on_message(Box::new(move |msg| {
		let tx = tx.clone();
		let pid = pid.clone();
		Box::pin(async move {
			let message = match serde_json::from_slice::<ChannelMessage>(&msg.data) {
				Ok(message) => message,
				Err(err) => {
					// Malformed or unknown-typed frames are dropped, never fatal.
					warn!("bad channel message from {}: {}", pid, err);
					return;
				}
			};
			let _ = tx.send(PeerEvent::Message { peer_id: pid, message });
		})
	}));

	let tx = event_tx.clone();
	let pid = peer_id.to_string();
	let ready_flag = ready.clone();
	dc.on_close(Box::new(move || {
		let tx = tx.clone();
		let pid = pid.clone();
		let ready_flag = ready_flag.clone();
		Box::pin(async move {
			ready_flag.store(false, Ordering::SeqCst);
			let _ = tx.send(PeerEvent::Left { peer_id: pid });
		})
	}));
}

// vim: ts=4

//! The catalog engine.
//!
//! Wires the CRDT store to the peer layer: answers sync requests with
//! change sets, folds inbound batches into the store, and broadcasts
//! coalesced local changes to every ready peer. The public API is the
//! catalog surface clients use; all network state lives in a session
//! created by `connect` and torn down by `disconnect`.

use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use scrapyard_types::content_store::ContentStore;
use scrapyard_types::crdt_store::CrdtStore;
use scrapyard_types::utils::iso_now;

use crate::config::Config;
use crate::events::EngineEvent;
use crate::peer::{ChannelMessage, ChannelSender, PeerEvent, PeerManager};
use crate::prelude::*;
use crate::signaling::{IncomingMessage, OutgoingMessage, SignalingClient, SignalingEvent};
use crate::transfer::{FileTransfer, TransferProgress, CHANNEL_TAG};

use super::site::{site_from_row, sites_from_rows, SITES_DDL, SITES_TABLE};

/// Local write bursts are batched behind one broadcast tick.
const BROADCAST_COALESCE: Duration = Duration::from_millis(20);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

struct Session {
	signaling: SignalingClient,
	peers: Arc<PeerManager>,
	tasks: Vec<JoinHandle<()>>,
}

pub struct Catalog {
	config: Config,
	store: Arc<dyn CrdtStore>,
	content: Arc<dyn ContentStore>,
	transfer: Arc<FileTransfer>,
	events: broadcast::Sender<EngineEvent>,
	peers_slot: Arc<RwLock<Option<Arc<PeerManager>>>>,
	last_broadcast: Arc<AtomicI64>,
	session: Mutex<Option<Session>>,
	broadcast_task: JoinHandle<()>,
}

impl Drop for Catalog {
	fn drop(&mut self) {
		self.broadcast_task.abort();
	}
}

impl Catalog {
	/// Prepare the replicated `sites` table and start watching the store
	/// for local writes. Network activity starts with [`Catalog::connect`].
	pub async fn init(
		config: Config,
		store: Arc<dyn CrdtStore>,
		content: Arc<dyn ContentStore>,
	) -> SyResult<Self> {
		store.exec(SITES_DDL, &[]).await?;
		store.enable_crdt(SITES_TABLE).await?;

		let transfer = Arc::new(FileTransfer::new(content.clone()));
		let (events, _) = broadcast::channel(256);
		let peers_slot = Arc::new(RwLock::new(None));
		let last_broadcast = Arc::new(AtomicI64::new(0));

		let broadcast_task = tokio::spawn(broadcast_loop(
			store.clone(),
			peers_slot.clone(),
			last_broadcast.clone(),
			store.subscribe(),
		));

		info!("catalog initialized as node {}", store.node_id());
		Ok(Self {
			config,
			store,
			content,
			transfer,
			events,
			peers_slot,
			last_broadcast,
			session: Mutex::new(None),
			broadcast_task,
		})
	}

	pub fn node_id(&self) -> &str {
		self.store.node_id()
	}

	pub fn content(&self) -> Arc<dyn ContentStore> {
		self.content.clone()
	}

	/// Engine events; receivers unsubscribe by drop.
	pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
		self.events.subscribe()
	}

	/// Byte-level transfer progress events.
	pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
		self.transfer.subscribe_progress()
	}

	// Session lifecycle
	//*******************

	/// Join the configured room: connect signaling, and from then on
	/// open a peer session per roster member.
	pub async fn connect(&self) -> SyResult<()> {
		let mut session = self.session.lock().await;
		if session.is_some() {
			return Ok(());
		}
		if self.config.signaling_url.is_empty() {
			return Err(Error::ConfigurationMissing("signalingUrl"));
		}
		let Some(token) = self.config.token.clone() else {
			return Err(Error::ConfigurationMissing("token"));
		};

		let (sig_tx, sig_rx) = mpsc::unbounded_channel();
		let signaling = SignalingClient::connect(
			&self.config.signaling_url,
			&token,
			self.store.node_id(),
			sig_tx,
		)
		.await?;

		let (peer_tx, peer_rx) = mpsc::unbounded_channel();
		let peers = Arc::new(PeerManager::new(self.config.ice_servers.clone(), peer_tx));

		self.transfer.set_sender(peers.clone()).await;
		*self.peers_slot.write().await = Some(peers.clone());
		self.last_broadcast.store(self.store.version().await?, Ordering::SeqCst);

		let event_task = tokio::spawn(event_loop(
			self.store.clone(),
			self.transfer.clone(),
			self.events.clone(),
			peers.clone(),
			signaling.clone(),
			self.store.node_id().to_string(),
			sig_rx,
			peer_rx,
		));
		let keepalive_task = tokio::spawn(keepalive_loop(peers.clone()));

		*session = Some(Session { signaling, peers, tasks: vec![event_task, keepalive_task] });
		Ok(())
	}

	/// Leave the room: close signaling without reconnecting, drop every
	/// peer, and fail outstanding transfers with `PeerGone`. The catalog
	/// API stays usable and `connect` may be called again.
	pub async fn disconnect(&self) {
		let Some(session) = self.session.lock().await.take() else { return };

		session.signaling.close();
		let peer_ids = session.peers.peer_ids().await;
		session.peers.close_all().await;
		for peer_id in peer_ids {
			self.transfer.peer_gone(&peer_id).await;
			let _ = self.events.send(EngineEvent::PeerLeave { peer_id });
		}
		for task in session.tasks {
			task.abort();
		}

		self.transfer.clear_sender().await;
		*self.peers_slot.write().await = None;
		info!("disconnected from room");
	}

	// Catalog API
	//*************

	pub async fn all_sites(&self) -> SyResult<Vec<Site>> {
		let rows = self
			.store
			.query("SELECT * FROM sites ORDER BY added_at DESC, id", &[])
			.await?;
		sites_from_rows(rows)
	}

	pub async fn my_sites(&self) -> SyResult<Vec<Site>> {
		let rows = self
			.store
			.query(
				"SELECT * FROM sites WHERE owner_id = ? ORDER BY added_at DESC, id",
				&[Value::from(self.store.node_id())],
			)
			.await?;
		sites_from_rows(rows)
	}

	/// Sites owned by other nodes.
	pub async fn available_sites(&self) -> SyResult<Vec<Site>> {
		let rows = self
			.store
			.query(
				"SELECT * FROM sites WHERE owner_id != ? ORDER BY added_at DESC, id",
				&[Value::from(self.store.node_id())],
			)
			.await?;
		sites_from_rows(rows)
	}

	pub async fn get(&self, id: &str) -> SyResult<Option<Site>> {
		let rows = self
			.store
			.query("SELECT * FROM sites WHERE id = ?", &[Value::from(id)])
			.await?;
		rows.into_iter().next().map(site_from_row).transpose()
	}

	/// Create an owned catalog row. Assigns the id, stamps both
	/// timestamps, and sets this node as owner.
	pub async fn add(&self, new: NewSite) -> SyResult<Site> {
		let now = iso_now();
		let site = Site {
			id: Uuid::new_v4().to_string(),
			name: new.name,
			description: new.description,
			url: new.url,
			thumbnail: new.thumbnail,
			owner_id: self.store.node_id().to_string(),
			content_hash: new.content_hash,
			file_count: new.file_count,
			file_size: new.file_size,
			added_at: now.clone(),
			updated_at: now,
		};

		self.store
			.exec(
				"INSERT INTO sites (id, name, description, url, thumbnail, owner_id, \
				content_hash, file_count, file_size, added_at, updated_at) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
				&[
					Value::from(site.id.clone()),
					Value::from(site.name.clone()),
					Value::from(site.description.clone()),
					Value::from(site.url.clone()),
					Value::from(site.thumbnail.clone()),
					Value::from(site.owner_id.clone()),
					site.content_hash.clone().map_or(Value::Null, Value::from),
					Value::from(site.file_count),
					Value::from(site.file_size),
					Value::from(site.added_at.clone()),
					Value::from(site.updated_at.clone()),
				],
			)
			.await?;

		info!("added site {} ({:?})", site.id, site.name);
		Ok(site)
	}

	/// Patch mutable columns. A missing id returns `None` without error.
	pub async fn update(&self, id: &str, patch: SiteUpdate) -> SyResult<Option<Site>> {
		if self.get(id).await?.is_none() {
			return Ok(None);
		}

		let mut sets: Vec<String> = Vec::new();
		let mut params: Vec<Value> = Vec::new();
		push_patch(&mut sets, &mut params, "name", patch.name, Value::from(""));
		push_patch(&mut sets, &mut params, "description", patch.description, Value::from(""));
		push_patch(&mut sets, &mut params, "url", patch.url, Value::from(""));
		push_patch(&mut sets, &mut params, "thumbnail", patch.thumbnail, Value::from(""));
		push_patch(&mut sets, &mut params, "content_hash", patch.content_hash, Value::Null);
		push_patch(&mut sets, &mut params, "file_count", patch.file_count, Value::from(0));
		push_patch(&mut sets, &mut params, "file_size", patch.file_size, Value::from(0));

		sets.push("updated_at = ?".to_string());
		params.push(Value::from(iso_now()));
		params.push(Value::from(id));

		let sql = format!("UPDATE sites SET {} WHERE id = ?", sets.join(", "));
		self.store.exec(&sql, &params).await?;
		self.get(id).await
	}

	/// Tombstone a row. Idempotent.
	pub async fn remove(&self, id: &str) -> SyResult<()> {
		self.store.exec("DELETE FROM sites WHERE id = ?", &[Value::from(id)]).await?;
		Ok(())
	}

	/// Refresh the owner-side file statistics after ingestion changes.
	pub async fn update_file_stats(&self, id: &str, count: i64, size: i64) -> SyResult<()> {
		self.store
			.exec(
				"UPDATE sites SET file_count = ?, file_size = ?, updated_at = ? WHERE id = ?",
				&[
					Value::from(count),
					Value::from(size),
					Value::from(iso_now()),
					Value::from(id),
				],
			)
			.await?;
		Ok(())
	}

	/// Deduplicate own uploads by content fingerprint.
	pub async fn find_mine_by_hash(&self, hash: &str) -> SyResult<Option<Site>> {
		let rows = self
			.store
			.query(
				"SELECT * FROM sites WHERE owner_id = ? AND content_hash = ? LIMIT 1",
				&[Value::from(self.store.node_id()), Value::from(hash)],
			)
			.await?;
		rows.into_iter().next().map(site_from_row).transpose()
	}

	/// Copy a foreign row's metadata into a new row owned by this node.
	/// Returns the new row and the original id; the caller is responsible
	/// for copying blobs between the two site ids.
	pub async fn adopt(&self, original_id: &str) -> SyResult<(Site, String)> {
		let original = self.get(original_id).await?.ok_or(Error::NotFound)?;
		let adopted = self
			.add(NewSite {
				name: original.name,
				description: original.description,
				url: original.url,
				thumbnail: original.thumbnail,
				content_hash: original.content_hash,
				file_count: original.file_count,
				file_size: original.file_size,
			})
			.await?;
		info!("adopted site {} as {}", original_id, adopted.id);
		Ok((adopted, original_id.to_string()))
	}

	// File transfer
	//***************

	/// Fetch every file of a foreign site from the peer that has it.
	pub async fn import_site(
		&self,
		peer_id: &str,
		site_id: &str,
		progress: impl FnMut(usize, usize, &str) + Send,
	) -> SyResult<usize> {
		self.transfer.import_site(peer_id, site_id, progress).await
	}

	pub async fn site_size(&self, site_id: &str) -> SyResult<u64> {
		self.content.size(site_id).await
	}

	pub async fn total_size(&self) -> SyResult<u64> {
		self.content.total_size().await
	}
}

fn push_patch(
	sets: &mut Vec<String>,
	params: &mut Vec<Value>,
	col: &str,
	patch: Patch<impl Into<Value>>,
	null_value: Value,
) {
	match patch {
		Patch::Undefined => {}
		Patch::Null => {
			sets.push(format!("{col} = ?"));
			params.push(null_value);
		}
		Patch::Value(value) => {
			sets.push(format!("{col} = ?"));
			params.push(value.into());
		}
	}
}

/// Watch the store's update hook and broadcast coalesced change batches.
async fn broadcast_loop(
	store: Arc<dyn CrdtStore>,
	peers_slot: Arc<RwLock<Option<Arc<PeerManager>>>>,
	last_broadcast: Arc<AtomicI64>,
	mut updates: broadcast::Receiver<scrapyard_types::crdt_store::RowChange>,
) {
	loop {
		match updates.recv().await {
			Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
			Err(broadcast::error::RecvError::Closed) => return,
		}

		// Let the burst settle, then drain it behind one broadcast.
		tokio::time::sleep(BROADCAST_COALESCE).await;
		while updates.try_recv().is_ok() {}

		let Some(peers) = peers_slot.read().await.clone() else { continue };
		let since = last_broadcast.load(Ordering::SeqCst);
		let changes = match store.changes_since(since).await {
			Ok(changes) => changes,
			Err(err) => {
				warn!("change extraction failed: {}", err);
				continue;
			}
		};
		if changes.is_empty() {
			continue;
		}
		let Ok(version) = store.version().await else { continue };

		let count = changes.len();
		let sent = peers.broadcast(&ChannelMessage::Changes { changes, version }).await;
		last_broadcast.store(version, Ordering::SeqCst);
		debug!("broadcast {} changes at v{} to {} peers", count, version, sent);
	}
}

async fn keepalive_loop(peers: Arc<PeerManager>) {
	let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
	interval.tick().await;
	loop {
		interval.tick().await;
		peers.keepalive_tick().await;
	}
}

/// The session event loop: signaling drives peer lifecycle, peer events
/// drive the sync and transfer protocols.
#[allow(clippy::too_many_arguments)]
async fn event_loop(
	store: Arc<dyn CrdtStore>,
	transfer: Arc<FileTransfer>,
	events: broadcast::Sender<EngineEvent>,
	peers: Arc<PeerManager>,
	signaling: SignalingClient,
	me: String,
	mut sig_rx: mpsc::UnboundedReceiver<SignalingEvent>,
	mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
) {
	loop {
		tokio::select! {
			event = sig_rx.recv() => {
				let Some(event) = event else { break };
				handle_signaling_event(&transfer, &events, &peers, &signaling, &me, event).await;
			}
			event = peer_rx.recv() => {
				let Some(event) = event else { break };
				handle_peer_event(&store, &transfer, &events, &peers, &signaling, event).await;
			}
		}
	}
	debug!("session event loop ended");
}

async fn handle_signaling_event(
	transfer: &Arc<FileTransfer>,
	events: &broadcast::Sender<EngineEvent>,
	peers: &Arc<PeerManager>,
	signaling: &SignalingClient,
	me: &str,
	event: SignalingEvent,
) {
	match event {
		SignalingEvent::Message(IncomingMessage::Peers { peer_ids }) => {
			// We just joined: initiate toward everyone already in the room.
			for peer_id in peer_ids {
				if peer_id == me || peers.has_peer(&peer_id).await {
					continue;
				}
				match peers.create_offer(&peer_id).await {
					Ok(sdp) => {
						let _ = signaling.send(OutgoingMessage::Offer { to: peer_id, sdp });
					}
					Err(err) => warn!("offer to {} failed: {}", peer_id, err),
				}
			}
		}
		SignalingEvent::Message(IncomingMessage::PeerJoin { peer_id }) => {
			// The joiner receives the roster and initiates; we just wait.
			debug!("peer {} joined the room", peer_id);
		}
		SignalingEvent::Message(IncomingMessage::PeerLeave { peer_id }) => {
			drop_peer(transfer, events, peers, &peer_id).await;
		}
		SignalingEvent::Message(IncomingMessage::Offer { from, sdp }) => {
			match peers.handle_offer(&from, &sdp).await {
				Ok(answer) => {
					let _ = signaling.send(OutgoingMessage::Answer { to: from, sdp: answer });
				}
				Err(err) => warn!("answering {} failed: {}", from, err),
			}
		}
		SignalingEvent::Message(IncomingMessage::Answer { from, sdp }) => {
			if let Err(err) = peers.handle_answer(&from, &sdp).await {
				warn!("answer from {} rejected: {}", from, err);
			}
		}
		SignalingEvent::Message(IncomingMessage::Ice { from, candidate }) => {
			if let Err(err) = peers.handle_ice(&from, candidate).await {
				debug!("ICE candidate from {} rejected: {}", from, err);
			}
		}
		SignalingEvent::Reconnecting { attempt } => {
			let _ = events.send(EngineEvent::Reconnecting { attempt });
		}
		SignalingEvent::Reconnected => {
			let _ = events.send(EngineEvent::Reconnected);
		}
		SignalingEvent::Disconnected => {
			let _ = events.send(EngineEvent::Disconnected);
		}
	}
}

async fn handle_peer_event(
	store: &Arc<dyn CrdtStore>,
	transfer: &Arc<FileTransfer>,
	events: &broadcast::Sender<EngineEvent>,
	peers: &Arc<PeerManager>,
	signaling: &SignalingClient,
	event: PeerEvent,
) {
	match event {
		PeerEvent::IceCandidate { peer_id, candidate } => {
			let _ = signaling.send(OutgoingMessage::Ice { to: peer_id, candidate });
		}
		PeerEvent::Ready { peer_id } => {
			// First thing on a fresh channel: ask for everything newer
			// than what we have.
			let version = store.version().await.unwrap_or(0);
			if let Err(err) =
				peers.send(&peer_id, &ChannelMessage::SyncRequest { version }).await
			{
				warn!("sync request to {} failed: {}", peer_id, err);
			}
			let _ = events.send(EngineEvent::PeerReady { peer_id });
		}
		PeerEvent::Message { peer_id, message } => {
			handle_channel_message(store, transfer, events, peers, &peer_id, message).await;
		}
		PeerEvent::Left { peer_id } => {
			if peers.has_peer(&peer_id).await {
				drop_peer(transfer, events, peers, &peer_id).await;
			}
		}
	}
}

async fn handle_channel_message(
	store: &Arc<dyn CrdtStore>,
	transfer: &Arc<FileTransfer>,
	events: &broadcast::Sender<EngineEvent>,
	peers: &Arc<PeerManager>,
	peer_id: &str,
	message: ChannelMessage,
) {
	match message {
		ChannelMessage::SyncRequest { version } => match store.changes_since(version).await {
			Ok(changes) => {
				let current = store.version().await.unwrap_or(version);
				let response = ChannelMessage::SyncResponse { changes, version: current };
				if let Err(err) = peers.send(peer_id, &response).await {
					warn!("sync response to {} failed: {}", peer_id, err);
				}
			}
			Err(err) => warn!("sync request from {} failed: {}", peer_id, err),
		},
		ChannelMessage::SyncResponse { changes, version }
		| ChannelMessage::Changes { changes, version } => {
			let count = changes.len();
			match store.apply_changes(&changes).await {
				Ok(()) => {
					peers.set_last_synced(peer_id, version).await;
					let _ = events.send(EngineEvent::Sync {
						count,
						from_peer: peer_id.to_string(),
					});
				}
				// Not advancing last-synced means the batch is re-requested
				// on the next sync round.
				Err(err) => warn!("apply from {} failed: {}", peer_id, err),
			}
		}
		ChannelMessage::Ping => {
			if let Err(err) = peers.send(peer_id, &ChannelMessage::Pong).await {
				debug!("pong to {} failed: {}", peer_id, err);
			}
		}
		ChannelMessage::Pong => {
			peers.note_pong(peer_id).await;
			debug!("pong from {}", peer_id);
		}
		ChannelMessage::Custom { channel, data } => {
			if channel == CHANNEL_TAG {
				transfer.handle_message(peer_id, data).await;
			} else {
				debug!("unknown custom channel {:?} from {}", channel, peer_id);
			}
		}
	}
}

async fn drop_peer(
	transfer: &Arc<FileTransfer>,
	events: &broadcast::Sender<EngineEvent>,
	peers: &Arc<PeerManager>,
	peer_id: &str,
) {
	peers.close_peer(peer_id).await;
	transfer.peer_gone(peer_id).await;
	let _ = events.send(EngineEvent::PeerLeave { peer_id: peer_id.to_string() });
}

// vim: ts=4

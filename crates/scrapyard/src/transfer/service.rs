//! File-transfer state machines.
//!
//! Responder: answer `file-list-request` from the local store, stream
//! requested files as chunked base64. Requester: `import_site` drives the
//! list/request cycle with deadlines and hands completed blobs to the
//! store. Peer departure cancels everything outstanding for that peer.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};

use scrapyard_types::content_store::{ContentStore, FileMeta};

use crate::peer::ChannelSender;
use crate::prelude::*;

use super::{TransferMessage, CHUNK_SIZE, FILE_LIST_TIMEOUT, FILE_TIMEOUT};

/// Byte-level progress of one incoming file, for UI subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
	pub peer_id: String,
	pub site_id: String,
	pub path: String,
	pub received: u64,
	pub expected: u64,
	pub done: bool,
}

/// Accumulates one incoming file between `file-start` and `file-end`.
struct IncomingTransfer {
	content_type: String,
	expected_size: u64,
	chunks: Vec<Vec<u8>>,
	received: u64,
}

type PeerSite = (String, String);
type PeerSitePath = (String, String, String);

pub struct FileTransfer {
	content: Arc<dyn ContentStore>,
	sender: RwLock<Option<Arc<dyn ChannelSender>>>,
	pending_lists: Mutex<HashMap<PeerSite, oneshot::Sender<Vec<FileMeta>>>>,
	pending_files: Mutex<HashMap<PeerSitePath, oneshot::Sender<SyResult<()>>>>,
	incoming: Mutex<HashMap<PeerSitePath, IncomingTransfer>>,
	progress: broadcast::Sender<TransferProgress>,
}

impl FileTransfer {
	pub fn new(content: Arc<dyn ContentStore>) -> Self {
		let (progress, _) = broadcast::channel(256);
		Self {
			content,
			sender: RwLock::new(None),
			pending_lists: Mutex::new(HashMap::new()),
			pending_files: Mutex::new(HashMap::new()),
			incoming: Mutex::new(HashMap::new()),
			progress,
		}
	}

	/// Attach the channel layer. Called on `connect`; cleared on
	/// `disconnect`.
	pub async fn set_sender(&self, sender: Arc<dyn ChannelSender>) {
		*self.sender.write().await = Some(sender);
	}

	pub async fn clear_sender(&self) {
		*self.sender.write().await = None;
	}

	/// Byte-level progress events. Receivers unsubscribe by drop.
	pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
		self.progress.subscribe()
	}

	/// Requests still waiting for an answer (diagnostic).
	pub async fn outstanding_requests(&self) -> usize {
		self.pending_lists.lock().await.len() + self.pending_files.lock().await.len()
	}

	/// Partially received files currently buffered (diagnostic).
	pub async fn active_transfers(&self) -> usize {
		self.incoming.lock().await.len()
	}

	/// Fetch every file of `site_id` from `peer_id` into the local store.
	/// `progress` is invoked with (completed, total, path) when each file
	/// starts and when it completes. Returns the number of files fetched.
	pub async fn import_site(
		&self,
		peer_id: &str,
		site_id: &str,
		mut progress: impl FnMut(usize, usize, &str) + Send,
	) -> SyResult<usize> {
		let sender = self.sender.read().await.clone().ok_or(Error::NotInitialized)?;

		// Discover the file set.
		let (tx, rx) = oneshot::channel();
		let list_key = (peer_id.to_string(), site_id.to_string());
		self.pending_lists.lock().await.insert(list_key.clone(), tx);
		let request = TransferMessage::FileListRequest { site_id: site_id.to_string() };
		if let Err(err) = sender.send(peer_id, &request.envelope()?).await {
			self.pending_lists.lock().await.remove(&list_key);
			return Err(err);
		}

		let files = match tokio::time::timeout(FILE_LIST_TIMEOUT, rx).await {
			Ok(Ok(files)) => files,
			Ok(Err(_)) => return Err(Error::PeerGone),
			Err(_) => {
				self.pending_lists.lock().await.remove(&list_key);
				warn!("file list for {} from {} timed out", site_id, peer_id);
				return Err(Error::Timeout);
			}
		};

		let total = files.len();
		let mut completed = 0;
		for file in &files {
			progress(completed, total, &file.path);

			let (tx, rx) = oneshot::channel();
			let file_key =
				(peer_id.to_string(), site_id.to_string(), file.path.clone());
			self.pending_files.lock().await.insert(file_key.clone(), tx);
			let request = TransferMessage::FileRequest {
				site_id: site_id.to_string(),
				path: file.path.clone(),
			};
			if let Err(err) = sender.send(peer_id, &request.envelope()?).await {
				self.release_file(&file_key).await;
				return Err(err);
			}

			match tokio::time::timeout(FILE_TIMEOUT, rx).await {
				Ok(Ok(Ok(()))) => {
					completed += 1;
					progress(completed, total, &file.path);
				}
				Ok(Ok(Err(err))) => {
					self.release_file(&file_key).await;
					return Err(err);
				}
				Ok(Err(_)) => {
					self.release_file(&file_key).await;
					return Err(Error::PeerGone);
				}
				Err(_) => {
					self.release_file(&file_key).await;
					warn!("file {} from {} timed out", file.path, peer_id);
					return Err(Error::Timeout);
				}
			}
		}
		info!("imported site {} from {} ({} files)", site_id, peer_id, completed);
		Ok(completed)
	}

	/// Drop all state for a departed peer and fail its outstanding
	/// requests with `PeerGone`.
	pub async fn peer_gone(&self, peer_id: &str) {
		self.pending_lists.lock().await.retain(|(peer, _), _| peer != peer_id);
		{
			let mut pending = self.pending_files.lock().await;
			let keys: Vec<PeerSitePath> =
				pending.keys().filter(|(peer, _, _)| peer == peer_id).cloned().collect();
			for key in keys {
				if let Some(tx) = pending.remove(&key) {
					let _ = tx.send(Err(Error::PeerGone));
				}
			}
		}
		self.incoming.lock().await.retain(|(peer, _, _), _| peer != peer_id);
	}

	/// Dispatch one inbound `custom`/`file-transfer` payload.
	pub async fn handle_message(&self, peer_id: &str, data: Value) {
		let message = match TransferMessage::parse(data) {
			Ok(message) => message,
			Err(err) => {
				warn!("bad transfer message from {}: {}", peer_id, err);
				return;
			}
		};

		match message {
			TransferMessage::FileListRequest { site_id } => {
				self.answer_file_list(peer_id, &site_id).await;
			}
			TransferMessage::FileRequest { site_id, path } => {
				// Streaming runs detached so one big file cannot stall the
				// engine's event loop.
				let Some(sender) = self.sender.read().await.clone() else { return };
				let content = self.content.clone();
				let peer = peer_id.to_string();
				tokio::spawn(async move {
					stream_file(content, sender, &peer, &site_id, &path).await;
				});
			}
			TransferMessage::FileList { site_id, files } => {
				let key = (peer_id.to_string(), site_id);
				if let Some(tx) = self.pending_lists.lock().await.remove(&key) {
					let _ = tx.send(files);
				} else {
					debug!("unsolicited file list from {}", peer_id);
				}
			}
			TransferMessage::FileStart { site_id, path, content_type, size } => {
				let key = (peer_id.to_string(), site_id, path);
				self.incoming.lock().await.insert(
					key,
					IncomingTransfer {
						content_type,
						expected_size: size,
						chunks: Vec::new(),
						received: 0,
					},
				);
			}
			TransferMessage::FileChunk { site_id, path, data } => {
				self.append_chunk(peer_id, site_id, path, &data).await;
			}
			TransferMessage::FileEnd { site_id, path } => {
				self.finish_file(peer_id, site_id, path).await;
			}
		}
	}

	async fn answer_file_list(&self, peer_id: &str, site_id: &str) {
		let Some(sender) = self.sender.read().await.clone() else { return };
		let files = match self.content.list(site_id).await {
			Ok(files) => files,
			Err(err) => {
				warn!("file list for {} failed: {}", site_id, err);
				return;
			}
		};
		let reply = TransferMessage::FileList { site_id: site_id.to_string(), files };
		match reply.envelope() {
			Ok(envelope) => {
				if let Err(err) = sender.send(peer_id, &envelope).await {
					warn!("file list reply to {} failed: {}", peer_id, err);
				}
			}
			Err(err) => warn!("file list reply unserializable: {}", err),
		}
	}

	async fn append_chunk(&self, peer_id: &str, site_id: String, path: String, data: &str) {
		let bytes = match STANDARD.decode(data) {
			Ok(bytes) => bytes,
			Err(err) => {
				warn!("undecodable chunk for {}/{} from {}: {}", site_id, path, peer_id, err);
				return;
			}
		};

		let key = (peer_id.to_string(), site_id, path);
		let mut incoming = self.incoming.lock().await;
		let Some(transfer) = incoming.get_mut(&key) else {
			debug!("chunk without transfer for {}/{}", key.1, key.2);
			return;
		};
		transfer.received += bytes.len() as u64;
		transfer.chunks.push(bytes);

		let _ = self.progress.send(TransferProgress {
			peer_id: key.0,
			site_id: key.1,
			path: key.2,
			received: transfer.received,
			expected: transfer.expected_size,
			done: false,
		});
	}

	async fn finish_file(&self, peer_id: &str, site_id: String, path: String) {
		let key = (peer_id.to_string(), site_id, path);
		let Some(transfer) = self.incoming.lock().await.remove(&key) else {
			debug!("file-end without transfer for {}/{}", key.1, key.2);
			return;
		};

		let data: Vec<u8> = transfer.chunks.concat();
		let result = self
			.content
			.put(&key.1, &key.2, &data, &transfer.content_type)
			.await;

		let outcome = match result {
			Ok(()) => {
				let _ = self.progress.send(TransferProgress {
					peer_id: key.0.clone(),
					site_id: key.1.clone(),
					path: key.2.clone(),
					received: transfer.received,
					expected: transfer.expected_size,
					done: true,
				});
				Ok(())
			}
			Err(err) => {
				warn!("storing {}/{} failed: {}", key.1, key.2, err);
				Err(err)
			}
		};

		if let Some(tx) = self.pending_files.lock().await.remove(&key) {
			let _ = tx.send(outcome);
		}
	}

	async fn release_file(&self, key: &PeerSitePath) {
		self.pending_files.lock().await.remove(key);
		self.incoming.lock().await.remove(key);
	}
}

/// Responder side of one file: start, 64 KiB base64 chunks under
/// back-pressure, end. Unknown files are dropped silently (logged).
async fn stream_file(
	content: Arc<dyn ContentStore>,
	sender: Arc<dyn ChannelSender>,
	peer_id: &str,
	site_id: &str,
	path: &str,
) {
	let record = match content.get(site_id, path).await {
		Ok(Some(record)) => record,
		Ok(None) => {
			warn!("requested unknown file {}/{}", site_id, path);
			return;
		}
		Err(err) => {
			warn!("reading {}/{} failed: {}", site_id, path, err);
			return;
		}
	};

	let result: SyResult<()> = async {
		let start = TransferMessage::FileStart {
			site_id: site_id.to_string(),
			path: path.to_string(),
			content_type: record.content_type.clone(),
			size: record.size,
		};
		sender.send(peer_id, &start.envelope()?).await?;

		for chunk in record.data.chunks(CHUNK_SIZE) {
			let msg = TransferMessage::FileChunk {
				site_id: site_id.to_string(),
				path: path.to_string(),
				data: STANDARD.encode(chunk),
			};
			sender.send_bulk(peer_id, &msg.envelope()?).await?;
		}

		let end = TransferMessage::FileEnd {
			site_id: site_id.to_string(),
			path: path.to_string(),
		};
		sender.send(peer_id, &end.envelope()?).await?;
		Ok(())
	}
	.await;

	match result {
		Ok(()) => debug!("streamed {}/{} to {}", site_id, path, peer_id),
		Err(err) => warn!("streaming {}/{} to {} failed: {}", site_id, path, peer_id, err),
	}
}

// vim: ts=4

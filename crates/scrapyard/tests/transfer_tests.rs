//! File-transfer protocol tests, driven through in-process channel stubs:
//! responder framing, full import round-trips, deadlines, and peer-gone
//! cancellation.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

use scrapyard::peer::{ChannelMessage, ChannelSender};
use scrapyard::transfer::{FileTransfer, TransferMessage, CHANNEL_TAG, CHUNK_SIZE};
use scrapyard_blob_adapter_fs::ContentStoreFs;
use scrapyard_types::content_store::ContentStore;
use scrapyard_types::error::{Error, SyResult};

async fn create_transfer(dir: &TempDir) -> (Arc<FileTransfer>, Arc<ContentStoreFs>) {
	let content = Arc::new(ContentStoreFs::new(dir.path()).await.expect("content store"));
	let transfer = Arc::new(FileTransfer::new(content.clone()));
	(transfer, content)
}

/// Captures every message instead of delivering it.
struct CaptureSender {
	sent: Arc<Mutex<Vec<TransferMessage>>>,
}

#[async_trait]
impl ChannelSender for CaptureSender {
	async fn send(&self, _peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		if let ChannelMessage::Custom { channel, data } = message {
			assert_eq!(channel, CHANNEL_TAG);
			let parsed = TransferMessage::parse(data.clone()).expect("well-formed message");
			self.sent.lock().await.push(parsed);
		}
		Ok(())
	}

	async fn send_bulk(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		self.send(peer_id, message).await
	}
}

/// Swallows everything; for deadline tests.
struct NullSender;

#[async_trait]
impl ChannelSender for NullSender {
	async fn send(&self, _peer_id: &str, _message: &ChannelMessage) -> SyResult<()> {
		Ok(())
	}
	async fn send_bulk(&self, _peer_id: &str, _message: &ChannelMessage) -> SyResult<()> {
		Ok(())
	}
}

/// Ordered in-process delivery into a remote `FileTransfer`, standing in
/// for a data channel.
struct QueueSender {
	tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl ChannelSender for QueueSender {
	async fn send(&self, _peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		if let ChannelMessage::Custom { data, .. } = message {
			self.tx.send(data.clone()).map_err(|_| Error::PeerGone)?;
		}
		Ok(())
	}
	async fn send_bulk(&self, peer_id: &str, message: &ChannelMessage) -> SyResult<()> {
		self.send(peer_id, message).await
	}
}

/// Wire `from`'s outbound messages into `target.handle_message`, in order.
fn pipe(target: Arc<FileTransfer>, from: &str) -> Arc<QueueSender> {
	let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
	let from = from.to_string();
	tokio::spawn(async move {
		while let Some(data) = rx.recv().await {
			target.handle_message(&from, data).await;
		}
	});
	Arc::new(QueueSender { tx })
}

#[tokio::test]
async fn responder_answers_file_list_in_path_order() {
	let dir = TempDir::new().expect("tempdir");
	let (transfer, content) = create_transfer(&dir).await;
	content.put("s1", "index.html", b"home", "text/html").await.expect("put");
	content.put("s1", "assets/app.js", b"js", "text/javascript").await.expect("put");

	let sent = Arc::new(Mutex::new(Vec::new()));
	transfer.set_sender(Arc::new(CaptureSender { sent: sent.clone() })).await;

	let request = serde_json::json!({ "type": "file-list-request", "siteId": "s1" });
	transfer.handle_message("peer-b", request).await;

	let sent = sent.lock().await;
	assert_eq!(sent.len(), 1);
	let TransferMessage::FileList { site_id, files } = &sent[0] else {
		panic!("expected file list, got {:?}", sent[0]);
	};
	assert_eq!(site_id, "s1");
	let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
	assert_eq!(paths, vec!["assets/app.js", "index.html"]);
}

#[tokio::test]
async fn responder_streams_bounded_base64_chunks() {
	let dir = TempDir::new().expect("tempdir");
	let (transfer, content) = create_transfer(&dir).await;
	let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
	content.put("s1", "big.bin", &payload, "application/octet-stream").await.expect("put");

	let sent = Arc::new(Mutex::new(Vec::new()));
	transfer.set_sender(Arc::new(CaptureSender { sent: sent.clone() })).await;

	let request =
		serde_json::json!({ "type": "file-request", "siteId": "s1", "path": "big.bin" });
	transfer.handle_message("peer-b", request).await;

	// Streaming runs detached; wait for the end marker.
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		{
			let sent = sent.lock().await;
			if sent.iter().any(|m| matches!(m, TransferMessage::FileEnd { .. })) {
				break;
			}
		}
		assert!(tokio::time::Instant::now() < deadline, "stream never finished");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let sent = sent.lock().await;
	let TransferMessage::FileStart { content_type, size, .. } = &sent[0] else {
		panic!("expected file-start first, got {:?}", sent[0]);
	};
	assert_eq!(content_type, "application/octet-stream");
	assert_eq!(*size, 150_000);

	let mut rebuilt = Vec::new();
	for message in &sent[1..sent.len() - 1] {
		let TransferMessage::FileChunk { data, .. } = message else {
			panic!("expected chunk, got {:?}", message);
		};
		let bytes = STANDARD.decode(data).expect("chunk is base64");
		assert!(bytes.len() <= CHUNK_SIZE, "chunk exceeds 64 KiB");
		rebuilt.extend_from_slice(&bytes);
	}
	assert_eq!(rebuilt, payload, "chunk concatenation must equal the source");
	assert!(matches!(sent[sent.len() - 1], TransferMessage::FileEnd { .. }));
}

#[tokio::test]
async fn responder_drops_requests_for_unknown_files() {
	let dir = TempDir::new().expect("tempdir");
	let (transfer, _content) = create_transfer(&dir).await;
	let sent = Arc::new(Mutex::new(Vec::new()));
	transfer.set_sender(Arc::new(CaptureSender { sent: sent.clone() })).await;

	let request =
		serde_json::json!({ "type": "file-request", "siteId": "s1", "path": "ghost.bin" });
	transfer.handle_message("peer-b", request).await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert!(sent.lock().await.is_empty(), "unknown files are silently dropped");
}

#[tokio::test]
async fn import_site_copies_every_file() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let (transfer_a, content_a) = create_transfer(&dir_a).await;
	let (transfer_b, content_b) = create_transfer(&dir_b).await;

	let big: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
	content_a.put("s1", "index.html", b"<h1>hi</h1>", "text/html").await.expect("put");
	content_a.put("s1", "assets/big.bin", &big, "application/octet-stream").await.expect("put");
	content_a.put("s1", "assets/app.js", b"console.log(1)", "text/javascript").await.expect("put");

	// A and B talk through ordered in-process pipes.
	transfer_a.set_sender(pipe(transfer_b.clone(), "peer-a")).await;
	transfer_b.set_sender(pipe(transfer_a.clone(), "peer-b")).await;

	let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
	let progress_log = progress.clone();
	let fetched = transfer_b
		.import_site("peer-a", "s1", move |completed, total, path| {
			progress_log.lock().expect("lock").push((completed, total, path.to_string()));
		})
		.await
		.expect("import");
	assert_eq!(fetched, 3);

	// Every blob matches the sender's copy.
	let files_a = content_a.list("s1").await.expect("list a");
	let files_b = content_b.list("s1").await.expect("list b");
	assert_eq!(files_a, files_b);
	for file in &files_a {
		let a = content_a.get("s1", &file.path).await.expect("get").expect("record");
		let b = content_b.get("s1", &file.path).await.expect("get").expect("record");
		assert_eq!(a.data, b.data, "bytes for {} must match", file.path);
		assert_eq!(a.content_type, b.content_type);
	}

	let progress = progress.lock().expect("lock");
	assert_eq!(progress.first().map(|p| (p.0, p.1)), Some((0, 3)));
	assert_eq!(progress.last().map(|p| (p.0, p.1)), Some((3, 3)));

	assert_eq!(transfer_b.outstanding_requests().await, 0);
	assert_eq!(transfer_b.active_transfers().await, 0);
}

#[tokio::test(start_paused = true)]
async fn import_times_out_when_nobody_answers() {
	let dir = TempDir::new().expect("tempdir");
	let (transfer, _content) = create_transfer(&dir).await;
	transfer.set_sender(Arc::new(NullSender)).await;

	let result = transfer.import_site("peer-a", "s1", |_, _, _| {}).await;
	assert!(matches!(result, Err(Error::Timeout)));
	assert_eq!(transfer.outstanding_requests().await, 0, "timeout must release pending state");
}

#[tokio::test]
async fn peer_departure_cancels_everything() {
	let dir = TempDir::new().expect("tempdir");
	let (transfer, _content) = create_transfer(&dir).await;
	transfer.set_sender(Arc::new(NullSender)).await;

	// A transfer already in flight from the departing peer...
	transfer
		.handle_message(
			"peer-a",
			serde_json::json!({
				"type": "file-start",
				"siteId": "s1",
				"path": "a.bin",
				"contentType": "application/octet-stream",
				"size": 10
			}),
		)
		.await;
	transfer
		.handle_message(
			"peer-a",
			serde_json::json!({
				"type": "file-chunk",
				"siteId": "s1",
				"path": "a.bin",
				"data": STANDARD.encode(b"12345")
			}),
		)
		.await;
	assert_eq!(transfer.active_transfers().await, 1);

	// ...and an import waiting on the same peer.
	let importer = transfer.clone();
	let pending = tokio::spawn(async move {
		importer.import_site("peer-a", "s1", |_, _, _| {}).await
	});
	tokio::time::sleep(Duration::from_millis(50)).await;

	transfer.peer_gone("peer-a").await;

	let result = pending.await.expect("join");
	assert!(matches!(result, Err(Error::PeerGone)));
	assert_eq!(transfer.active_transfers().await, 0);
	assert_eq!(transfer.outstanding_requests().await, 0);
}

//! Reconnecting WebSocket signaling client.
//!
//! The socket task owns the connection: outgoing messages arrive over an
//! mpsc queue, inbound frames are parsed and forwarded as typed events.
//! On an unexpected close the task re-dials with exponential backoff
//! (1 s doubling, capped at 30 s, at most 10 attempts) and re-issues
//! `join` on every successful dial.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::prelude::*;

use super::{IncomingMessage, OutgoingMessage, SignalingEvent};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

fn reconnect_delay(attempt: u32) -> Duration {
	let factor = 1u32 << (attempt.saturating_sub(1)).min(6);
	(RECONNECT_BASE * factor).min(RECONNECT_MAX)
}

enum Command {
	Send(OutgoingMessage),
	Close,
}

/// Handle to the signaling connection. Cloneable; the socket task runs
/// until `close` is called or reconnect attempts are exhausted.
#[derive(Clone)]
pub struct SignalingClient {
	cmd_tx: mpsc::UnboundedSender<Command>,
	should_reconnect: Arc<AtomicBool>,
}

impl SignalingClient {
	/// Dial `{url}?token={token}` and join the room as `peer_id`. The
	/// initial dial failing surfaces as `TransportUnavailable`; later
	/// drops go through the reconnect machine instead.
	pub async fn connect(
		url: &str,
		token: &str,
		peer_id: &str,
		events: mpsc::UnboundedSender<SignalingEvent>,
	) -> SyResult<Self> {
		let mut ws_url = url::Url::parse(url)
			.map_err(|err| Error::TransportUnavailable(format!("bad signaling url: {err}")))?;
		ws_url.query_pairs_mut().append_pair("token", token);
		let ws_url = ws_url.to_string();

		let (socket, _) = tokio_tungstenite::connect_async(&ws_url)
			.await
			.map_err(|err| Error::TransportUnavailable(err.to_string()))?;
		info!("signaling connected: {}", url);

		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let should_reconnect = Arc::new(AtomicBool::new(true));

		tokio::spawn(run(
			ws_url,
			peer_id.to_string(),
			socket,
			cmd_rx,
			events,
			should_reconnect.clone(),
		));

		Ok(Self { cmd_tx, should_reconnect })
	}

	/// Queue a message for the socket task.
	pub fn send(&self, message: OutgoingMessage) -> SyResult<()> {
		self.cmd_tx
			.send(Command::Send(message))
			.map_err(|_| Error::TransportUnavailable("signaling task gone".into()))
	}

	/// Close the connection and suppress reconnection.
	pub fn close(&self) {
		self.should_reconnect.store(false, Ordering::SeqCst);
		let _ = self.cmd_tx.send(Command::Close);
	}
}

type WsStream =
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(
	ws_url: String,
	peer_id: String,
	socket: WsStream,
	mut cmd_rx: mpsc::UnboundedReceiver<Command>,
	events: mpsc::UnboundedSender<SignalingEvent>,
	should_reconnect: Arc<AtomicBool>,
) {
	let mut socket = Some(socket);

	loop {
		let Some(ws) = socket.take() else { return };
		let (mut sink, mut stream) = ws.split();

		// (Re)announce ourselves to the room.
		let join = OutgoingMessage::Join { peer_id: peer_id.clone() };
		if let Ok(text) = serde_json::to_string(&join) {
			if let Err(err) = sink.send(Message::Text(text.into())).await {
				warn!("signaling join failed: {}", err);
			}
		}

		// Session loop until the socket drops or the client closes.
		let mut closed = false;
		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(Command::Send(msg)) => {
						let text = match serde_json::to_string(&msg) {
							Ok(text) => text,
							Err(err) => {
								warn!("unserializable signaling message: {}", err);
								continue;
							}
						};
						if let Err(err) = sink.send(Message::Text(text.into())).await {
							warn!("signaling send failed: {}", err);
							break;
						}
					}
					Some(Command::Close) | None => {
						let _ = sink.send(Message::Close(None)).await;
						closed = true;
						break;
					}
				},
				frame = stream.next() => match frame {
					Some(Ok(Message::Text(text))) => {
						match serde_json::from_str::<IncomingMessage>(&text) {
							Ok(msg) => {
								if events.send(SignalingEvent::Message(msg)).is_err() {
									closed = true;
									break;
								}
							}
							Err(err) => debug!("ignoring signaling frame: {}", err),
						}
					}
					Some(Ok(Message::Close(_))) | None => {
						debug!("signaling socket closed");
						break;
					}
					Some(Ok(_)) => {} // ping/pong/binary
					Some(Err(err)) => {
						warn!("signaling socket error: {}", err);
						break;
					}
				},
			}
		}

		if closed || !should_reconnect.load(Ordering::SeqCst) {
			if !closed {
				let _ = events.send(SignalingEvent::Disconnected);
			}
			return;
		}

		// Reconnect with backoff.
		let mut attempt = 0;
		loop {
			attempt += 1;
			if attempt > MAX_RECONNECT_ATTEMPTS {
				warn!("signaling reconnect attempts exhausted");
				let _ = events.send(SignalingEvent::Disconnected);
				return;
			}
			let _ = events.send(SignalingEvent::Reconnecting { attempt });
			tokio::time::sleep(reconnect_delay(attempt)).await;
			if !should_reconnect.load(Ordering::SeqCst) {
				return;
			}
			match tokio_tungstenite::connect_async(&ws_url).await {
				Ok((ws, _)) => {
					info!("signaling reconnected (attempt {})", attempt);
					let _ = events.send(SignalingEvent::Reconnected);
					socket = Some(ws);
					break;
				}
				Err(err) => warn!("signaling reconnect attempt {} failed: {}", attempt, err),
			}
		}
	}
}


// vim: ts=4

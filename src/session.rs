//! Per-connection session state machine.
//!
//! Each accepted socket gets one task walking the states
//!
//! ```text
//! Connecting → Validating → Accepted → Streaming → Closing → Closed
//!                  │             │
//!                  │             └── Rejected(Capacity)  close 4003
//!                  └──────────────── Rejected(NotFound)  close 4004
//! ```
//!
//! The room id comes from the `/ws/{room_id}` request path during the
//! WebSocket handshake. Validation and every other durable-storage call go
//! through the [`StorageGateway`] so the I/O scheduler never blocks. Both
//! graceful closes and transport errors converge on one cleanup path that
//! runs exactly once per connection.

use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::BroadcastDispatcher;
use crate::protocol::{ClientMessage, CloseReason, ProtocolError, ServerMessage};
use crate::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryError, RegisterOutcome,
};
use crate::storage::{StorageGateway, UpdateOutcome};

/// Shared dependencies handed to every session task.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: BroadcastDispatcher,
    pub storage: StorageGateway,
}

/// Errors that terminate a session's outbound side.
#[derive(Debug)]
pub enum SessionError {
    Protocol(ProtocolError),
    Delivery(DeliveryError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Delivery(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DeliveryError> for SessionError {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}

/// One registered connection's coordinator.
///
/// Owns the session's storage handle (a [`StorageGateway`] clone) for its
/// whole lifetime; every exit path drops it.
pub struct SessionCoordinator {
    room_id: String,
    conn: ConnectionHandle,
    registry: Arc<ConnectionRegistry>,
    dispatcher: BroadcastDispatcher,
    storage: StorageGateway,
}

impl SessionCoordinator {
    pub fn new(room_id: String, conn: ConnectionHandle, ctx: &SessionContext) -> Self {
        Self {
            room_id,
            conn,
            registry: ctx.registry.clone(),
            dispatcher: ctx.dispatcher.clone(),
            storage: ctx.storage.clone(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Streaming entry action: hand the client the current buffer.
    pub fn send_initial_state(&self, code: String) -> Result<(), SessionError> {
        let frame = ServerMessage::InitialState { code }.to_frame()?;
        self.conn.deliver(frame)?;
        Ok(())
    }

    /// Process one inbound text frame.
    ///
    /// A frame that fails to parse, or a `code_change` without a code, is
    /// logged and discarded — a single malformed frame never drops the
    /// connection. Accepted edits are persisted first and broadcast only
    /// after the write is confirmed, so peers never see a value that was
    /// never durably committed.
    pub async fn handle_frame(&self, raw: &str) {
        let message = match ClientMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "Discarding malformed frame from {} in room {}: {e}",
                    self.conn.id(),
                    self.room_id
                );
                return;
            }
        };

        match message {
            ClientMessage::CodeChange { code: Some(code) } => {
                match self.storage.apply_update(&self.room_id, code.clone()).await {
                    Ok(UpdateOutcome::Updated) => {
                        let update = ServerMessage::CodeUpdate { code };
                        match self
                            .dispatcher
                            .broadcast(&self.room_id, &update, self.conn.id())
                            .await
                        {
                            Ok(delivered) => log::debug!(
                                "Broadcast update to {delivered} peers in room {}",
                                self.room_id
                            ),
                            Err(e) => log::error!(
                                "Broadcast failed in room {}: {e}",
                                self.room_id
                            ),
                        }
                    }
                    Ok(UpdateOutcome::NotFound) => log::warn!(
                        "Update for unknown room {}; skipping broadcast",
                        self.room_id
                    ),
                    Err(e) => log::error!(
                        "Storage update failed for room {}: {e}; skipping broadcast",
                        self.room_id
                    ),
                }
            }
            ClientMessage::CodeChange { code: None } => log::warn!(
                "Discarding code_change without code from {} in room {}",
                self.conn.id(),
                self.room_id
            ),
            ClientMessage::Unknown => {
                log::debug!("Ignoring unrecognized frame type in room {}", self.room_id)
            }
        }
    }

    /// Answer a transport-level ping on this connection's outbound lane.
    fn pong(&self, payload: tokio_tungstenite::tungstenite::Bytes) {
        let _ = self.conn.deliver(Message::Pong(payload));
    }

    /// Single cleanup path for every termination reason.
    pub async fn finish(&self) {
        self.registry.unregister(&self.room_id, self.conn.id()).await;
    }
}

/// Drive one socket through the full session lifecycle.
pub async fn run_session(
    stream: TcpStream,
    ctx: SessionContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Connecting: capture the room id while the handshake is still open;
    // a path that is not /ws/{room_id} is refused before upgrade.
    let mut requested: Option<String> = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match room_id_from_path(req.uri().path()) {
            Some(room_id) => {
                requested = Some(room_id);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("expected path /ws/{room_id}".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    })
    .await?;
    let room_id = requested.ok_or("handshake completed without a room id")?;

    // Validating
    let record = match ctx.storage.load_room(&room_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            log::info!("Rejecting connection to unknown room {room_id}");
            ws.close(Some(CloseReason::RoomNotFound.frame())).await?;
            return Ok(());
        }
        Err(e) => {
            log::error!("Validation load failed for room {room_id}: {e}");
            ws.close(None).await.ok();
            return Err(e.into());
        }
    };

    // Accepted-attempt
    let (conn, mut outbound_rx) = ConnectionHandle::new();
    if ctx.registry.register(&room_id, conn.clone()).await == RegisterOutcome::RejectedCapacity {
        ws.close(Some(CloseReason::RoomFull.frame())).await?;
        return Ok(());
    }

    let coordinator = SessionCoordinator::new(room_id.clone(), conn, &ctx);
    let conn_id = coordinator.connection_id();
    log::info!("Connection {conn_id} streaming in room {room_id}");

    // Streaming: one writer task drains the outbound lane in FIFO order.
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Err(e) = coordinator.send_initial_state(record.code) {
        log::error!("Initial state send failed for {conn_id}: {e}");
    } else {
        stream_frames(&coordinator, &mut ws_receiver).await;
    }

    // Closing/Closed: graceful close and transport error both land here.
    coordinator.finish().await;
    drop(coordinator);
    let _ = writer.await;
    log::info!("Connection {conn_id} closed in room {room_id}");
    Ok(())
}

/// Await inbound frames until the transport closes or errors.
async fn stream_frames(
    coordinator: &SessionCoordinator,
    ws_receiver: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => coordinator.handle_frame(text.as_str()).await,
            Some(Ok(Message::Ping(payload))) => coordinator.pong(payload),
            Some(Ok(Message::Close(_))) | None => {
                log::debug!("Connection {} closed by peer", coordinator.connection_id());
                break;
            }
            Some(Ok(_)) => {} // binary / pong frames are ignored
            Some(Err(e)) => {
                log::error!(
                    "Transport error on connection {}: {e}",
                    coordinator.connection_id()
                );
                break;
            }
        }
    }
}

/// Extract the room id from a `/ws/{room_id}` request path.
fn room_id_from_path(path: &str) -> Option<String> {
    let room_id = path.strip_prefix("/ws/")?;
    if room_id.is_empty() || room_id.contains('/') {
        return None;
    }
    Some(room_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RoomStore, StoreConfig};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_context(capacity: usize) -> (tempfile::TempDir, SessionContext) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let registry = Arc::new(ConnectionRegistry::new(capacity));
        let ctx = SessionContext {
            dispatcher: BroadcastDispatcher::new(registry.clone()),
            storage: StorageGateway::new(store, 2),
            registry,
        };
        (dir, ctx)
    }

    async fn join(
        ctx: &SessionContext,
        room_id: &str,
    ) -> (SessionCoordinator, UnboundedReceiver<Message>) {
        let (conn, rx) = ConnectionHandle::new();
        assert_eq!(
            ctx.registry.register(room_id, conn.clone()).await,
            RegisterOutcome::Accepted
        );
        (
            SessionCoordinator::new(room_id.to_string(), conn, ctx),
            rx,
        )
    }

    fn frame_json(frame: Message) -> serde_json::Value {
        let text = frame.into_text().expect("text frame expected");
        serde_json::from_str(text.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_code_change_persists_and_reaches_peer() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, _rx_alice) = join(&ctx, &room_id).await;
        let (_bob, mut rx_bob) = join(&ctx, &room_id).await;

        alice
            .handle_frame(r#"{"type":"code_change","code":"x=1"}"#)
            .await;

        let value = frame_json(rx_bob.recv().await.unwrap());
        assert_eq!(value["type"], "code_update");
        assert_eq!(value["code"], "x=1");

        let record = ctx.storage.load_room(&room_id).await.unwrap().unwrap();
        assert_eq!(record.code, "x=1");
    }

    #[tokio::test]
    async fn test_editor_does_not_hear_its_own_edit() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, mut rx_alice) = join(&ctx, &room_id).await;
        alice
            .handle_frame(r#"{"type":"code_change","code":"solo"}"#)
            .await;
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, _rx_alice) = join(&ctx, &room_id).await;
        let (_bob, mut rx_bob) = join(&ctx, &room_id).await;

        alice.handle_frame("this is not json").await;
        assert!(rx_bob.try_recv().is_err(), "no broadcast for garbage");

        // The connection survives and later frames still work.
        alice
            .handle_frame(r#"{"type":"code_change","code":"after"}"#)
            .await;
        let value = frame_json(rx_bob.recv().await.unwrap());
        assert_eq!(value["code"], "after");
    }

    #[tokio::test]
    async fn test_code_change_without_code_is_discarded() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, _rx_alice) = join(&ctx, &room_id).await;
        let (_bob, mut rx_bob) = join(&ctx, &room_id).await;

        alice.handle_frame(r#"{"type":"code_change"}"#).await;
        assert!(rx_bob.try_recv().is_err());
        let record = ctx.storage.load_room(&room_id).await.unwrap().unwrap();
        assert_eq!(record.revision, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, _rx_alice) = join(&ctx, &room_id).await;
        let (_bob, mut rx_bob) = join(&ctx, &room_id).await;

        alice
            .handle_frame(r#"{"type":"cursor_move","line":3}"#)
            .await;
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_for_vanished_room_skips_broadcast() {
        let (_dir, ctx) = test_context(2);

        // Registered in the volatile registry, but no durable room exists.
        let (ghost, _rx) = join(&ctx, "deadbeef").await;
        let (_peer, mut rx_peer) = join(&ctx, "deadbeef").await;

        ghost
            .handle_frame(r#"{"type":"code_change","code":"lost"}"#)
            .await;
        assert!(rx_peer.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initial_state_carries_current_buffer() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, mut rx_alice) = join(&ctx, &room_id).await;
        let record = ctx.storage.load_room(&room_id).await.unwrap().unwrap();
        alice.send_initial_state(record.code).unwrap();

        let value = frame_json(rx_alice.recv().await.unwrap());
        assert_eq!(value["type"], "initial_state");
        assert_eq!(value["code"], crate::storage::DEFAULT_SEED);
    }

    #[tokio::test]
    async fn test_finish_unregisters_once_and_is_idempotent() {
        let (_dir, ctx) = test_context(2);
        let room_id = ctx.storage.create_room().await.unwrap();

        let (alice, _rx) = join(&ctx, &room_id).await;
        assert_eq!(ctx.registry.count(&room_id).await, 1);

        alice.finish().await;
        assert_eq!(ctx.registry.count(&room_id).await, 0);
        alice.finish().await;
        assert_eq!(ctx.registry.count(&room_id).await, 0);
    }

    #[test]
    fn test_room_id_from_path() {
        assert_eq!(room_id_from_path("/ws/abc123"), Some("abc123".to_string()));
        assert_eq!(room_id_from_path("/ws/"), None);
        assert_eq!(room_id_from_path("/ws/a/b"), None);
        assert_eq!(room_id_from_path("/rooms/abc"), None);
        assert_eq!(room_id_from_path("/"), None);
    }
}

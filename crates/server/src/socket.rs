use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{
            rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    response::{IntoResponse, Response},
};
use harmony_core::ChatId;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    chat::ChatError,
    chats::parse_chat_id,
    fanout::{ConnectionClosed, ConnectionId, LocalConnection, PubSubManager},
    session::AuthenticatedUser,
    AppState,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;

/// Hands fan-out payloads to the task that owns the socket.
///
/// Sending never waits. A viewer whose queue is full is reported closed, so
/// Layer 2 drops it and the bus listener moves on to the next message.
struct SocketConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
}

#[async_trait]
impl LocalConnection for SocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, payload: Arc<str>) -> Result<(), ConnectionClosed> {
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = self.id, "viewer queue full; dropping slow viewer");
                Err(ConnectionClosed(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionClosed(self.id)),
        }
    }
}

/// `GET /ws/{chat_id}`: live feed of a chat for one of its members.
/// Membership is checked before the upgrade request itself.
pub async fn chat_socket(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let chat_id = match authorize(&state, &user, &chat_id).await {
        Ok(chat_id) => chat_id,
        Err(err) => return err.into_response(),
    };
    match ws {
        Ok(ws) => {
            let fanout = Arc::clone(state.fanout());
            ws.on_upgrade(move |socket| run_socket(fanout, chat_id, user.user_id, socket))
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn authorize(
    state: &AppState,
    user: &AuthenticatedUser,
    raw_chat_id: &str,
) -> Result<ChatId, ChatError> {
    let chat_id = parse_chat_id(raw_chat_id)?;
    state.chat().ensure_member(&user.user_id, &chat_id).await?;
    Ok(chat_id)
}

async fn run_socket(
    fanout: Arc<PubSubManager>,
    chat_id: ChatId,
    user_id: String,
    mut socket: WebSocket,
) {
    let connections = fanout.local();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
    let id = connections.next_connection_id();
    connections.connect(chat_id, Arc::new(SocketConnection { id, tx }));

    if let Err(err) = fanout.subscribe_to_chat(chat_id).await {
        warn!(%chat_id, ?err, "failed to subscribe chat for viewer");
        connections.disconnect(chat_id, id);
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    info!(%chat_id, %user_id, connection_id = id, "viewer connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(payload) = outbound else { break };
                let frame = WsMessage::Text(payload.to_string().into());
                match timeout(SEND_TIMEOUT, socket.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%chat_id, connection_id = id, ?err, "websocket send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(%chat_id, connection_id = id, "websocket send timeout");
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%chat_id, connection_id = id, ?err, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    connections.disconnect(chat_id, id);
    if let Err(err) = fanout.unsubscribe_from_chat(chat_id).await {
        warn!(%chat_id, ?err, "failed to release chat subscription");
    }
    info!(%chat_id, %user_id, connection_id = id, "viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::LocalConnectionManager;
    use harmony_core::IdGenerator;

    #[tokio::test]
    async fn socket_connection_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let connection = SocketConnection { id: 7, tx };
        connection.send_text(Arc::from("first")).await.unwrap();
        drop(rx);
        let err = connection.send_text(Arc::from("second")).await.unwrap_err();
        assert_eq!(err.0, 7);
    }

    #[tokio::test]
    async fn stalled_viewer_is_dropped_without_holding_up_the_others() {
        let manager = LocalConnectionManager::new();
        let chat_id = IdGenerator::new().chat_id();
        let (stalled_tx, _stalled_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (healthy_tx, mut healthy_rx) = mpsc::channel(OUTBOUND_BUFFER * 2);
        manager.connect(chat_id, Arc::new(SocketConnection { id: 1, tx: stalled_tx }));
        manager.connect(chat_id, Arc::new(SocketConnection { id: 2, tx: healthy_tx }));

        let rounds = OUTBOUND_BUFFER + 1;
        let fanout = async {
            for n in 0..rounds {
                manager.broadcast_local(chat_id, &format!("m{n}")).await;
            }
        };
        timeout(Duration::from_secs(1), fanout)
            .await
            .expect("broadcast never waits on a full queue");

        assert_eq!(manager.connection_count(&chat_id), 1);
        let mut received = 0;
        while healthy_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, rounds);
    }
}

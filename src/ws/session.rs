use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hub::{ConnId, JoinOutcome, RoomHub};
use crate::config;
use crate::db::dbroom;
use crate::models::{
    AuthError, AuthErrorMessage, AuthSuccessMessage, ChatHistoryMessage, ChatSendMessage,
    ChatSyncMessage, ClientEvent, CodeBroadcastMessage, CodeChangeMessage, CodeStateMessage,
    CodeSyncMessage, CursorBroadcastMessage, CursorMoveMessage, CursorStateMessage,
    OnlineUsersMessage, RoomError, RoomErrorMessage, RoomJoinMessage, RoomLeaveMessage,
    RoomMembersMessage, ServerEvent, UserOfflineMessage, UserOnlineMessage,
};
use crate::services::auth_service::{self, Identity};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// WebSocket handler
///
/// The bearer credential is taken from the `token` query parameter, the
/// Authorization header or the auth_token cookie, and validated before the
/// upgrade completes. A connection that fails validation is sent the
/// specific reason and closed without ever reaching an event handler.
pub async fn websocket_handler(
    Query(query): Query<WsQuery>,
    State(hub): State<Arc<RoomHub>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    info!("New WebSocket connection attempt");
    let token = query
        .token
        .or_else(|| auth_service::token_from_headers(&headers));
    let auth = auth_service::authenticate(token);
    ws.on_upgrade(move |socket| handle_socket(socket, auth, hub))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, auth: Result<Identity, AuthError>, hub: Arc<RoomHub>) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: deliver the outcome, and close on failure before any room
    // event is processed.
    let identity = match auth {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Connection rejected during handshake: {}", e);
            let event = ServerEvent::AuthError(AuthErrorMessage {
                reason: e.reason().to_string(),
            });
            if let Ok(text) = serde_json::to_string(&event) {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    info!(
        "Connection {} authenticated as {} ({})",
        conn_id, identity.username, identity.user_id
    );

    let hello = ServerEvent::AuthSuccess(AuthSuccessMessage {
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
    });
    match serde_json::to_string(&hello) {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!("Failed to serialize handshake response: {}", e);
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.register(conn_id, identity.clone(), tx);

    // Forward the connection's outbound queue onto the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize event for {}: {}", conn_id, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Read and dispatch inbound events, one at a time in arrival order.
    let mut recv_task = tokio::spawn({
        let hub = hub.clone();
        let identity = identity.clone();
        async move {
            while let Some(result) = receiver.next().await {
                let msg = match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Transport error on connection {}: {}", conn_id, e);
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        let event: ClientEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("Unparseable event from connection {}: {}", conn_id, e);
                                continue;
                            }
                        };
                        handle_event(event, conn_id, &identity, &hub).await;
                    }
                    Message::Close(_) => break,
                    // Pings are answered by the transport layer
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => {
            // Writes are gone but the read loop may still be persisting the
            // connection's last event; let that write finish and discard the
            // reply. The reader observes the close shortly after.
            let _ = (&mut recv_task).await;
        }
    }

    // Same cleanup path as an explicit leave: registry removal first, then
    // the departure broadcast to whoever remains.
    if let Some(departure) = hub.unregister(conn_id) {
        hub.broadcast(
            &departure.room_id,
            ServerEvent::UserOffline(UserOfflineMessage {
                user_id: departure.user_id,
            }),
            None,
        );
    }
    info!("WebSocket connection {} terminated", conn_id);
}

/// Dispatch one inbound event. The match is exhaustive over the closed
/// event set; adding an event without a handler fails to compile.
async fn handle_event(event: ClientEvent, conn_id: ConnId, identity: &Identity, hub: &RoomHub) {
    match event {
        ClientEvent::RoomJoin(msg) => handle_room_join(msg, conn_id, identity, hub).await,
        ClientEvent::RoomLeave(msg) => handle_room_leave(msg, conn_id, hub),
        ClientEvent::CodeSync(msg) => handle_code_sync(msg, conn_id, hub).await,
        ClientEvent::CodeChange(msg) => handle_code_change(msg, conn_id, hub).await,
        ClientEvent::CursorMove(msg) => handle_cursor_move(msg, conn_id, identity, hub),
        ClientEvent::ChatSync(msg) => handle_chat_sync(msg, conn_id, hub).await,
        ClientEvent::ChatMessage(msg) => handle_chat_message(msg, conn_id, identity, hub).await,
    }
}

fn room_error(e: RoomError) -> ServerEvent {
    ServerEvent::RoomError(RoomErrorMessage {
        reason: e.reason().to_string(),
    })
}

// Room-scoped events other than ROOM_JOIN only make sense from a connection
// currently joined to that room.
fn ensure_in_room(conn_id: ConnId, room_id: &str, hub: &RoomHub) -> bool {
    if hub.current_room(conn_id).as_deref() == Some(room_id) {
        return true;
    }
    hub.send_to(conn_id, room_error(RoomError::NotInRoom));
    false
}

async fn handle_room_join(msg: RoomJoinMessage, conn_id: ConnId, identity: &Identity, hub: &RoomHub) {
    let Some(db) = dbroom::get_db() else {
        error!("Database not initialized, cannot join room {}", msg.room_id);
        return;
    };

    // Membership is looked up fresh on every join, so a revocation through
    // the room CRUD service takes effect on the next attempt.
    let room = match db.load_room(&msg.room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            hub.send_to(conn_id, room_error(RoomError::NotFound));
            return;
        }
        Err(e) => {
            error!("Failed to load room {}: {}", msg.room_id, e);
            return;
        }
    };
    if !room.is_member(&identity.user_id) {
        info!(
            "User {} denied entry to room {}: not a member",
            identity.user_id, msg.room_id
        );
        hub.send_to(conn_id, room_error(RoomError::NotAuthorized));
        return;
    }

    // Joining a different room while already in one behaves as a leave of
    // the old room followed by a join of the new one. A rejoin of the
    // current room only refreshes the requester's snapshots.
    let newly_joined = match hub.join_room(conn_id, &msg.room_id) {
        JoinOutcome::AlreadyJoined => false,
        JoinOutcome::Joined { departure } => {
            if let Some(departure) = departure {
                hub.broadcast(
                    &departure.room_id,
                    ServerEvent::UserOffline(UserOfflineMessage {
                        user_id: departure.user_id,
                    }),
                    None,
                );
            }
            true
        }
    };
    info!("User {} joined room {}", identity.user_id, msg.room_id);

    hub.send_to(
        conn_id,
        ServerEvent::OnlineUsers(OnlineUsersMessage {
            room_id: msg.room_id.clone(),
            users: hub.list_online(&msg.room_id),
        }),
    );
    hub.send_to(
        conn_id,
        ServerEvent::RoomMembers(RoomMembersMessage {
            room_id: msg.room_id.clone(),
            members: room.roster(),
        }),
    );

    match db.load_document(&msg.room_id).await {
        Ok(doc) => hub.send_to(
            conn_id,
            ServerEvent::CodeState(CodeStateMessage {
                content: doc.content,
                language: doc.language,
            }),
        ),
        Err(e) => error!("Failed to load document for room {}: {}", msg.room_id, e),
    }

    hub.send_to(
        conn_id,
        ServerEvent::CursorState(CursorStateMessage {
            positions: hub.cursor_snapshot(&msg.room_id),
        }),
    );

    let limit = config::get_config().chat_history_limit;
    match db.list_messages(&msg.room_id, limit).await {
        Ok(rows) => hub.send_to(
            conn_id,
            ServerEvent::ChatHistory(ChatHistoryMessage {
                room_id: msg.room_id.clone(),
                messages: rows.into_iter().map(Into::into).collect(),
            }),
        ),
        Err(e) => error!("Failed to load chat history for room {}: {}", msg.room_id, e),
    }

    // The room already sees this user on a rejoin; only announce new entries.
    if newly_joined {
        hub.broadcast(
            &msg.room_id,
            ServerEvent::UserOnline(UserOnlineMessage {
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
            }),
            Some(conn_id),
        );
    }
}

fn handle_room_leave(msg: RoomLeaveMessage, conn_id: ConnId, hub: &RoomHub) {
    debug!("Connection {} leaving room {}", conn_id, msg.room_id);
    if let Some(departure) = hub.leave_room(conn_id) {
        hub.broadcast(
            &departure.room_id,
            ServerEvent::UserOffline(UserOfflineMessage {
                user_id: departure.user_id,
            }),
            None,
        );
    }
}

async fn handle_code_sync(msg: CodeSyncMessage, conn_id: ConnId, hub: &RoomHub) {
    if !ensure_in_room(conn_id, &msg.room_id, hub) {
        return;
    }
    let Some(db) = dbroom::get_db() else {
        error!("Database not initialized, cannot sync room {}", msg.room_id);
        return;
    };
    match db.load_document(&msg.room_id).await {
        Ok(doc) => hub.send_to(
            conn_id,
            ServerEvent::CodeState(CodeStateMessage {
                content: doc.content,
                language: doc.language,
            }),
        ),
        Err(e) => error!("Failed to load document for room {}: {}", msg.room_id, e),
    }
}

async fn handle_code_change(msg: CodeChangeMessage, conn_id: ConnId, hub: &RoomHub) {
    if !ensure_in_room(conn_id, &msg.room_id, hub) {
        return;
    }
    let Some(db) = dbroom::get_db() else {
        error!("Database not initialized, dropping edit for room {}", msg.room_id);
        return;
    };
    // Persist first, then rebroadcast; a failed persist suppresses the
    // broadcast so subscribers never see content the store does not hold.
    if let Err(e) = db.save_document(&msg.room_id, &msg.content).await {
        error!("Failed to persist document for room {}: {}", msg.room_id, e);
        return;
    }
    hub.broadcast(
        &msg.room_id,
        ServerEvent::CodeChange(CodeBroadcastMessage {
            content: msg.content,
        }),
        Some(conn_id),
    );
}

fn handle_cursor_move(msg: CursorMoveMessage, conn_id: ConnId, identity: &Identity, hub: &RoomHub) {
    if !ensure_in_room(conn_id, &msg.room_id, hub) {
        return;
    }
    hub.cursor_move(&msg.room_id, &identity.user_id, msg.position);
    hub.broadcast(
        &msg.room_id,
        ServerEvent::CursorMove(CursorBroadcastMessage {
            user_id: identity.user_id.clone(),
            position: msg.position,
        }),
        Some(conn_id),
    );
}

async fn handle_chat_sync(msg: ChatSyncMessage, conn_id: ConnId, hub: &RoomHub) {
    if !ensure_in_room(conn_id, &msg.room_id, hub) {
        return;
    }
    let Some(db) = dbroom::get_db() else {
        error!("Database not initialized, cannot fetch history for room {}", msg.room_id);
        return;
    };
    let limit = config::get_config().chat_history_limit;
    match db.list_messages(&msg.room_id, limit).await {
        Ok(rows) => hub.send_to(
            conn_id,
            ServerEvent::ChatHistory(ChatHistoryMessage {
                room_id: msg.room_id.clone(),
                messages: rows.into_iter().map(Into::into).collect(),
            }),
        ),
        Err(e) => error!("Failed to load chat history for room {}: {}", msg.room_id, e),
    }
}

async fn handle_chat_message(
    msg: ChatSendMessage,
    conn_id: ConnId,
    identity: &Identity,
    hub: &RoomHub,
) {
    if !ensure_in_room(conn_id, &msg.room_id, hub) {
        return;
    }
    let Some(db) = dbroom::get_db() else {
        error!("Database not initialized, dropping message for room {}", msg.room_id);
        return;
    };
    let row = match db
        .insert_message(&msg.room_id, &identity.user_id, &identity.username, &msg.text)
        .await
    {
        Ok(row) => row,
        Err(e) => {
            error!("Failed to persist message for room {}: {}", msg.room_id, e);
            return;
        }
    };
    // Full broadcast, sender included: the sender's UI needs the
    // authoritative id and timestamp.
    hub.broadcast(&msg.room_id, ServerEvent::ChatMessage(row.into()), None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn identity(n: u32) -> Identity {
        Identity {
            user_id: format!("user-{n}"),
            username: format!("name-{n}"),
        }
    }

    fn connect(hub: &RoomHub, n: u32) -> (ConnId, UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(conn_id, identity(n), tx);
        (conn_id, rx)
    }

    #[test]
    fn cursor_move_outside_room_is_rejected() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = connect(&hub, 1);

        handle_cursor_move(
            CursorMoveMessage {
                room_id: "abc".to_string(),
                position: 3,
            },
            a,
            &identity(1),
            &hub,
        );

        match rx_a.try_recv().unwrap() {
            ServerEvent::RoomError(msg) => assert_eq!(msg.reason, "NOT_IN_ROOM"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(hub.cursor_snapshot("abc").is_empty());
    }

    #[test]
    fn cursor_move_stores_and_rebroadcasts_to_others() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");

        handle_cursor_move(
            CursorMoveMessage {
                room_id: "abc".to_string(),
                position: 17,
            },
            a,
            &identity(1),
            &hub,
        );

        assert_eq!(hub.cursor_snapshot("abc").get("user-1"), Some(&17));
        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            ServerEvent::CursorMove(msg) => {
                assert_eq!(msg.user_id, "user-1");
                assert_eq!(msg.position, 17);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn explicit_leave_notifies_remaining_members() {
        let hub = RoomHub::new();
        let (a, _rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");

        handle_room_leave(
            RoomLeaveMessage {
                room_id: "abc".to_string(),
            },
            a,
            &hub,
        );

        assert_eq!(hub.list_online("abc").len(), 1);
        match rx_b.try_recv().unwrap() {
            ServerEvent::UserOffline(msg) => assert_eq!(msg.user_id, "user-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn leave_without_room_is_silent() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = connect(&hub, 1);

        handle_room_leave(
            RoomLeaveMessage {
                room_id: "abc".to_string(),
            },
            a,
            &hub,
        );
        assert!(rx_a.try_recv().is_err());
    }
}

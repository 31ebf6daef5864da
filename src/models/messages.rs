use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinMessage {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeaveMessage {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CodeSyncMessage {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CodeChangeMessage {
    pub room_id: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoveMessage {
    pub room_id: String,
    pub position: i64,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatSyncMessage {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendMessage {
    pub room_id: String,
    pub text: String,
}

/// Events a client may send over an established connection.
///
/// A closed set: anything that does not parse into one of these variants is
/// logged and dropped by the session router.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "ROOM_JOIN")]
    RoomJoin(RoomJoinMessage),
    #[serde(rename = "ROOM_LEAVE")]
    RoomLeave(RoomLeaveMessage),
    #[serde(rename = "CODE_SYNC")]
    CodeSync(CodeSyncMessage),
    #[serde(rename = "CODE_CHANGE")]
    CodeChange(CodeChangeMessage),
    #[serde(rename = "CURSOR_MOVE")]
    CursorMove(CursorMoveMessage),
    #[serde(rename = "CHAT_SYNC")]
    ChatSync(ChatSyncMessage),
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatSendMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessMessage {
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthErrorMessage {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomErrorMessage {
    pub reason: String,
}

/// One entry of the "who's online" payload.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub conn_id: Uuid,
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsersMessage {
    pub room_id: String,
    pub users: Vec<OnlineUser>,
}

/// One entry of the authorized-member roster.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembersMessage {
    pub room_id: String,
    pub members: Vec<RoomMember>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineMessage {
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserOfflineMessage {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeStateMessage {
    pub content: String,
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeBroadcastMessage {
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorStateMessage {
    pub positions: HashMap<String, i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorBroadcastMessage {
    pub user_id: String,
    pub position: i64,
}

/// A persisted chat message, as stored and as broadcast. The id and time are
/// server-assigned; the sender receives them back through the full broadcast.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageOut {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryMessage {
    pub room_id: String,
    pub messages: Vec<ChatMessageOut>,
}

/// Events the server pushes to clients.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess(AuthSuccessMessage),
    #[serde(rename = "AUTH_ERROR")]
    AuthError(AuthErrorMessage),
    #[serde(rename = "ROOM_ERROR")]
    RoomError(RoomErrorMessage),
    #[serde(rename = "ONLINE_USERS")]
    OnlineUsers(OnlineUsersMessage),
    #[serde(rename = "ROOM_MEMBERS")]
    RoomMembers(RoomMembersMessage),
    #[serde(rename = "USER_ONLINE")]
    UserOnline(UserOnlineMessage),
    #[serde(rename = "USER_OFFLINE")]
    UserOffline(UserOfflineMessage),
    #[serde(rename = "CODE_STATE")]
    CodeState(CodeStateMessage),
    #[serde(rename = "CODE_CHANGE")]
    CodeChange(CodeBroadcastMessage),
    #[serde(rename = "CURSOR_STATE")]
    CursorState(CursorStateMessage),
    #[serde(rename = "CURSOR_MOVE")]
    CursorMove(CursorBroadcastMessage),
    #[serde(rename = "CHAT_HISTORY")]
    ChatHistory(ChatHistoryMessage),
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatMessageOut),
}

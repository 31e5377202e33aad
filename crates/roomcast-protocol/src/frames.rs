//! Frame types for the roomcast protocol.
//!
//! Every frame on the client stream is a JSON object of the shape
//! `{"type": string, "data": object}`. Client frames carry room intents;
//! server frames carry room events fanned out across processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room identifier.
pub type RoomId = Uuid;

/// User identifier issued by the session gate.
pub type UserId = i64;

/// Client → server frame type names.
pub mod client_types {
    pub const ROOM_JOIN: &str = "room:join";
    pub const ROOM_LEAVE: &str = "room:leave";
    pub const MESSAGE_SEND: &str = "message:send";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";

    /// All recognized client frame types.
    pub const ALL: [&str; 5] = [ROOM_JOIN, ROOM_LEAVE, MESSAGE_SEND, TYPING_START, TYPING_STOP];
}

/// Server → client frame type names.
pub mod server_types {
    pub const MESSAGE_NEW: &str = "message:new";
    pub const ROOM_UPDATED: &str = "room:updated";
    pub const ROOM_DELETED: &str = "room:deleted";
    pub const MEMBER_COUNT_UPDATED: &str = "room:member_count_updated";
    pub const USER_JOINED: &str = "user:joined";
    pub const USER_LEFT: &str = "user:left";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";
    pub const ERROR: &str = "error";
}

/// A reference to a single room, the payload of most client frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// Payload of `message:send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: RoomId,
    pub content: String,
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Subscribe to a room, joining it if needed.
    #[serde(rename = "room:join")]
    RoomJoin(RoomRef),

    /// Unsubscribe from a room.
    #[serde(rename = "room:leave")]
    RoomLeave(RoomRef),

    /// Send a chat message to a room.
    #[serde(rename = "message:send")]
    MessageSend(SendMessage),

    /// Start typing in a room.
    #[serde(rename = "typing:start")]
    TypingStart(RoomRef),

    /// Stop typing in a room.
    #[serde(rename = "typing:stop")]
    TypingStop(RoomRef),
}

impl ClientFrame {
    /// The room this frame targets.
    #[must_use]
    pub fn room_id(&self) -> RoomId {
        match self {
            ClientFrame::RoomJoin(r)
            | ClientFrame::RoomLeave(r)
            | ClientFrame::TypingStart(r)
            | ClientFrame::TypingStop(r) => r.room_id,
            ClientFrame::MessageSend(m) => m.room_id,
        }
    }

    /// The wire type name of this frame.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientFrame::RoomJoin(_) => client_types::ROOM_JOIN,
            ClientFrame::RoomLeave(_) => client_types::ROOM_LEAVE,
            ClientFrame::MessageSend(_) => client_types::MESSAGE_SEND,
            ClientFrame::TypingStart(_) => client_types::TYPING_START,
            ClientFrame::TypingStop(_) => client_types::TYPING_STOP,
        }
    }
}

/// A chat message as delivered to room subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Public user details carried by presence events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

/// Payload of `user:joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user: UserSummary,
    pub room_id: RoomId,
}

/// Payload of `user:left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: UserId,
    pub room_id: RoomId,
}

/// Payload of `typing:start` and `typing:stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
}

/// Payload of `room:member_count_updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberCount {
    pub room_id: RoomId,
    pub count: u32,
}

/// Payload of `room:updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdated {
    pub room_id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub capacity: u32,
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// A new chat message.
    #[serde(rename = "message:new")]
    MessageNew(ChatMessage),

    /// Room settings or ownership changed.
    #[serde(rename = "room:updated")]
    RoomUpdated(RoomUpdated),

    /// Room was deleted by its owner.
    #[serde(rename = "room:deleted")]
    RoomDeleted(RoomRef),

    /// Membership count changed.
    #[serde(rename = "room:member_count_updated")]
    MemberCountUpdated(MemberCount),

    /// A user came online in the room.
    #[serde(rename = "user:joined")]
    UserJoined(UserJoined),

    /// A user went offline in the room or left it.
    #[serde(rename = "user:left")]
    UserLeft(UserLeft),

    /// A user started typing.
    #[serde(rename = "typing:start")]
    TypingStart(Typing),

    /// A user stopped typing.
    #[serde(rename = "typing:stop")]
    TypingStop(Typing),

    /// A request failed.
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Create an error frame.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            code: code.into(),
        })
    }

    /// The wire type name of this event.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerEvent::MessageNew(_) => server_types::MESSAGE_NEW,
            ServerEvent::RoomUpdated(_) => server_types::ROOM_UPDATED,
            ServerEvent::RoomDeleted(_) => server_types::ROOM_DELETED,
            ServerEvent::MemberCountUpdated(_) => server_types::MEMBER_COUNT_UPDATED,
            ServerEvent::UserJoined(_) => server_types::USER_JOINED,
            ServerEvent::UserLeft(_) => server_types::USER_LEFT,
            ServerEvent::TypingStart(_) => server_types::TYPING_START,
            ServerEvent::TypingStop(_) => server_types::TYPING_STOP,
            ServerEvent::Error(_) => server_types::ERROR,
        }
    }

    /// The room an event belongs to. `None` for connection-scoped frames.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ServerEvent::MessageNew(m) => Some(m.room_id),
            ServerEvent::RoomUpdated(r) => Some(r.room_id),
            ServerEvent::RoomDeleted(r) => Some(r.room_id),
            ServerEvent::MemberCountUpdated(c) => Some(c.room_id),
            ServerEvent::UserJoined(j) => Some(j.room_id),
            ServerEvent::UserLeft(l) => Some(l.room_id),
            ServerEvent::TypingStart(t) | ServerEvent::TypingStop(t) => Some(t.room_id),
            ServerEvent::Error(_) => None,
        }
    }

    /// Check that this event may be published on `room_id`'s channel.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the event is connection-scoped,
    /// targets a different room, or carries an empty payload.
    pub fn validate_for(&self, room_id: RoomId) -> Result<(), &'static str> {
        match self.room_id() {
            None => Err("Event is not room-scoped"),
            Some(id) if id != room_id => Err("Event room does not match channel"),
            Some(_) => match self {
                ServerEvent::MessageNew(m) if m.content.trim().is_empty() => {
                    Err("Message content is empty")
                }
                ServerEvent::UserJoined(j) if j.user.username.is_empty() => {
                    Err("Joined user has no username")
                }
                _ => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shape() {
        let room_id = Uuid::new_v4();
        let frame = ClientFrame::MessageSend(SendMessage {
            room_id,
            content: "hi".into(),
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "message:send");
        assert_eq!(value["data"]["roomId"], json!(room_id.to_string()));
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(frame.room_id(), room_id);
        assert_eq!(frame.type_name(), client_types::MESSAGE_SEND);
    }

    #[test]
    fn test_server_event_shape() {
        let room_id = Uuid::new_v4();
        let event = ServerEvent::UserLeft(UserLeft {
            user_id: 7,
            room_id,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user:left");
        assert_eq!(value["data"]["userId"], 7);
        assert_eq!(event.type_name(), server_types::USER_LEFT);
    }

    #[test]
    fn test_validate_for_room() {
        let room_id = Uuid::new_v4();
        let event = ServerEvent::MemberCountUpdated(MemberCount { room_id, count: 3 });

        assert!(event.validate_for(room_id).is_ok());
        assert!(event.validate_for(Uuid::new_v4()).is_err());
        assert!(ServerEvent::error("X", "y").validate_for(room_id).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_message() {
        let room_id = Uuid::new_v4();
        let event = ServerEvent::MessageNew(ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: 1,
            username: "alice".into(),
            content: "   ".into(),
            created_at: Utc::now(),
        });

        assert_eq!(event.validate_for(room_id), Err("Message content is empty"));
    }
}

//! # roomcast-protocol
//!
//! Wire protocol definitions for the roomcast chat coordination layer.
//!
//! Clients exchange JSON frames of the shape `{"type": string, "data": object}`
//! with the server. Server processes exchange room events with each other
//! through a shared broker, wrapped in a MessagePack [`BusEnvelope`].
//!
//! ## Frame Types
//!
//! - `room:join` / `room:leave` - Room subscription
//! - `message:send` - Chat messages
//! - `typing:start` / `typing:stop` - Typing indicators
//! - `user:joined` / `user:left` / `room:*` - Server-side room events
//! - `error` - Rejected requests
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, ClientFrame};
//!
//! let text = r#"{"type":"room:join","data":{"roomId":"67e55044-10b1-426f-9247-bb680e5fe0c8"}}"#;
//! let frame = codec::decode_client(text, codec::MAX_FRAME_SIZE).unwrap();
//! assert!(matches!(frame, ClientFrame::RoomJoin(_)));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{BusEnvelope, ProtocolError};
pub use frames::{
    ChatMessage, ClientFrame, ErrorPayload, MemberCount, RoomId, RoomRef, RoomUpdated,
    SendMessage, ServerEvent, Typing, UserId, UserJoined, UserLeft, UserSummary,
};

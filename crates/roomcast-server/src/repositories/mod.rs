//! Database repositories.

pub mod rooms;

pub use rooms::PgRoomStore;

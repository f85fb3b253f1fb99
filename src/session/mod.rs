//! Session state: bounded per-session history, entity tracking, expiry,
//! and the optional on-disk transcript mirror.

pub mod mirror;
pub mod store;

pub use mirror::SessionMirror;
pub use store::{
    validate_user_text, ChatMessage, ChatRole, SessionInfo, SessionRecord, SessionStore,
};

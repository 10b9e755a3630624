//! Utilities module - text helpers for token estimation, previews and noise filtering

pub mod text_utils;

pub use text_utils::{TextUtils, EMPTY_REPLY_APOLOGY, INSUFFICIENT_CONTEXT_REPLY, UPSTREAM_FAILURE_REPLY};

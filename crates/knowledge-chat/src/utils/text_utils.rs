//! Text helpers shared by context assembly and response delivery

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

use crate::inference::ChatMessage;

/// Stored in place of an answer when the backend returned nothing at all.
pub const EMPTY_REPLY_APOLOGY: &str =
    "Sorry, I couldn't come up with an answer this time. Please try again.";

/// Stored in place of an answer when the backend failed mid-request.
pub const UPSTREAM_FAILURE_REPLY: &str =
    "Sorry, something went wrong while generating this answer. Please try again.";

/// Stored in place of an answer when the conversation no longer fits the model.
pub const INSUFFICIENT_CONTEXT_REPLY: &str =
    "This conversation has grown too long for me to follow. Please start a new one.";

/// Tokens charged per message for role and framing.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    // Pipeline-authored placeholders; they carry no conversational content.
    static ref NOISE_REGEX: Regex = Regex::new(&format!(
        r"^\s*(?:{}|{}|{})?\s*$",
        regex::escape(EMPTY_REPLY_APOLOGY),
        regex::escape(UPSTREAM_FAILURE_REPLY),
        regex::escape(INSUFFICIENT_CONTEXT_REPLY),
    ))
    .unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Normalize whitespace, borrowing when nothing changes
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if text.contains(|c: char| c.is_whitespace() && c != ' ') || text.contains("  ")
            || text.trim().len() != text.len()
        {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate to at most `max_chars` characters, never splitting a char.
    pub fn preview(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            None => Cow::Borrowed(text),
            Some((byte_pos, _)) => Cow::Borrowed(&text[..byte_pos]),
        }
    }

    /// Truncate text to max chars with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            Cow::Owned(format!("{}...", Self::preview(text, max_chars - 3)))
        }
    }

    /// True for empty text and for the canned apology/failure replies.
    pub fn is_noise(text: &str) -> bool {
        NOISE_REGEX.is_match(text)
    }

    /// Rough token count: one token per four characters, rounded up.
    pub fn estimate_tokens(text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }

    pub fn estimate_message_tokens(messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }

    /// Character count, the unit stream offsets are measured in.
    pub fn char_len(text: &str) -> usize {
        text.chars().count()
    }
}

//! Session error taxonomy
//!
//! Every public operation on the session engine returns [`SessionResult`].
//! Component errors (authentication, transport, codec, buffer allocation and
//! configuration) convert into [`SessionError`] so callers only match on one
//! type.

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::transport::mqtt::codec::CodecError;
use crate::transport::mqtt::connection::SessionState;
use crate::transport::mqtt::frame_buffer::AllocationError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connect failed: {message}")]
    Connect { message: String },

    #[error("Broker refused connection: {reason}")]
    Refused { reason: String },

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Not connected - current state: {state}")]
    NotConnected { state: SessionState },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Acknowledgment timeout for packet {packet_id}")]
    AckTimeout { packet_id: u16 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State conflict: expected {expected}, found {actual}")]
    StateConflict {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("Frame buffer error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No free packet identifiers")]
    PacketIdsExhausted,

    #[error("Session has been deinitialized")]
    Terminated,
}

impl SessionError {
    /// Create connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for errors the reconnect policy may recover from internally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_) | SessionError::Connect { .. } | SessionError::AckTimeout { .. }
        )
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(password|secret|signature|token|payload)(\x22?\s*[=:]\s*\x22?)[^\s\x22,&}]+").ok()
});

static SECRET_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|private)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credential material from text that may end up in logs or errors.
///
/// Registration service responses and transport failure reasons can echo
/// request parameters back; this strips anything that looks like a secret,
/// signature or encrypted payload and truncates to a bounded length.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}${2}***").to_string();
    }

    if let Some(re) = SECRET_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

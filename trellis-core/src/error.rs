//! Trellis Error Types
//!
//! Structural errors (`KeyExprError`, `SessionClosed`) are reported by the call
//! that caused them. Transport and timeout failures inside a query travel on
//! the reply stream instead, see [`crate::sample::ReplyError`].

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for trellis operations
#[derive(Error, Debug)]
pub enum TrellisError {
    /// Malformed or invalid key expression
    #[error(transparent)]
    KeyExpr(#[from] KeyExprError),

    /// Operation attempted on a closing or closed session
    #[error("Session closed")]
    SessionClosed,

    /// Send or receive failure at the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Query exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Capability disabled at session open
    #[error("Capability not enabled on this session: {0}")]
    Unsupported(&'static str),

    /// Numeric id unknown to the registry
    #[error("Unknown resource id {0}")]
    UnknownResource(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for trellis operations
pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// Validation and lifecycle errors never are; transport hiccups and
    /// timeouts may succeed if the caller tries again.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Transport(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::Transport(_))
    }
}

/// Key expression validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExprError {
    #[error("Empty key expression")]
    Empty,

    #[error("Empty chunk in key expression '{0}'")]
    EmptyChunk(String),

    #[error("Forbidden character '{ch}' in key expression '{expr}'")]
    ForbiddenChar { expr: String, ch: char },

    #[error("Invalid wildcard in chunk '{chunk}' of '{expr}'")]
    InvalidWildcard { expr: String, chunk: String },

    #[error("Invalid value set '{chunk}' in '{expr}'")]
    InvalidValueSet { expr: String, chunk: String },

    #[error("Key expression '{expr}' is not canonical (expected '{canonical}')")]
    NotCanonical { expr: String, canonical: String },

    #[error("Reply key '{reply}' does not intersect query key '{query}'")]
    ReplyOutsideQuery { reply: String, query: String },
}

//! Error taxonomy for the DVR session runtime.
//!
//! The session layer distinguishes four failure kinds so callers can
//! decide between reconnecting (transport, liveness), retrying the call
//! (protocol), and giving up (authentication). The recorder and binary
//! layers wrap these in `anyhow` like any other failure.

use std::io;

/// Error produced by the session runtime (login, stream setup, media pull,
/// config reads).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Socket-level failure: connect refused, read/write error, short read
    /// at EOF. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The device answered, but not with what the protocol requires:
    /// missing tag, missing attribute, malformed reply XML. Fatal to the
    /// current call; the session may still be alive.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Challenge/response login failed or the credential hash oracle was
    /// unavailable. The session is unusable.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The device went silent past the heartbeat budget.
    #[error("liveness error: {0}")]
    Liveness(String),
}

impl SessionError {
    /// Transport error for a connection that closed mid-exchange.
    pub(crate) fn closed(context: &str) -> Self {
        Self::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed: {context}"),
        ))
    }

    /// True when the session object must be discarded (a reconnect needs
    /// a new session). Protocol errors leave the transport intact.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Result alias used throughout the session runtime.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_not_session_fatal() {
        assert!(!SessionError::Protocol("missing tag".into()).is_fatal_to_session());
        assert!(SessionError::Auth("bad hash".into()).is_fatal_to_session());
        assert!(SessionError::closed("login").is_fatal_to_session());
        assert!(SessionError::Liveness("silent".into()).is_fatal_to_session());
    }
}

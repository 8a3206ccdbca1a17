//! Session error taxonomy.

/// Errors returned by [`Session`](crate::Session) operations.
///
/// `Closed` and `Blocked` are session-state failures raised by this crate;
/// `Transport` wraps whatever the codec reported. A transport failure always
/// closes the session it came from.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was already closed when the operation started.
    #[error("session closed")]
    Closed,

    /// The outbound queue was full. The session has been closed.
    #[error("session blocked")]
    Blocked,

    /// The codec failed to send, receive, or close.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this is the [`SessionError::Closed`] sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether this is the [`SessionError::Blocked`] sentinel.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

//! Error taxonomy for the VICI client.
//!
//! Errors split into two groups: fatal ([`Error::Transport`], [`Error::Protocol`])
//! invalidate the owning [`crate::Session`] and are latched — once observed, every
//! subsequent call on that session returns an error of the same kind — and
//! recoverable ones (`UnknownCommand`, `UnknownEvent`, `EventRegisterFailed`,
//! `Encode`) which surface to the caller without touching session state.

use std::io;
use std::sync::Arc;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A socket read or write failed. Fatal; latches the session.
    ///
    /// Wrapped in an `Arc` (rather than the bare `std::io::Error` a plain
    /// `#[from]` would give) so the error can be cloned into the session's
    /// shared latch and handed back to every later caller.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// A malformed frame, unexpected packet type, or malformed message
    /// element. Fatal; latches the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon replied `CMD_UNKNOWN` to a named command.
    #[error("daemon does not recognize command '{0}'")]
    UnknownCommand(String),

    /// The daemon replied `EVENT_UNKNOWN` to a register/unregister request.
    #[error("daemon does not recognize event '{0}'")]
    UnknownEvent(String),

    /// A streamed command could not register its event before issuing the
    /// request.
    #[error("failed to register event '{0}' for streamed command")]
    EventRegisterFailed(String),

    /// A caller-supplied value could not be encoded (key too long, value
    /// too long).
    #[error("cannot encode message: {0}")]
    Encode(String),

    /// The session was already closed, or closed while the call was
    /// pending.
    #[error("session is closed")]
    SessionClosed,
}

impl Error {
    pub(crate) fn transport(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }

    /// True for the two error kinds that invalidate the owning session
    /// (spec §7: "fatal errors ... invalidate the session").
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }
}

//! Error taxonomy shared by clients and zippers.

use std::io;

/// Errors produced by the frame codec, the stream layer, and the engines.
///
/// Only [`Error::AuthenticateFailed`] and [`Error::StreamClosed`] are fatal
/// to a client engine; everything else is reported to the installed error
/// handler and followed by a reconnect attempt.
#[derive(Debug)]
pub enum Error {
    /// The server rejected the presented credential.
    AuthenticateFailed(String),
    /// The wire bytes did not decode as a well-formed frame.
    Malformed(String),
    /// The write queue is full and the engine is configured for
    /// non-blocking writes, or the engine has been closed.
    Disconnected,
    /// Another endpoint of the same type already registered this name.
    DuplicateName(String),
    /// The server rejected a handshake or an out-of-place frame.
    Rejected(String),
    /// The peer finished the stream (clean EOF).
    StreamClosed,
    /// A user-installed handler panicked; the pump recovered and continues.
    HandlerPanic(String),
    /// Transport-level failure.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AuthenticateFailed(reason) => write!(f, "authentication failed: {reason}"),
            Error::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            Error::Disconnected => f.write_str("client has lost connection"),
            Error::DuplicateName(name) => write!(f, "duplicate endpoint name: {name}"),
            Error::Rejected(reason) => write!(f, "rejected by server: {reason}"),
            Error::StreamClosed => f.write_str("stream closed by peer"),
            Error::HandlerPanic(detail) => write!(f, "handler panic: {detail}"),
            Error::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // A clean FIN surfaces as UnexpectedEof from the framed reader.
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::StreamClosed
        } else {
            Error::Io(e)
        }
    }
}

impl Error {
    /// True when the engine must stop instead of reconnecting: the server
    /// actively refused us, or cleanly finished the stream.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthenticateFailed(_)
                | Error::Rejected(_)
                | Error::DuplicateName(_)
                | Error::StreamClosed
        )
    }

    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Error::Malformed(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        assert_eq!(
            Error::AuthenticateFailed("bad token".into()).to_string(),
            "authentication failed: bad token"
        );
        assert_eq!(
            Error::Disconnected.to_string(),
            "client has lost connection"
        );
        assert_eq!(Error::StreamClosed.to_string(), "stream closed by peer");
    }

    #[test]
    fn eof_maps_to_stream_closed() {
        let e: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(e, Error::StreamClosed));
        assert!(e.is_fatal());
    }

    #[test]
    fn network_errors_are_not_fatal() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(!e.is_fatal());
    }
}

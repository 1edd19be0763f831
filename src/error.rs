//! Error types shared across the tunnel core.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Boxed error type used at the executor boundary.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors produced by the tunnel core.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// Server shutdown was initiated; no more requests are accepted and
    /// pending requests are failed.
    #[error("tunnel server stopped")]
    ServerStopped,

    /// A frame could not be parsed or serialized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying WebSocket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the control connection.
    #[error("websocket connection closed (code {code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// The response sink was dropped before a response was delivered.
    #[error("response channel closed")]
    ResponseChannelClosed,

    /// A reader, writer, or dispatcher task panicked.
    #[error("panic {context}: {message}")]
    LoopPanic { context: &'static str, message: String },

    /// Multiple tasks failed while a connection was tearing down.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<TunnelError>),
}

impl TunnelError {
    /// Wrap a transport-level failure, keeping its message.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Fold a list of errors into a single terminal error.
    ///
    /// Returns `None` for an empty list and the sole error unwrapped for a
    /// single-element list.
    pub fn aggregate(mut errors: Vec<TunnelError>) -> Option<TunnelError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(TunnelError::Aggregate(errors)),
        }
    }
}

/// Whether an error is worth retrying on the same connection.
///
/// Walks the source chain looking for a retryable I/O condition, mirroring
/// how transient socket errors are distinguished from connection loss.
pub fn is_temporary_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return is_temporary_io(io_err);
        }
        if let Some(ws_err) = e.downcast_ref::<WsError>() {
            match ws_err {
                WsError::WriteBufferFull(_) => return true,
                WsError::Io(io_err) => return is_temporary_io(io_err),
                _ => return false,
            }
        }
        current = e.source();
    }
    false
}

fn is_temporary_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_io_error() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
        assert!(is_temporary_error(&err));

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "peer went away");
        assert!(!is_temporary_error(&err));
    }

    #[test]
    fn test_temporary_ws_error() {
        let err = WsError::Io(io::Error::new(io::ErrorKind::WouldBlock, "try again"));
        assert!(is_temporary_error(&err));

        assert!(!is_temporary_error(&WsError::ConnectionClosed));
    }

    #[test]
    fn test_aggregate_folding() {
        assert!(TunnelError::aggregate(vec![]).is_none());

        let single = TunnelError::aggregate(vec![TunnelError::ServerStopped]).unwrap();
        assert!(matches!(single, TunnelError::ServerStopped));

        let multi = TunnelError::aggregate(vec![
            TunnelError::ServerStopped,
            TunnelError::Protocol("truncated frame".into()),
        ])
        .unwrap();
        assert_eq!(
            multi.to_string(),
            "tunnel server stopped; protocol error: truncated frame"
        );
    }
}

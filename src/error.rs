use std::io;
use thiserror::Error;

/// Errors surfaced by the ping engine, either from `start` or through `PingEvent`s.
#[derive(Debug, Error)]
pub enum PingError {
    /// The name could not be resolved, or resolved to no address of the required family.
    #[error("could not resolve {host}: {message}")]
    ResolutionFailed {
        host: String,
        code: Option<i32>,
        message: String,
    },

    /// The raw socket could not be created (usually missing CAP_NET_RAW).
    #[error("could not open raw ICMP socket: {0}")]
    SocketOpenFailed(#[source] io::Error),

    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// The socket failed underneath a running session.
    #[error("transport failed: {0}")]
    TransportFatal(#[source] io::Error),
}

impl PingError {
    /// Underlying OS or resolver error code, when one is known.
    pub fn code(&self) -> Option<i32> {
        match self {
            PingError::ResolutionFailed { code, .. } => *code,
            PingError::SocketOpenFailed(e)
            | PingError::SendFailed(e)
            | PingError::TransportFatal(e) => e.raw_os_error(),
        }
    }
}

/// Structural decode failures: the datagram is too short or its IP framing is broken.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("not an IPv4 datagram (version {0})")]
    NotIpv4(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),
}

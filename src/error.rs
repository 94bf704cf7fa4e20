use crate::schema::SchemaError;
use std::fmt;

/// Server error codes the cluster layer treats as retriable.
pub const ER_READONLY: u32 = 7;
pub const ER_TIMEOUT: u32 = 78;
pub const ER_LOADING: u32 = 116;

const TRANSIENT_SERVER_CODES: [u32; 3] = [ER_READONLY, ER_TIMEOUT, ER_LOADING];

/// All errors surfaced by the client.
///
/// `Communication` is fatal to the connection and triggers the supervisor;
/// everything else is delivered to the originating caller and leaves the
/// connection alive. The type is `Clone` because a dying connection fails
/// every in-flight request with one shared cause.
#[derive(Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// Socket or protocol framing failure.
    #[error("communication error: {0}")]
    Communication(String),
    /// Non-zero response code from the server.
    #[error("server error {code:#x}: {message}")]
    Server { code: u32, message: String },
    /// Space or index name resolution failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// The per-request deadline passed before a response arrived.
    #[error("operation expired before a response arrived")]
    Expired,
    /// The write path could not take the packet within the write timeout.
    #[error("write timed out waiting for {0}")]
    TimedWrite(&'static str),
    /// Invalid arguments, out-of-range conversion and the like.
    #[error("{0}")]
    Usage(String),
    /// The client has been closed by the user.
    #[error("connection is closed")]
    Closed,
}

impl fmt::Debug for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ClientError {
    pub fn comm(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Whether the cluster overlay may retry the request on another peer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Communication(_) => true,
            Self::Server { code, .. } => TRANSIENT_SERVER_CODES.contains(code),
            _ => false,
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

impl From<std::io::Error> for ClientError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Communication(e.to_string())
    }
}

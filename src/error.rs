use std::{io, time::Duration};

use http::StatusCode;
use thiserror::Error;

/// Errors raised while negotiating or running an upgrade tunnel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// The request cannot be turned into a valid outbound upgrade request
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A Transfer-Encoding token we do not know how to forward
    #[error("unsupported transfer-encoding: {0}")]
    UnsupportedEncoding(String),

    /// The origin could not be reached
    #[error("failed to connect to origin {authority}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },

    /// The origin answered the upgrade request with something other than 101
    #[error("origin refused upgrade with status {status}")]
    UpgradeRefused { status: u16 },

    /// The origin's response head could not be parsed
    #[error("invalid origin response: {0}")]
    InvalidResponse(String),

    #[error("read failed")]
    Read(#[source] io::Error),

    /// Some bytes may already have reached the peer
    #[error("write failed after {written} bytes")]
    Write {
        written: usize,
        #[source]
        source: io::Error,
    },

    #[error("no traffic for {0:?}")]
    Timeout(Duration),
}

impl TunnelError {
    /// HTTP status reported to the client when the failure happens before the
    /// tunnel is established.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::UnsupportedEncoding(_) => {
                StatusCode::EXPECTATION_FAILED
            }
            Self::Connect { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpgradeRefused { .. }
            | Self::InvalidResponse(_)
            | Self::Read(_)
            | Self::Write { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Kind of the underlying transport error, if there is one.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Connect { source, .. } | Self::Read(source) | Self::Write { source, .. } => {
                Some(source.kind())
            }
            _ => None,
        }
    }
}

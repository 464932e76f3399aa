pub mod mux;
pub mod netstack;
pub mod pipeline;
pub mod redirector;
pub mod route;
pub mod session;
pub mod splice;

use std::fmt;

/// Error kinds surfaced across the service layer (§7). Binaries map these
/// onto their own transport's error representation — `tonic::Status` on the
/// operator RPC surface, a protocol opcode on the agent wire.
#[derive(Debug)]
pub enum Error {
    Transport(String),
    Protocol(String),
    RemoteRefused,
    RemoteReset,
    DuplicateSession,
    OverlappingRoute { owner: String, cidr: String },
    NotFound,
    Unauthorized,
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::RemoteRefused => write!(f, "remote refused the connection"),
            Error::RemoteReset => write!(f, "remote reset the connection"),
            Error::DuplicateSession => write!(f, "session already exists"),
            Error::OverlappingRoute { owner, cidr } => {
                write!(f, "route {cidr} overlaps a route already owned by session {owner}")
            }
            Error::NotFound => write!(f, "not found"),
            Error::Unauthorized => write!(f, "unauthorized"),
            Error::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<session::registry::RouteAddError> for Error {
    fn from(err: session::registry::RouteAddError) -> Self {
        match err {
            session::registry::RouteAddError::NotFound => Error::NotFound,
            session::registry::RouteAddError::Overlap { owner, existing } => {
                Error::OverlappingRoute { owner, cidr: existing.cidr.to_string() }
            }
        }
    }
}


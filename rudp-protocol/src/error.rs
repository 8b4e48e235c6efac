use std::io;

use crate::peer::peer::PeerError;

/// Errors surfaced at the public API boundary.
#[derive(Debug, thiserror::Error)]
pub enum RudpError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Not connected")]
    NotConnected,
    #[error("Address family not supported")]
    AddressFamilyUnsupported,
    #[error("Resolver failed for {host}: {source}")]
    ResolverFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("No usable address for {0}")]
    AddressExhausted(String),
    #[error("Transport error: {0:?}")]
    Transport(io::ErrorKind),
    #[error("Malformed datagram: {0}")]
    Malformed(String),
    #[error("Connection dropped: {0}")]
    Dropped(#[from] PeerError),
    #[error("Bind failed: {0}")]
    Bind(#[source] io::Error),
}

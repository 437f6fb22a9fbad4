//! Error types for canwire.

use thiserror::Error;

/// Main error type for all tunnel operations.
#[derive(Debug, Error)]
pub enum CanwireError {
    /// I/O error during socket or timer operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error (bad version, wrong op-code, truncated packet,
    /// banner mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// A connection attempt arrived from an address that is not the
    /// configured remote.
    #[error("rejected connection from unexpected peer {0}")]
    PeerRejected(std::net::SocketAddr),

    /// Frame pool is at its cap and eviction was not permitted.
    #[error("frame pool depleted")]
    PoolDepleted,
}

/// Result type alias using CanwireError.
pub type Result<T> = std::result::Result<T, CanwireError>;

//! Forwarder error types

use std::io;
use thiserror::Error;

/// Forwarder operation result type
pub type Result<T> = std::result::Result<T, DnsError>;

/// Errors surfaced by the forwarding and caching engine
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("DNS protocol error: {0}")]
    Proto(String),

    #[error("failed to dial upstream: {0}")]
    Dial(String),

    #[error("failed to send query upstream: {0}")]
    Write(String),

    #[error("failed to read upstream response: {0}")]
    Read(String),

    #[error("upstream exchange deadline exceeded")]
    DeadlineExceeded,

    #[error("nil response from upstream")]
    NilResponse,

    #[error("connection pool is shut down")]
    PoolClosed,

    #[error("all upstream servers failed")]
    AllUpstreamsFailed,

    #[error("invalid upstream address: {0}")]
    InvalidUpstreamAddress(String),

    #[error("cache capacity must be at least 2, got {0}")]
    InvalidCacheCapacity(usize),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<hickory_proto::ProtoError> for DnsError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        DnsError::Proto(e.to_string())
    }
}

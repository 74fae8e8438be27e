//! Structured error types for the resolver.

use std::io;
use thiserror::Error;

/// Top-level error for starting and running the server
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket bind, file operations)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// DNS protocol or resolution error
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),
}

/// DNS-related errors.
///
/// Every variant is contained to the request or background task that
/// produced it; none of them stops the server loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// Input bytes are not a well-formed DNS message
    #[error("Malformed DNS message: {0}")]
    MalformedMessage(String),
    /// A name's compression pointers revisit an offset
    #[error("DNS name compression cycle at offset {offset}")]
    CompressionCycle { offset: usize },
    /// A name cannot be written in wire format
    #[error("Unencodable DNS name: {0}")]
    UnencodableName(String),
    /// Upstream timed out, failed to answer, or sent an unusable reply
    #[error("Upstream DNS unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Every candidate nameserver failed without a usable delegation
    #[error("DNS resolution exhausted all nameservers")]
    ResolutionExhausted,
    /// Delegation chain longer than the hop bound
    #[error("DNS resolution exceeded {0} delegation hops")]
    ResolutionDepthExceeded(usize),
    /// Cache snapshot could not be read
    #[error("Cache restore failed: {0}")]
    CacheRestoreFailed(String),
    /// Cache snapshot could not be written
    #[error("Cache persist failed: {0}")]
    CachePersistFailed(String),
}

impl DnsError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DnsError::MalformedMessage(reason.into())
    }
}

/// Convenience type alias for Results using ServerError
pub type Result<T> = std::result::Result<T, ServerError>;

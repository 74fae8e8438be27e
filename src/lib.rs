//! cachedns - A caching forwarding and iterative DNS resolver.
//!
//! This crate provides the core functionality for the cachedns binary,
//! exposed as a library for testing and integration purposes.

pub mod config;
pub mod dns;
pub mod error;
pub mod logging;

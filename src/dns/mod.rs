//! Caching DNS resolver: wire codec, TTL cache, forwarding and iterative
//! resolution, and the UDP serving loop.

pub mod cache;
pub mod iterative;
pub mod resolver;
pub mod server;
pub mod wire;

pub use server::{run_dns_server, DnsServer, ServerOptions};

//! Resolution engine: answers from cache, otherwise resolves upstream
//! (forwarding or iterative) and feeds the result back into the cache.

use crate::dns::cache::RecordCache;
use crate::dns::iterative;
use crate::dns::wire::{Message, RecordClass, ResourceRecord};
use crate::error::DnsError;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Largest datagram accepted from an upstream
const MAX_UPSTREAM_DATAGRAM: usize = 4096;

/// Upstream transport trait using generics for zero-cost abstraction.
///
/// One call is one request datagram and at most one reply; implementations
/// must give up after `timeout`.
pub trait Upstream: Send + Sync {
    fn exchange(
        &self,
        query: &[u8],
        server: SocketAddr,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, DnsError>> + Send;
}

/// UDP transport over a fresh socket per exchange
pub struct UdpUpstream {
    verify_source: bool,
}

impl UdpUpstream {
    pub fn new(verify_source: bool) -> Self {
        Self { verify_source }
    }
}

impl Upstream for UdpUpstream {
    async fn exchange(
        &self,
        query: &[u8],
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<u8>, DnsError> {
        // Bind to the address family of the server (IPv4 or IPv6)
        let bind_addr = if server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };

        let unavailable = |e: std::io::Error| DnsError::UpstreamUnavailable(e.to_string());
        let socket = UdpSocket::bind(bind_addr).await.map_err(unavailable)?;
        socket.send_to(query, server).await.map_err(unavailable)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_UPSTREAM_DATAGRAM];
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    // Anti-spoofing: only the server we asked may answer
                    if self.verify_source && from != server {
                        warn!(
                            source = %from,
                            upstream = %server,
                            "DNS discarded reply from unexpected source"
                        );
                        continue;
                    }
                    buf.truncate(len);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(unavailable(e)),
                Err(_) => {
                    return Err(DnsError::UpstreamUnavailable(format!(
                        "timeout after {}ms",
                        timeout.as_millis()
                    )))
                }
            }
        }
    }
}

/// How cache misses are resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Relay the client's query verbatim to one upstream resolver
    Forward { upstream: SocketAddr },
    /// Walk delegations starting from the given root servers
    Iterative {
        root_servers: Vec<SocketAddr>,
        max_hops: usize,
    },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Forward { upstream } => write!(f, "forward({})", upstream),
            Strategy::Iterative { max_hops, .. } => write!(f, "iterative(max_hops={})", max_hops),
        }
    }
}

/// Cache-backed resolver shared by all request handlers
pub struct Resolver<U> {
    upstream: U,
    cache: Arc<RecordCache>,
    strategy: Strategy,
    timeout: Duration,
    enable_logging: bool,
}

impl<U: Upstream> Resolver<U> {
    pub fn new(upstream: U, cache: Arc<RecordCache>, strategy: Strategy, timeout: Duration) -> Self {
        Resolver {
            upstream,
            cache,
            strategy,
            timeout,
            enable_logging: true,
        }
    }

    pub fn with_logging(mut self, enable_logging: bool) -> Self {
        self.enable_logging = enable_logging;
        self
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Produce the response for a decoded query.
    ///
    /// `query_buf` is the query as received; the forwarding strategy sends it
    /// upstream unmodified. Only the first question is answered.
    pub async fn resolve(&self, query_buf: &[u8], query: &Message) -> Result<Message, DnsError> {
        let question = query
            .first_question()
            .ok_or_else(|| DnsError::malformed("query has no question"))?;

        if question.qclass == RecordClass::IN {
            if let Some(records) = self.cache.lookup(&question.name, question.qtype).await {
                if self.enable_logging {
                    debug!(
                        name = %question.name,
                        qtype = %question.qtype,
                        records = records.len(),
                        "DNS cache hit"
                    );
                }
                let answers = records
                    .into_iter()
                    .map(|r| ResourceRecord {
                        name: question.name.clone(),
                        rtype: question.qtype,
                        rclass: RecordClass::IN,
                        ttl: r.ttl,
                        rdata: r.rdata,
                    })
                    .collect();
                return Ok(Message::response_to(query, answers));
            }
        }

        if self.enable_logging {
            debug!(
                name = %question.name,
                qtype = %question.qtype,
                strategy = %self.strategy,
                "DNS cache miss, resolving upstream"
            );
        }

        let reply = match &self.strategy {
            Strategy::Forward { upstream } => self.forward(query_buf, query.id, *upstream).await?,
            Strategy::Iterative {
                root_servers,
                max_hops,
            } => {
                iterative::resolve(
                    &self.upstream,
                    question,
                    root_servers,
                    *max_hops,
                    self.timeout,
                    self.enable_logging,
                )
                .await?
            }
        };

        if reply.flags.is_truncated() {
            // Partial answer set: pass it on flagged so the client retries over TCP
            if self.enable_logging {
                debug!(
                    name = %question.name,
                    answers = reply.answers.len(),
                    "DNS upstream reply truncated, not caching"
                );
            }
            let rcode = reply.response_code();
            let mut response = Message::response_to(query, reply.answers);
            response.flags = response
                .flags
                .with_response_code(rcode)
                .with_truncated(true);
            response.authorities = reply.authorities;
            return Ok(response);
        }

        self.ingest(&reply).await;

        if reply.answers.is_empty() {
            // Negative answer: relay the upstream verdict under the client's id
            let mut response = Message::response_to(query, Vec::new());
            response.flags = response.flags.with_response_code(reply.response_code());
            response.authorities = reply.authorities;
            return Ok(response);
        }

        Ok(Message::response_to(query, reply.answers))
    }

    async fn forward(
        &self,
        query_buf: &[u8],
        id: u16,
        upstream: SocketAddr,
    ) -> Result<Message, DnsError> {
        let reply_buf = match self.upstream.exchange(query_buf, upstream, self.timeout).await {
            Ok(buf) => buf,
            Err(e) => {
                if self.enable_logging {
                    warn!(upstream = %upstream, error = %e, "DNS upstream failed");
                }
                return Err(e);
            }
        };
        parse_reply(&reply_buf, id)
    }

    /// Cache every answer record of a cacheable type under its own name.
    /// Returns the number of records stored.
    async fn ingest(&self, reply: &Message) -> usize {
        let mut stored = 0;
        for record in &reply.answers {
            if record.rclass != RecordClass::IN || !record.rtype.is_cacheable() {
                continue;
            }
            self.cache
                .add(&record.name, record.rtype, &record.rdata, record.ttl)
                .await;
            stored += 1;
        }
        if self.enable_logging && stored > 0 {
            debug!(records = stored, "DNS cached");
        }
        stored
    }
}

/// Decode an upstream reply and check it answers the query we sent
pub(crate) fn parse_reply(buf: &[u8], expected_id: u16) -> Result<Message, DnsError> {
    let reply = Message::decode(buf)
        .map_err(|e| DnsError::UpstreamUnavailable(format!("undecodable reply: {}", e)))?;
    if !reply.is_response() {
        return Err(DnsError::UpstreamUnavailable(
            "reply is not a response".to_string(),
        ));
    }
    if reply.id != expected_id {
        return Err(DnsError::UpstreamUnavailable(format!(
            "reply id {} does not match query id {}",
            reply.id, expected_id
        )));
    }
    Ok(reply)
}

/// Scripted upstream for tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Handler = dyn Fn(&Message, SocketAddr) -> Result<Message, DnsError> + Send + Sync;

    pub struct MockUpstream {
        call_count: AtomicUsize,
        servers: Mutex<Vec<SocketAddr>>,
        handler: Box<Handler>,
    }

    impl MockUpstream {
        pub fn new(
            handler: impl Fn(&Message, SocketAddr) -> Result<Message, DnsError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                servers: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }
        }

        pub fn always_fail() -> Self {
            Self::new(|_, _| Err(DnsError::UpstreamUnavailable("timeout".to_string())))
        }

        pub fn calls(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn servers(&self) -> Vec<SocketAddr> {
            self.servers.lock().unwrap().clone()
        }
    }

    impl Upstream for MockUpstream {
        async fn exchange(
            &self,
            query: &[u8],
            server: SocketAddr,
            _timeout: Duration,
        ) -> Result<Vec<u8>, DnsError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.servers.lock().unwrap().push(server);
            let query = Message::decode(query)?;
            (self.handler)(&query, server)?.encode()
        }
    }
}

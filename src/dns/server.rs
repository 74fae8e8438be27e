//! DNS server implementation: one task per datagram, a periodic cache
//! sweep, and cache restore/persist around the serving loop.

use crate::config::{DnsConfig, ResolutionMode};
use crate::dns::cache::RecordCache;
use crate::dns::iterative::{root_server_addrs, DNS_PORT};
use crate::dns::resolver::{Resolver, Strategy, UdpUpstream, Upstream};
use crate::dns::wire::{Message, OPCODE_QUERY};
use crate::error::{DnsError, Result, ServerError};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Largest datagram accepted from a client
const MAX_DATAGRAM: usize = 4096;

/// Serving options fixed before the loop starts
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub sweep_interval: Duration,
    pub backup_file: Option<PathBuf>,
    pub enable_logging: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            sweep_interval: Duration::from_secs(60),
            backup_file: None,
            enable_logging: true,
        }
    }
}

/// UDP DNS server bound to one socket
pub struct DnsServer<U> {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver<U>>,
    options: ServerOptions,
}

impl<U: Upstream + 'static> DnsServer<U> {
    pub async fn bind(listen_addr: SocketAddr, resolver: Resolver<U>, options: ServerOptions) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;
        Ok(DnsServer {
            socket: Arc::new(socket),
            resolver: Arc::new(resolver),
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` completes.
    ///
    /// The cache is restored from the backup file before the first datagram
    /// is read and persisted after the loop stops. Handlers still in flight
    /// at shutdown are not waited for.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let enable_logging = self.options.enable_logging;
        let cache = Arc::clone(self.resolver.cache());

        if let Some(path) = &self.options.backup_file {
            let restored = cache.restore(path).await;
            if enable_logging {
                match restored {
                    Ok(Some(count)) => {
                        info!(path = %path.display(), records = count, "DNS cache restored")
                    }
                    Ok(None) => {
                        info!(path = %path.display(), "No DNS cache snapshot, starting empty")
                    }
                    Err(e) => warn!(error = %e, "DNS cache restore failed, starting empty"),
                }
            }
        }

        let sweeper = spawn_sweeper(Arc::clone(&cache), self.options.sweep_interval, enable_logging);

        tokio::pin!(shutdown);
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // e.g. ICMP port unreachable surfaced on some platforms
                            if enable_logging {
                                warn!(error = %e, "DNS receive failed");
                            }
                            continue;
                        }
                    };
                    buf.truncate(len);

                    if enable_logging {
                        debug!(bytes = len, client = %src, "DNS query received");
                    }

                    let socket = Arc::clone(&self.socket);
                    let resolver = Arc::clone(&self.resolver);
                    tokio::spawn(async move {
                        match handle_dns_query(&resolver, &buf, src, enable_logging).await {
                            Ok(response) => {
                                if let Err(e) = socket.send_to(&response, src).await {
                                    if enable_logging {
                                        error!(client = %src, error = %e, "DNS failed to send response");
                                    }
                                } else if enable_logging {
                                    debug!(bytes = response.len(), client = %src, "DNS response sent");
                                }
                            }
                            Err(e) => {
                                // Dropped: the client retries on its own timeout
                                if enable_logging {
                                    warn!(client = %src, error = %e, "DNS query dropped");
                                }
                            }
                        }
                    });
                }
            }
        }

        sweeper.abort();
        if enable_logging {
            info!("DNS server shutting down");
        }

        if let Some(path) = &self.options.backup_file {
            let persisted = cache.persist(path).await;
            if enable_logging {
                match persisted {
                    Ok(count) => info!(path = %path.display(), records = count, "DNS cache saved"),
                    Err(e) => error!(error = %e, "DNS cache persist failed"),
                }
            }
        }

        Ok(())
    }
}

fn spawn_sweeper(cache: Arc<RecordCache>, period: Duration, enable_logging: bool) -> JoinHandle<()> {
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let removed = cache.sweep().await;
            if enable_logging && removed > 0 {
                info!(removed = removed, "DNS cache swept expired records");
            }
        }
    })
}

/// Decode, resolve, and encode one query.
/// Made public for testing with mock upstreams.
pub async fn handle_dns_query<U: Upstream>(
    resolver: &Resolver<U>,
    query_buf: &[u8],
    client: SocketAddr,
    enable_logging: bool,
) -> std::result::Result<Vec<u8>, DnsError> {
    let query = Message::decode(query_buf)?;
    if query.is_response() || query.flags.opcode() != OPCODE_QUERY {
        return Err(DnsError::malformed("not a standard query"));
    }

    if enable_logging {
        if let Some(question) = query.first_question() {
            info!(
                id = query.id,
                client = %client,
                name = %question.name,
                qtype = %question.qtype,
                "DNS query"
            );
        }
    }

    let response = resolver.resolve(query_buf, &query).await?;
    response.encode()
}

/// Parse `ip:port`, or a bare IP with the DNS port
fn parse_server_addr(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ServerError::Config(format!("invalid nameserver address: {}", s)))
}

/// Build the resolution strategy selected by the configuration
pub fn strategy_from_config(config: &DnsConfig) -> Result<Strategy> {
    match config.strategy {
        ResolutionMode::Forward => Ok(Strategy::Forward {
            upstream: parse_server_addr(&config.upstream)?,
        }),
        ResolutionMode::Iterative => {
            if config.max_hops == 0 {
                return Err(ServerError::Config("max_hops must be at least 1".to_string()));
            }
            let root_servers = if config.root_servers.is_empty() {
                root_server_addrs()
            } else {
                config
                    .root_servers
                    .iter()
                    .map(|s| parse_server_addr(s.as_str()))
                    .collect::<Result<Vec<_>>>()?
            };
            Ok(Strategy::Iterative {
                root_servers,
                max_hops: config.max_hops,
            })
        }
    }
}

/// Run the DNS server described by `config` until `shutdown` completes
pub async fn run_dns_server<F>(config: &DnsConfig, enable_logging: bool, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listen_addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|_| ServerError::Config(format!("invalid listen address: {}", config.listen)))?;
    if config.cache.sweep_interval_seconds == 0 {
        return Err(ServerError::Config(
            "sweep_interval_seconds must be at least 1".to_string(),
        ));
    }
    let strategy = strategy_from_config(config)?;

    let cache = Arc::new(RecordCache::with_max_ttl(config.cache.max_ttl_seconds));
    let resolver = Resolver::new(
        UdpUpstream::new(config.verify_upstream_source),
        cache,
        strategy,
        Duration::from_millis(config.timeout_ms),
    )
    .with_logging(enable_logging);

    let options = ServerOptions {
        sweep_interval: Duration::from_secs(config.cache.sweep_interval_seconds),
        backup_file: config.cache.backup_file.as_ref().map(PathBuf::from),
        enable_logging,
    };

    let server = DnsServer::bind(listen_addr, resolver, options).await?;

    if enable_logging {
        info!(
            listen = %server.local_addr()?,
            strategy = %server.resolver.strategy(),
            timeout_ms = config.timeout_ms,
            backup_file = ?config.cache.backup_file,
            "DNS server started"
        );
    }

    server.serve(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::testing::MockUpstream;
    use crate::dns::wire::{builder, RecordType, ResponseCode};
    use std::net::Ipv4Addr;

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn resolver(upstream: MockUpstream) -> Resolver<MockUpstream> {
        Resolver::new(
            upstream,
            Arc::new(RecordCache::new()),
            Strategy::Forward {
                upstream: "192.0.2.1:53".parse().unwrap(),
            },
            Duration::from_secs(1),
        )
        .with_logging(false)
    }

    fn answering() -> MockUpstream {
        MockUpstream::new(|q, _| {
            Ok(Message::response_to(
                q,
                vec![builder::a_record("example.com", Ipv4Addr::new(1, 2, 3, 4), 300)],
            ))
        })
    }

    #[tokio::test]
    async fn test_handle_query_success() {
        let resolver = resolver(answering());
        let query = builder::build_query("example.com", RecordType::A, 0x1234);

        let response = handle_dns_query(&resolver, &query, client(), false).await.unwrap();
        let parsed = Message::decode(&response).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert!(parsed.is_response());
        assert_eq!(parsed.response_code(), ResponseCode::NoError);
        assert_eq!(parsed.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_query_garbage() {
        let resolver = resolver(answering());
        let result = handle_dns_query(&resolver, &[0xFF; 7], client(), false).await;
        assert!(matches!(result, Err(DnsError::MalformedMessage(_))));
        assert_eq!(resolver.cache().len().await, 0);
    }

    #[tokio::test]
    async fn test_handle_query_rejects_response_packets() {
        let resolver = resolver(answering());
        let packet = builder::build_response("example.com", Ipv4Addr::new(1, 1, 1, 1), 1, 60);
        let result = handle_dns_query(&resolver, &packet, client(), false).await;
        assert!(matches!(result, Err(DnsError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_handle_query_compression_cycle() {
        let resolver = resolver(answering());
        let mut packet = builder::header(0x0001, 0x0100, [1, 0, 0, 0]);
        packet.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);

        let result = handle_dns_query(&resolver, &packet, client(), false).await;
        assert_eq!(result, Err(DnsError::CompressionCycle { offset: 12 }));
    }

    #[tokio::test]
    async fn test_handle_query_upstream_down() {
        let resolver = resolver(MockUpstream::always_fail());
        let query = builder::build_query("example.com", RecordType::A, 2);
        let result = handle_dns_query(&resolver, &query, client(), false).await;
        assert!(matches!(result, Err(DnsError::UpstreamUnavailable(_))));
    }

    #[test]
    fn test_parse_server_addr() {
        assert_eq!(
            parse_server_addr("8.8.8.8:5353").unwrap(),
            "8.8.8.8:5353".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_addr("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_addr("2606:4700::1111").unwrap(),
            "[2606:4700::1111]:53".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_server_addr("dns.example"),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_strategy_from_config() {
        let mut config = DnsConfig::default();
        assert_eq!(
            strategy_from_config(&config).unwrap(),
            Strategy::Forward {
                upstream: "1.1.1.1:53".parse().unwrap()
            }
        );

        config.strategy = ResolutionMode::Iterative;
        match strategy_from_config(&config).unwrap() {
            Strategy::Iterative {
                root_servers,
                max_hops,
            } => {
                assert_eq!(root_servers.len(), 13);
                assert_eq!(max_hops, 15);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        config.root_servers = vec!["127.0.0.1:5300".to_string()];
        match strategy_from_config(&config).unwrap() {
            Strategy::Iterative { root_servers, .. } => {
                assert_eq!(root_servers, vec!["127.0.0.1:5300".parse().unwrap()]);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        config.max_hops = 0;
        assert!(matches!(
            strategy_from_config(&config),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_bad_listen_addr() {
        let config = DnsConfig {
            listen: "not-an-address".to_string(),
            ..DnsConfig::default()
        };
        let result = run_dns_server(&config, false, async {}).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}

//! Iterative resolution: walk the delegation chain from the root servers.

use crate::dns::resolver::{parse_reply, Upstream};
use crate::dns::wire::{Message, Question, RecordType, ResponseCode};
use crate::error::DnsError;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

/// Delegation hops allowed before giving up
pub const DEFAULT_MAX_HOPS: usize = 15;

pub const DNS_PORT: u16 = 53;

/// IANA root server IPv4 addresses (a through m)
pub const ROOT_SERVERS: [Ipv4Addr; 13] = [
    Ipv4Addr::new(198, 41, 0, 4),
    Ipv4Addr::new(170, 247, 170, 2),
    Ipv4Addr::new(192, 33, 4, 12),
    Ipv4Addr::new(199, 7, 91, 13),
    Ipv4Addr::new(192, 203, 230, 10),
    Ipv4Addr::new(192, 5, 5, 241),
    Ipv4Addr::new(192, 112, 36, 4),
    Ipv4Addr::new(198, 97, 190, 53),
    Ipv4Addr::new(192, 36, 148, 17),
    Ipv4Addr::new(192, 58, 128, 30),
    Ipv4Addr::new(193, 0, 14, 129),
    Ipv4Addr::new(199, 7, 83, 42),
    Ipv4Addr::new(202, 12, 27, 33),
];

/// Root servers as socket addresses on the DNS port
pub fn root_server_addrs() -> Vec<SocketAddr> {
    ROOT_SERVERS
        .iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(*ip), DNS_PORT))
        .collect()
}

/// What a nameserver's reply means for the walk
#[derive(Debug, PartialEq)]
enum Step {
    /// Terminal: answers, NXDOMAIN, or an authoritative empty reply
    Answer,
    /// Continue with these nameservers
    Referral(Vec<SocketAddr>),
    /// Nothing usable from this server; try the next candidate
    Unusable,
}

/// Resolve `question` starting from `root_servers`.
///
/// Each hop queries the current candidates in order. A server that errors,
/// times out, or gives no usable delegation is dropped and the next one is
/// tried; a referral with glue replaces the candidate set and starts the
/// next hop.
pub async fn resolve<U: Upstream>(
    upstream: &U,
    question: &Question,
    root_servers: &[SocketAddr],
    max_hops: usize,
    timeout: Duration,
    enable_logging: bool,
) -> Result<Message, DnsError> {
    // One id and one encoded query for the whole walk
    let query = Message::query(fastrand::u16(..), question.clone(), false);
    let query_buf = query.encode()?;

    let mut candidates: VecDeque<SocketAddr> = root_servers.iter().copied().collect();

    for hop in 0..max_hops {
        let next = loop {
            let Some(server) = candidates.pop_front() else {
                if enable_logging {
                    warn!(name = %question.name, hop = hop, "DNS nameservers exhausted");
                }
                return Err(DnsError::ResolutionExhausted);
            };

            let reply = match upstream.exchange(&query_buf, server, timeout).await {
                Ok(buf) => parse_reply(&buf, query.id),
                Err(e) => Err(e),
            };

            match reply {
                Ok(reply) => match classify(&reply) {
                    Step::Answer => return Ok(reply),
                    Step::Referral(servers) => break servers,
                    Step::Unusable => {
                        if enable_logging {
                            debug!(
                                server = %server,
                                rcode = ?reply.response_code(),
                                "DNS nameserver gave no usable delegation"
                            );
                        }
                    }
                },
                Err(e) => {
                    if enable_logging {
                        warn!(server = %server, error = %e, "DNS nameserver failed");
                    }
                }
            }
        };

        if enable_logging {
            debug!(
                name = %question.name,
                hop = hop + 1,
                nameservers = next.len(),
                "DNS following delegation"
            );
        }
        candidates = next.into();
    }

    if enable_logging {
        warn!(name = %question.name, max_hops = max_hops, "DNS delegation too deep");
    }
    Err(DnsError::ResolutionDepthExceeded(max_hops))
}

fn classify(reply: &Message) -> Step {
    if !reply.answers.is_empty() {
        return Step::Answer;
    }
    match reply.response_code() {
        ResponseCode::NxDomain => return Step::Answer,
        ResponseCode::NoError => {}
        _ => return Step::Unusable,
    }
    let glue = glue_addresses(reply);
    if !glue.is_empty() {
        return Step::Referral(glue);
    }
    if reply.flags.is_authoritative() {
        // NODATA from the zone's authority
        return Step::Answer;
    }
    Step::Unusable
}

/// Addresses of the delegated nameservers found in the additional section.
/// IPv4 glue comes first.
fn glue_addresses(reply: &Message) -> Vec<SocketAddr> {
    let nameservers: Vec<_> = reply
        .authorities
        .iter()
        .filter(|r| r.rtype == RecordType::NS)
        .filter_map(|r| r.target_name())
        .collect();

    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for record in &reply.additionals {
        if !nameservers.iter().any(|ns| ns.eq_ignore_case(&record.name)) {
            continue;
        }
        let addr = if let Some(ip) = record.ipv4() {
            SocketAddr::new(IpAddr::V4(ip), DNS_PORT)
        } else if let Some(ip) = record.ipv6() {
            SocketAddr::new(IpAddr::V6(ip), DNS_PORT)
        } else {
            continue;
        };
        let list = if addr.is_ipv4() { &mut v4 } else { &mut v6 };
        if !list.contains(&addr) {
            list.push(addr);
        }
    }
    v4.extend(v6);
    v4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::testing::MockUpstream;
    use crate::dns::wire::{builder, Flags, RecordClass, ResourceRecord};
    use std::net::Ipv6Addr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn question() -> Question {
        Question::new(builder::name("www.example.com"), RecordType::A)
    }

    /// Referral to `ns` with one IPv4 glue record
    fn referral(q: &Message, zone: &str, ns: &str, glue: Ipv4Addr) -> Message {
        let mut reply = Message::response_to(q, Vec::new());
        reply
            .authorities
            .push(builder::name_record(zone, RecordType::NS, ns, 172800));
        reply.additionals.push(builder::a_record(ns, glue, 172800));
        reply
    }

    #[tokio::test]
    async fn test_follows_referral_to_answer() {
        let upstream = MockUpstream::new(|q, server| {
            if server == addr("198.41.0.4:53") {
                Ok(referral(q, "com", "a.gtld-servers.net", Ipv4Addr::new(192, 5, 6, 30)))
            } else if server == addr("192.5.6.30:53") {
                Ok(referral(q, "example.com", "ns1.example.com", Ipv4Addr::new(10, 0, 0, 1)))
            } else {
                assert!(!q.flags.recursion_desired());
                Ok(Message::response_to(
                    q,
                    vec![builder::a_record("www.example.com", Ipv4Addr::new(1, 2, 3, 4), 300)],
                ))
            }
        });

        let reply = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await
        .unwrap();

        assert_eq!(reply.answers[0].ipv4(), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(
            upstream.servers(),
            vec![
                addr("198.41.0.4:53"),
                addr("192.5.6.30:53"),
                addr("10.0.0.1:53")
            ]
        );
    }

    #[tokio::test]
    async fn test_depth_exceeded() {
        // Every server refers to another one, forever
        let upstream = MockUpstream::new(|q, _| {
            Ok(referral(q, "example.com", "ns.example.com", Ipv4Addr::new(10, 0, 0, 1)))
        });

        let result = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await;

        assert_eq!(result, Err(DnsError::ResolutionDepthExceeded(15)));
        assert_eq!(upstream.calls(), 15);
    }

    #[tokio::test]
    async fn test_failed_server_removed() {
        let upstream = MockUpstream::new(|q, server| {
            if server == addr("198.41.0.4:53") {
                Err(DnsError::UpstreamUnavailable("timeout".to_string()))
            } else {
                Ok(Message::response_to(
                    q,
                    vec![builder::a_record("www.example.com", Ipv4Addr::new(1, 2, 3, 4), 300)],
                ))
            }
        });

        let reply = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53"), addr("192.33.4.12:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await
        .unwrap();

        assert_eq!(reply.answers.len(), 1);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_servers_fail_exhausted() {
        let upstream = MockUpstream::always_fail();

        let result = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53"), addr("192.33.4.12:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await;

        assert_eq!(result, Err(DnsError::ResolutionExhausted));
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_referral_without_glue_is_unusable() {
        let upstream = MockUpstream::new(|q, _| {
            let mut reply = Message::response_to(q, Vec::new());
            reply
                .authorities
                .push(builder::name_record("example.com", RecordType::NS, "ns.elsewhere.net", 3600));
            Ok(reply)
        });

        let result = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await;

        assert_eq!(result, Err(DnsError::ResolutionExhausted));
    }

    #[tokio::test]
    async fn test_nxdomain_is_terminal() {
        let upstream = MockUpstream::new(|q, _| {
            let mut reply = Message::response_to(q, Vec::new());
            reply.flags = reply.flags.with_response_code(ResponseCode::NxDomain);
            Ok(reply)
        });

        let reply = resolve(
            &upstream,
            &question(),
            &[addr("198.41.0.4:53")],
            DEFAULT_MAX_HOPS,
            Duration::from_secs(2),
            false,
        )
        .await
        .unwrap();

        assert_eq!(reply.response_code(), ResponseCode::NxDomain);
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn test_glue_matches_ns_names_only() {
        let q = Message::query(1, question(), false);
        let mut reply = referral(&q, "example.com", "NS1.example.com", Ipv4Addr::new(10, 0, 0, 1));
        reply
            .additionals
            .push(builder::a_record("unrelated.example.org", Ipv4Addr::new(10, 9, 9, 9), 60));
        reply.additionals.push(ResourceRecord {
            name: builder::name("ns1.example.com"),
            rtype: RecordType::AAAA,
            rclass: RecordClass::IN,
            ttl: 60,
            rdata: Ipv6Addr::LOCALHOST.octets().to_vec(),
        });
        reply
            .additionals
            .push(builder::a_record("ns1.example.com", Ipv4Addr::new(10, 0, 0, 1), 60));

        assert_eq!(
            glue_addresses(&reply),
            vec![addr("10.0.0.1:53"), addr("[::1]:53")]
        );
    }

    #[test]
    fn test_classify_authoritative_nodata() {
        let q = Message::query(1, question(), false);
        let mut reply = Message::response_to(&q, Vec::new());
        assert_eq!(classify(&reply), Step::Unusable);

        reply.flags = Flags::from_bits(reply.flags.bits() | 0x0400);
        assert_eq!(classify(&reply), Step::Answer);
    }

    #[test]
    fn test_root_server_addrs() {
        let roots = root_server_addrs();
        assert_eq!(roots.len(), 13);
        assert!(roots.iter().all(|a| a.port() == DNS_PORT));
        assert_eq!(roots[0], addr("198.41.0.4:53"));
    }
}

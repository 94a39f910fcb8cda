//! Forwarder configuration

use crate::error::{DnsError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default cache capacity when the user passes 0.
pub const DEFAULT_CACHE_CAPACITY: usize = 65536;

/// Maximum live TLS connections kept per upstream.
pub const CONNECTIONS_PER_UPSTREAM: usize = 5;

/// Deadline applied to a single upstream exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the background refresh queue.
pub const REFRESH_QUEUE_SIZE: usize = 2048;

/// Forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Listen address, bound on both UDP and TCP
    pub listen: SocketAddr,

    /// Upstream DNS-over-TLS servers
    pub upstreams: Vec<Upstream>,

    /// Response cache capacity; `None` disables caching
    pub cache_capacity: Option<usize>,

    /// Optional HTTP debug endpoint address
    pub debug_listen: Option<SocketAddr>,

    /// Maximum live connections per upstream
    pub connections_per_upstream: usize,

    /// Deadline for one upstream exchange
    pub exchange_timeout: Duration,

    /// Refresh queue capacity
    pub refresh_queue_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53),
            upstreams: default_upstreams(),
            cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
            debug_listen: None,
            connections_per_upstream: CONNECTIONS_PER_UPSTREAM,
            exchange_timeout: EXCHANGE_TIMEOUT,
            refresh_queue_size: REFRESH_QUEUE_SIZE,
        }
    }
}

impl ForwarderConfig {
    /// Build a configuration from raw CLI values.
    ///
    /// An empty upstream list falls back to Cloudflare and Google public
    /// resolvers. `cache_size` follows the historical convention: 0 means
    /// the default capacity, a negative value disables caching.
    pub fn from_cli(
        listen: SocketAddr,
        upstream_addrs: &[String],
        cache_size: i64,
        debug_listen: Option<SocketAddr>,
    ) -> Result<Self> {
        let upstreams = if upstream_addrs.is_empty() {
            default_upstreams()
        } else {
            upstream_addrs
                .iter()
                .map(|s| Upstream::parse(s))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            listen,
            upstreams,
            cache_capacity: cache_capacity_from(cache_size),
            debug_listen,
            ..Self::default()
        })
    }
}

/// Map the user-facing cache size to an effective capacity.
pub fn cache_capacity_from(raw: i64) -> Option<usize> {
    match raw {
        0 => Some(DEFAULT_CACHE_CAPACITY),
        n if n < 0 => None,
        n => Some(n as usize),
    }
}

fn default_upstreams() -> Vec<Upstream> {
    vec![
        Upstream::parse("one.one.one.one:853@1.1.1.1").expect("default upstream"),
        Upstream::parse("dns.google:853@8.8.8.8").expect("default upstream"),
    ]
}

/// One upstream DNS-over-TLS server.
///
/// `server_name` is used for SNI and certificate verification;
/// `dial_addr` is the `host:port` the TCP connection actually targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    /// TLS server name (SNI / certificate subject)
    pub server_name: String,
    /// Endpoint to dial, as `host:port`
    pub dial_addr: String,
}

impl Upstream {
    /// Parse an upstream address.
    ///
    /// Accepted forms:
    /// - `host:port`: dial `host:port`, verify the certificate against `host`
    /// - `servername:port@ip`: dial `ip:port`, verify against `servername`
    /// - `servername:port@ip:port2`: dial `ip:port2`, verify against `servername`
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((name_part, dial_part)) = s.split_once('@') {
            let (server_name, port) = split_host_port(name_part)
                .ok_or_else(|| DnsError::InvalidUpstreamAddress(s.to_string()))?;
            if dial_part.is_empty() {
                return Err(DnsError::InvalidUpstreamAddress(s.to_string()));
            }
            let dial_addr = match dial_part.rsplit_once(':') {
                Some((host, p)) if !host.is_empty() && p.parse::<u16>().is_ok() => {
                    dial_part.to_string()
                }
                _ => format!("{}:{}", dial_part, port),
            };
            Ok(Self {
                server_name,
                dial_addr,
            })
        } else {
            let (server_name, _port) = split_host_port(s)
                .ok_or_else(|| DnsError::InvalidUpstreamAddress(s.to_string()))?;
            Ok(Self {
                server_name,
                dial_addr: s.to_string(),
            })
        }
    }
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port_str) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port_str.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

//! DNS listener and request handler
//!
//! The same address is bound on UDP and TCP; both feed the resolver. A
//! failed resolution is answered with SERVFAIL so clients always get a
//! reply.

use crate::cache::MessageCache;
use crate::clock::Clock;
use crate::config::ForwarderConfig;
use crate::debug::DebugServer;
use crate::error::{DnsError, Result};
use crate::pool::{Connect, Pool, TlsConnect};
use crate::resolver::Resolver;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Caching DNS forwarder.
///
/// Construct with [`Forwarder::new`], then call [`Forwarder::run`]; the
/// forwarder stops when the handle returned by
/// [`Forwarder::shutdown_handle`] fires.
pub struct Forwarder {
    config: ForwarderConfig,
    clock: Clock,
    cache: Option<Arc<MessageCache>>,
    resolver: Arc<Resolver>,
    pools: Vec<Arc<Pool>>,
    refresh_rx: Option<mpsc::Receiver<Message>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Forwarder {
    /// Build the forwarder: cache, one TLS pool per upstream, refresh
    /// queue, and resolver. Nothing is bound until [`Forwarder::run`].
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        let clock = Clock::new();

        let cache = match config.cache_capacity {
            Some(capacity) => Some(Arc::new(MessageCache::new(capacity)?)),
            None => None,
        };

        let mut pools = Vec::with_capacity(config.upstreams.len());
        for upstream in &config.upstreams {
            let connector = Arc::new(TlsConnect::new(upstream)?) as Arc<dyn Connect>;
            pools.push(Arc::new(Pool::new(
                config.connections_per_upstream,
                connector,
            )));
        }

        let (refresh_tx, refresh_rx) = mpsc::channel(config.refresh_queue_size);
        let resolver = Arc::new(Resolver::new(
            cache.clone(),
            pools.clone(),
            refresh_tx,
            clock.clone(),
            config.exchange_timeout,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            clock,
            cache,
            resolver,
            pools,
            refresh_rx: Some(refresh_rx),
            shutdown_tx,
        })
    }

    /// Handle used to stop the forwarder from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind both listeners and serve until shutdown.
    ///
    /// Binding failures are fatal and returned to the caller.
    pub async fn run(mut self) -> Result<()> {
        let udp = Arc::new(UdpSocket::bind(self.config.listen).await?);
        let tcp = TcpListener::bind(self.config.listen).await?;
        let started = std::time::Instant::now();
        info!("DNS over TLS forwarder listening on {}", self.config.listen);

        tokio::spawn(self.clock.clone().run(self.shutdown_tx.subscribe()));

        let refresh_rx = self.refresh_rx.take().expect("run is called once");
        tokio::spawn(
            self.resolver
                .clone()
                .run_refresher(refresh_rx, self.shutdown_tx.subscribe()),
        );

        if let Some(addr) = self.config.debug_listen {
            let debug_server = DebugServer::new(addr, self.cache.clone(), started);
            tokio::spawn(debug_server.run(self.shutdown_tx.subscribe()));
        }

        let udp_task = tokio::spawn(serve_udp(
            udp,
            self.resolver.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let tcp_task = tokio::spawn(serve_tcp(
            tcp,
            self.resolver.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("forwarder shutting down");
            }
            _ = udp_task => {
                warn!("UDP listener stopped unexpectedly");
            }
            _ = tcp_task => {
                warn!("TCP listener stopped unexpectedly");
            }
        }

        for pool in &self.pools {
            pool.shutdown();
        }
        Ok(())
    }
}

async fn serve_udp(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => {
                    let data = buf[..len].to_vec();
                    let socket = socket.clone();
                    let resolver = resolver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_udp_query(&socket, &resolver, &data, peer).await {
                            debug!("UDP query error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("UDP recv error: {}", e);
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let resolver = resolver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp_connection(stream, &resolver, peer).await {
                            debug!("TCP connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn handle_udp_query(
    socket: &UdpSocket,
    resolver: &Resolver,
    data: &[u8],
    peer: SocketAddr,
) -> Result<()> {
    let query = Message::from_bytes(data).map_err(|e| DnsError::Proto(e.to_string()))?;
    if let Some(question) = query.queries().first() {
        debug!("question from {}: {}", peer, question);
    }
    let response = answer(resolver, &query).await;
    let wire = response.to_vec()?;
    socket.send_to(&wire, peer).await?;
    Ok(())
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    resolver: &Resolver,
    peer: SocketAddr,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // connection closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let query = Message::from_bytes(&body).map_err(|e| DnsError::Proto(e.to_string()))?;
        if let Some(question) = query.queries().first() {
            debug!("question from {}: {}", peer, question);
        }
        let response = answer(resolver, &query).await;
        let wire = response.to_vec()?;
        stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
        stream.write_all(&wire).await?;
    }
}

async fn answer(resolver: &Resolver, query: &Message) -> Message {
    match resolver.resolve(query).await {
        Ok(response) => response,
        Err(e) => {
            debug!("resolution failed: {}", e);
            servfail(query)
        }
    }
}

/// Server-failure reply echoing the query's id and questions.
fn servfail(query: &Message) -> Message {
    let mut m = Message::new();
    m.set_id(query.id());
    m.set_message_type(MessageType::Response);
    m.set_op_code(query.op_code());
    m.set_recursion_desired(query.recursion_desired());
    m.set_recursion_available(true);
    m.set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        m.add_query(q.clone());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(name: &str, id: u16) -> Message {
        let mut m = Message::new();
        m.set_id(id);
        m.set_message_type(MessageType::Query);
        m.set_op_code(OpCode::Query);
        m.set_recursion_desired(true);
        m.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        m
    }

    #[test]
    fn test_servfail_echoes_query() {
        let q = query("fail.example.", 0xbeef);
        let m = servfail(&q);
        assert_eq!(m.id(), 0xbeef);
        assert_eq!(m.response_code(), ResponseCode::ServFail);
        assert_eq!(m.message_type(), MessageType::Response);
        assert_eq!(m.queries().len(), 1);
        assert_eq!(m.queries()[0].name(), q.queries()[0].name());
        assert!(m.answers().is_empty());
    }

    #[test]
    fn test_forwarder_construction() {
        let config = ForwarderConfig {
            listen: "127.0.0.1:15353".parse().unwrap(),
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config).unwrap();
        assert_eq!(forwarder.pools.len(), 2);
        assert!(forwarder.cache.is_some());
    }

    #[test]
    fn test_forwarder_without_cache() {
        let config = ForwarderConfig {
            listen: "127.0.0.1:15354".parse().unwrap(),
            cache_capacity: None,
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config).unwrap();
        assert!(forwarder.cache.is_none());
    }

    #[tokio::test]
    async fn test_run_binds_and_shuts_down() {
        let config = ForwarderConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config).unwrap();
        let shutdown = forwarder.shutdown_handle();

        let run = tokio::spawn(forwarder.run());
        // Keep signaling until the listeners have subscribed and stopped.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !run.is_finished() && tokio::time::Instant::now() < deadline {
            let _ = shutdown.send(());
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(run.is_finished(), "run should stop on shutdown");
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let config = ForwarderConfig {
            // Port 1 is privileged and already unusable in test sandboxes;
            // binding an address that is not local fails immediately.
            listen: "192.0.2.1:53".parse().unwrap(),
            ..ForwarderConfig::default()
        };
        let forwarder = Forwarder::new(config).unwrap();
        assert!(forwarder.run().await.is_err());
    }
}

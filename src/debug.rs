//! HTTP debug endpoint
//!
//! Serves one JSON document with cache counters and uptime. Read-only;
//! intended for local inspection, not exposed by default.

use crate::cache::{CacheMetrics, MessageCache};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Snapshot served by the endpoint.
#[derive(Debug, Serialize)]
struct DebugStats {
    cache_metrics: CacheMetrics,
    cache_len: usize,
    cache_cap: usize,
    uptime: String,
}

/// Debug endpoint server.
pub struct DebugServer {
    listen: SocketAddr,
    cache: Option<Arc<MessageCache>>,
    started: Instant,
}

impl DebugServer {
    pub fn new(listen: SocketAddr, cache: Option<Arc<MessageCache>>, started: Instant) -> Self {
        Self {
            listen,
            cache,
            started,
        }
    }

    fn stats(&self) -> DebugStats {
        let (cache_metrics, cache_len, cache_cap) = match &self.cache {
            Some(cache) => (cache.metrics(), cache.len(), cache.cap()),
            None => (CacheMetrics::default(), 0, 0),
        };
        DebugStats {
            cache_metrics,
            cache_len,
            cache_cap,
            uptime: format!("{:?}", self.started.elapsed()),
        }
    }

    fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::from("Method Not Allowed")))
                .expect("static response");
        }
        match serde_json::to_vec_pretty(&self.stats()) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .expect("static response"),
            Err(e) => {
                error!("failed to serialize debug stats: {}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("Unable to retrieve debug info")))
                    .expect("static response")
            }
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind debug endpoint on {}: {}", self.listen, e);
                return;
            }
        };
        info!("debug endpoint listening on http://{}", self.listen);

        let this = Arc::new(self);
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let this = this.clone();
                                async move {
                                    Ok::<_, hyper::Error>(this.handle(&req))
                                }
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("debug connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("debug accept error: {}", e);
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn populated_cache() -> Arc<MessageCache> {
        let cache = Arc::new(MessageCache::new(32).unwrap());
        let mut q = Message::new();
        q.set_id(1);
        q.set_message_type(MessageType::Query);
        q.set_op_code(OpCode::Query);
        q.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let mut resp = q.clone();
        resp.set_message_type(MessageType::Response);
        resp.add_answer(Record::from_rdata(
            q.queries()[0].name().clone(),
            300,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
        ));
        let now = tokio::time::Instant::now();
        cache.put(&q, &resp, now);
        let _ = cache.get(&q, now);
        cache
    }

    #[test]
    fn test_stats_payload_fields() {
        let server = DebugServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Some(populated_cache()),
            Instant::now(),
        );
        let value = serde_json::to_value(server.stats()).unwrap();
        assert_eq!(value["cache_len"], 1);
        assert_eq!(value["cache_cap"], 32);
        assert_eq!(value["cache_metrics"]["hits"], 1);
        assert_eq!(value["cache_metrics"]["misses"], 0);
        assert_eq!(value["cache_metrics"]["evictions"], 0);
        assert!(value["uptime"].is_string());
    }

    #[test]
    fn test_stats_without_cache() {
        let server = DebugServer::new("127.0.0.1:0".parse().unwrap(), None, Instant::now());
        let value = serde_json::to_value(server.stats()).unwrap();
        assert_eq!(value["cache_len"], 0);
        assert_eq!(value["cache_cap"], 0);
    }

    #[test]
    fn test_handle_rejects_non_get() {
        let server = DebugServer::new("127.0.0.1:0".parse().unwrap(), None, Instant::now());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(())
            .unwrap();
        let resp = server.handle(&req);
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(())
            .unwrap();
        let resp = server.handle(&req);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["Content-Type"].to_str().unwrap(),
            "application/json"
        );
    }
}

//! Query resolution pipeline
//!
//! Cache first; expired entries are answered immediately and refreshed in
//! the background; misses fan out to every upstream pool at once, the
//! first response wins, and the winner is cached.

use crate::cache::{Lookup, MessageCache};
use crate::client::exchange;
use crate::clock::Clock;
use crate::error::{DnsError, Result};
use crate::pool::Pool;
use hickory_proto::op::Message;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tracing::{debug, trace, warn};

/// Total `forward_once` attempts per query: one try plus two retries.
const FORWARD_ATTEMPTS: usize = 3;

/// Resolves queries against the upstream pools through the cache.
pub struct Resolver {
    cache: Option<Arc<MessageCache>>,
    pools: Vec<Arc<Pool>>,
    refresh_tx: mpsc::Sender<Message>,
    clock: Clock,
    exchange_timeout: Duration,
}

impl Resolver {
    pub fn new(
        cache: Option<Arc<MessageCache>>,
        pools: Vec<Arc<Pool>>,
        refresh_tx: mpsc::Sender<Message>,
        clock: Clock,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            pools,
            refresh_tx,
            clock,
            exchange_timeout,
        }
    }

    /// Resolve one query.
    ///
    /// A fresh cache entry is returned as-is; an expired one is returned
    /// with a short TTL while a background refresh is scheduled; a miss
    /// forwards upstream and caches the answer.
    pub async fn resolve(&self, query: &Message) -> Result<Message> {
        if let Some(cache) = &self.cache {
            match cache.get(query, self.clock.now()) {
                Lookup::Hit(msg) => return Ok(msg),
                Lookup::Stale(msg) => {
                    self.schedule_refresh(query);
                    return Ok(msg);
                }
                Lookup::Miss => {}
            }
        }
        self.forward_and_cache(query).await
    }

    /// Queue `query` for a background refresh without blocking.
    ///
    /// A full queue means refreshes are already piling up; dropping this
    /// one keeps serving the stale entry until a later lookup retries.
    fn schedule_refresh(&self, query: &Message) {
        if self.refresh_tx.try_send(query.clone()).is_err() {
            debug!("refresh queue full, dropping refresh");
        }
    }

    /// Forward with retries and cache a successful answer.
    pub(crate) async fn forward_and_cache(&self, query: &Message) -> Result<Message> {
        for attempt in 1..=FORWARD_ATTEMPTS {
            if let Some(response) = self.forward_once(query).await {
                if let Some(cache) = &self.cache {
                    cache.put(query, &response, self.clock.now());
                }
                return Ok(response);
            }
            trace!("forward attempt {}/{} failed", attempt, FORWARD_ATTEMPTS);
        }
        warn!("all upstream servers failed for query {}", query.id());
        Err(DnsError::AllUpstreamsFailed)
    }

    /// Issue one exchange per pool concurrently and take the first
    /// response to arrive. Later arrivals are discarded; their
    /// connections still return to their pools when the exchange
    /// completed cleanly.
    async fn forward_once(&self, query: &Message) -> Option<Message> {
        let (tx, mut rx) = mpsc::channel(self.pools.len().max(1));
        for pool in &self.pools {
            let pool = pool.clone();
            let clock = self.clock.clone();
            let query = query.clone();
            let tx = tx.clone();
            let timeout = self.exchange_timeout;
            tokio::spawn(async move {
                let result = exchange(&clock, &pool, &query, timeout).await;
                // The channel is sized to the pool count, so this never blocks.
                let _ = tx.send(result.ok()).await;
            });
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            if let Some(response) = result {
                return Some(response);
            }
        }
        None
    }

    /// Drain the refresh queue until shutdown.
    ///
    /// Runs as a single long-lived task; it never pushes back on the
    /// resolvers that enqueue refreshes.
    pub async fn run_refresher(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Message>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                query = queue.recv() => match query {
                    Some(query) => {
                        if let Err(e) = self.forward_and_cache(&query).await {
                            debug!("background refresh failed: {}", e);
                        }
                    }
                    None => return,
                },
                _ = shutdown.recv() => {
                    trace!("refresh worker stopped");
                    return;
                }
            }
        }
    }
}

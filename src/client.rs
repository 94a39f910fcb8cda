//! Single request/response exchange with an upstream
//!
//! DNS over TLS frames every message with a 2-byte length prefix
//! (RFC 7858), the same framing as DNS over TCP.

use crate::clock::Clock;
use crate::error::{DnsError, Result};
use crate::pool::{Pool, PooledConn};
use bytes::{BufMut, BytesMut};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Duration};
use tracing::debug;

/// Send `query` over a pooled connection and read one response.
///
/// The whole exchange runs under a deadline of `clock.now() + timeout`.
/// On success the connection goes back to the pool; any failure closes
/// and discards it.
pub async fn exchange(
    clock: &Clock,
    pool: &Pool,
    query: &Message,
    timeout: Duration,
) -> Result<Message> {
    let mut conn = pool.acquire().await?;
    let deadline = clock.now() + timeout;

    match timeout_at(deadline, roundtrip(&mut conn, query)).await {
        Ok(Ok(response)) => {
            pool.release(conn);
            Ok(response)
        }
        Ok(Err(e)) => {
            debug!("upstream exchange failed: {}", e);
            pool.discard(conn);
            Err(e)
        }
        Err(_) => {
            debug!("upstream exchange deadline exceeded");
            pool.discard(conn);
            Err(DnsError::DeadlineExceeded)
        }
    }
}

async fn roundtrip(conn: &mut PooledConn, query: &Message) -> Result<Message> {
    let wire = query.to_vec()?;
    let mut framed = BytesMut::with_capacity(2 + wire.len());
    framed.put_u16(wire.len() as u16);
    framed.put_slice(&wire);
    conn.write_all(&framed)
        .await
        .map_err(|e| DnsError::Write(e.to_string()))?;

    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf)
        .await
        .map_err(|e| DnsError::Read(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(DnsError::NilResponse);
    }

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body)
        .await
        .map_err(|e| DnsError::Read(e.to_string()))?;
    Message::from_bytes(&body).map_err(|e| DnsError::Proto(e.to_string()))
}

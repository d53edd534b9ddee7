//! Reliable channel: request/response over persistent TCP connections.
//!
//! Outbound traffic goes through a [`PeerPool`]: one checked-out connection
//! per in-flight request, so concurrent senders never interleave frames on
//! the same socket. Connections are re-dialled on demand and returned to the
//! pool after a successful exchange. Inbound traffic is one task per
//! accepted connection, dispatching each request frame to the node's
//! handler and writing the reply with the echoed correlation id.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};

use super::frame::{read_frame, write_frame, Frame, FrameError, OpCode};

/// 10 s per control message; block transfers pass a longer budget.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(60);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerPool {
    idle: DashMap<SocketAddr, Vec<TcpStream>>,
    correlation: AtomicU32,
    max_payload: u64,
}

impl PeerPool {
    pub fn new(max_payload: u64) -> Arc<Self> {
        Arc::new(Self {
            idle: DashMap::new(),
            correlation: AtomicU32::new(1),
            max_payload,
        })
    }

    fn next_correlation(&self) -> u32 {
        self.correlation.fetch_add(1, Ordering::Relaxed)
    }

    fn checkout(&self, addr: SocketAddr) -> Option<TcpStream> {
        self.idle.get_mut(&addr)?.pop()
    }

    fn checkin(&self, addr: SocketAddr, stream: TcpStream) {
        const MAX_IDLE_PER_PEER: usize = 4;
        let mut entry = self.idle.entry(addr).or_default();
        if entry.len() < MAX_IDLE_PER_PEER {
            entry.push(stream);
        }
    }

    /// Drops pooled connections to a peer, typically after it went offline.
    pub fn evict(&self, addr: SocketAddr) {
        self.idle.remove(&addr);
    }

    /// Sends one request and waits for its response. A pooled connection
    /// that turns out to be stale is replaced by a fresh dial once.
    pub async fn request(
        &self,
        addr: SocketAddr,
        op: OpCode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Frame> {
        let correlation = self.next_correlation();

        for attempt in 0..2 {
            let pooled = if attempt == 0 { self.checkout(addr) } else { None };
            let reused = pooled.is_some();
            let mut stream = match pooled {
                Some(stream) => stream,
                None => tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .with_context(|| format!("dial timeout to {addr}"))?
                    .with_context(|| format!("connecting to {addr}"))?,
            };

            let frame = Frame::new(op, correlation, payload.clone());
            let exchange = async {
                write_frame(&mut stream, &frame).await?;
                read_frame(&mut stream, self.max_payload).await
            };
            match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(reply)) => {
                    if reply.correlation != correlation {
                        bail!(
                            "peer {addr} answered correlation {} to request {}",
                            reply.correlation,
                            correlation
                        );
                    }
                    self.checkin(addr, stream);
                    return Ok(reply);
                }
                // A dead pooled socket surfaces as a closed or broken stream
                // on the next use; retry once on a fresh connection.
                Ok(Err(e)) => {
                    if reused {
                        tracing::debug!("pooled connection to {addr} was stale: {e}");
                        continue;
                    }
                    return Err(e).with_context(|| format!("exchange with {addr}"));
                }
                Err(_) => bail!("request to {addr} timed out after {timeout:?}"),
            }
        }
        bail!("peer {addr} closed the connection")
    }
}

/// Accept loop: one task per inbound connection. The handler returns the
/// reply frame (correlation already echoed); `None` means the request was a
/// protocol violation and the connection is closed.
pub async fn serve<F, Fut>(listener: TcpListener, max_payload: u64, handler: F) -> Result<()>
where
    F: Fn(SocketAddr, Frame) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Option<Frame>> + Send + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!("accepted reliable connection from {peer}");
        let handler = handler.clone();
        tokio::spawn(connection_loop(stream, peer, max_payload, handler));
    }
}

async fn connection_loop<F, Fut>(
    mut stream: TcpStream,
    peer: SocketAddr,
    max_payload: u64,
    handler: F,
) where
    F: Fn(SocketAddr, Frame) -> Fut,
    Fut: Future<Output = Option<Frame>>,
{
    loop {
        match read_frame(&mut stream, max_payload).await {
            Ok(frame) => match handler(peer, frame).await {
                Some(reply) => {
                    if let Err(e) = write_frame(&mut stream, &reply).await {
                        tracing::warn!("reply to {peer} failed: {e}");
                        break;
                    }
                }
                None => {
                    tracing::warn!("closing connection from {peer} after protocol violation");
                    break;
                }
            },
            Err(FrameError::Closed) => break,
            // Malformed frame or unexpected opcode: close the connection.
            Err(e) => {
                tracing::warn!("protocol error from {peer}: {e}");
                break;
            }
        }
    }
    tracing::debug!("reliable connection from {peer} closed");
}

//! Unreliable channel: heartbeat datagrams.
//!
//! One bincode-encoded [`Heartbeat`] per datagram. Loss is tolerated by
//! design; the failure detector only cares about the 9-second silence
//! window, not about individual packets.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use super::messages::Heartbeat;

#[derive(Clone)]
pub struct HeartbeatSocket {
    socket: Arc<UdpSocket>,
}

impl HeartbeatSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding heartbeat socket {addr}"))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, heartbeat: &Heartbeat, to: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(heartbeat)?;
        self.socket.send_to(&encoded, to).await?;
        Ok(())
    }

    /// Receives the next decodable heartbeat. Undecodable datagrams are
    /// logged and skipped; the channel is lossy anyway.
    pub async fn recv(&self) -> Result<(Heartbeat, SocketAddr)> {
        let mut buf = [0u8; 512];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            match bincode::deserialize::<Heartbeat>(&buf[..len]) {
                Ok(heartbeat) => return Ok((heartbeat, src)),
                Err(e) => {
                    tracing::debug!("discarding undecodable datagram from {src}: {e}");
                }
            }
        }
    }
}

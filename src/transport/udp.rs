use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, error, warn};

use crate::error::QueryError;
use crate::transport::{DatagramHandler, Transport};

/// [`Transport`] implementation on a single UDP socket, bound to an
/// ephemeral port by default.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_datagram_bytes: usize,
    closed: AtomicBool,
}

impl UdpTransport {
    pub async fn new(
        bind_addr: impl ToSocketAddrs,
        max_datagram_bytes: usize,
    ) -> Result<UdpTransport, QueryError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        debug!("bound query socket to {:?}", socket.local_addr()?);
        Ok(UdpTransport {
            socket,
            max_datagram_bytes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, QueryError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<(), QueryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueryError::Transport("socket is closed".to_string()));
        }
        if buf.len() > self.max_datagram_bytes {
            return Err(QueryError::PacketSizeLimitExceeded {
                limit: self.max_datagram_bytes,
                actual: buf.len(),
            });
        }
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        // one extra byte so a datagram truncated at the cap is detectable
        let mut buf = vec![0u8; self.max_datagram_bytes + 1];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    error!("socket error: {}", e);
                    continue;
                }
            };
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            if num_read > self.max_datagram_bytes {
                warn!(
                    "received a datagram above the size cap of {} bytes from {:?} - skipping",
                    self.max_datagram_bytes, from
                );
                continue;
            }
            handler.handle_datagram(&buf[..num_read], from).await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

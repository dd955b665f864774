pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::QueryError;

/// Abstraction over a datagram socket. One transport instance is shared by
/// all UDP protocol families; multiplexing happens above it, in the session
/// key.
///
/// The transport does not retransmit - UDP is fire-and-forget, and retry
/// policy belongs to the layers that know what a request means.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hands one datagram to the OS for transmission. Completes when the OS
    /// has accepted it, not when it arrives anywhere. Payloads above the
    /// datagram size cap are rejected with `PacketSizeLimitExceeded`.
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<(), QueryError>;

    /// Runs the receive loop, invoking `handler` with every inbound
    /// datagram until the transport is closed.
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()>;

    /// Idempotent. Future sends fail; the receive loop winds down with the
    /// next inbound datagram or socket error.
    fn close(&self);
}

/// This trait decouples receiving datagrams from handling them. It is passed
/// around as an `Arc<dyn ...>` to keep [`Transport`] implementations free of
/// engine dependencies.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn handle_datagram(&self, buf: &[u8], source: SocketAddr);
}

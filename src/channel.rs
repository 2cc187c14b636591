//! Multicast channels.
//!
//! A channel is a (query, reply) pair bound to one network interface: queries
//! go out to the multicast group and replies come back unicast to the
//! channel's reply address. The locator is generic over [`QueryChannel`] so the
//! protocol core can run over real UDP sockets ([`UdpChannel`]) or over an
//! in-memory bus in tests.
//!
//! [`MulticastListener`] is the responder-side counterpart that joins the
//! group and receives queries.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::locator::WeakLocator;
use crate::protocol::{Datagram, QueryMessage, MAX_DATAGRAM_SIZE};

/// Sending side of one multicast channel.
#[async_trait]
pub trait QueryChannel: Send + Sync + 'static {
    /// Human readable label used in diagnostics.
    fn label(&self) -> String;

    /// Address replies to queries sent on this channel should be sent to.
    fn reply_addr(&self) -> SocketAddr;

    /// Broadcast a query. Fire-and-forget: success only means the datagram
    /// left the host.
    async fn send_query(&self, query: &QueryMessage) -> Result<()>;
}

/// Multicast channel over a UDP socket bound to one interface.
///
/// The same socket sends queries to the group and receives the unicast
/// replies; call [`UdpChannel::spawn_reply_loop`] once the owning locator is
/// constructed to route those replies to it.
pub struct UdpChannel {
    interface: Ipv4Addr,
    group: SocketAddrV4,
    socket: Arc<UdpSocket>,
    reply_addr: SocketAddr,
}

impl UdpChannel {
    /// Open a channel on `interface`. Must be called inside a tokio runtime.
    pub fn bind(group: SocketAddrV4, interface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket
            .set_multicast_if_v4(&interface)
            .with_context(|| format!("failed to select multicast interface {interface}"))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket
            .bind(&SocketAddr::V4(SocketAddrV4::new(interface, 0)).into())
            .with_context(|| format!("failed to bind reply socket on {interface}"))?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        let reply_addr = socket.local_addr()?;
        debug!(%interface, %group, %reply_addr, "opened multicast channel");

        Ok(Self {
            interface,
            group,
            socket: Arc::new(socket),
            reply_addr,
        })
    }

    /// Receive replies until the locator is dropped.
    pub fn spawn_reply_loop<C: QueryChannel>(&self, locator: WeakLocator<C>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let label = self.label();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(channel = %label, "reply socket failed: {err:?}");
                        return;
                    }
                };
                let Some(locator) = locator.upgrade() else {
                    return;
                };
                trace!(channel = %label, %from, bytes = n, "received datagram");
                locator.handle_datagram(&buf[..n]).await;
            }
        })
    }
}

#[async_trait]
impl QueryChannel for UdpChannel {
    fn label(&self) -> String {
        format!("udp/{}", self.interface)
    }

    fn reply_addr(&self) -> SocketAddr {
        self.reply_addr
    }

    async fn send_query(&self, query: &QueryMessage) -> Result<()> {
        let data = Datagram::Query(query.clone()).encode()?;
        let n = self.socket.send_to(&data, self.group).await?;
        if n != data.len() {
            anyhow::bail!("short send: {n} of {} bytes", data.len());
        }
        Ok(())
    }
}

/// Responder-side socket joined to the multicast group.
pub struct MulticastListener {
    socket: UdpSocket,
}

impl MulticastListener {
    /// Join `group` on every interface in `interfaces`. Must be called inside a
    /// tokio runtime.
    pub fn bind(group: SocketAddrV4, interfaces: &[Ipv4Addr]) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // Must be set before bind() so several responders on one host can
        // share the group port.
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        socket
            .bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())
            .with_context(|| format!("failed to bind to discovery multicast port {}", group.port()))?;
        for interface in interfaces {
            socket
                .join_multicast_v4(group.ip(), interface)
                .with_context(|| format!("failed to join {} on {interface}", group.ip()))?;
        }
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }

    /// Receive the next query. Datagrams that are not queries are skipped.
    pub async fn recv_query(&self) -> Result<(QueryMessage, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match Datagram::decode(&buf[..n]) {
                Ok(Datagram::Query(query)) => return Ok((query, from)),
                Ok(Datagram::Reply(_)) => continue,
                Err(err) => {
                    debug!(%from, "received invalid datagram: {err}");
                }
            }
        }
    }

    /// Send an encoded datagram to `to`.
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(data, to).await?;
        Ok(())
    }
}

/// Open one [`UdpChannel`] per configured interface.
pub fn bind_channels(group: SocketAddrV4, interfaces: &[Ipv4Addr]) -> Result<Vec<UdpChannel>> {
    interfaces
        .iter()
        .map(|interface| UdpChannel::bind(group, *interface))
        .collect()
}

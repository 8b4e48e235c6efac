use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

use tracing::info;

use super::resolve::resolve_host;
use super::resolve::IpMode;
use super::socket::RudpSocket;
use crate::error::RudpError;
use crate::peer::peer::AppMessage;
use crate::peer::peer::Peer;
use crate::peer::session::LinkInfo;
use crate::peer::session::RudpConfig;

/// Client role: one endpoint, one peer, one server address.
///
/// `connect` completes after the handshake; from then on `send` and
/// `recv` exchange application packets until `close`, or until a
/// terminal error from `recv` reports the server lost. The value is
/// then finished; connect again for a new session.
pub struct RudpClient {
    peer: Peer,
    socket: RudpSocket,
}

impl RudpClient {
    pub async fn connect(connect_to: SocketAddr) -> Result<Self, RudpError> {
        Self::connect_with(connect_to, RudpConfig::default()).await
    }

    pub async fn connect_with(
        connect_to: SocketAddr,
        config: RudpConfig,
    ) -> Result<Self, RudpError> {
        // Bind a wildcard local address of the remote's family.
        let bind_addr = if connect_to.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let mut socket = RudpSocket::new(bind_addr, false, config).await?;

        // Knock: the peer queues a reliable CONN_REQ toward the server.
        let mut peer = socket.add_peer(connect_to).await?;
        peer.wait_connected().await?;
        info!("connected to {}", connect_to);

        Ok(Self { peer, socket })
    }

    /// Resolve a hostname and connect to the first usable address.
    pub async fn connect_host(host: &str, port: u16, mode: IpMode) -> Result<Self, RudpError> {
        let addrs = resolve_host(host, port, mode).await?;
        Self::connect(addrs[0]).await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn link_info(&self) -> LinkInfo {
        self.peer.link_info()
    }

    /// Send an application packet to the server.
    pub fn send(&self, reliable: bool, command: u8, payload: &[u8]) -> Result<(), RudpError> {
        self.peer.send(reliable, command, payload)
    }

    /// Await the next application packet. A terminal error means the
    /// server is lost (closed or timed out).
    pub async fn recv(&mut self) -> Result<AppMessage, RudpError> {
        self.peer.recv().await
    }

    /// Tear the session down. A best-effort CLOSE goes to the server
    /// and the endpoint is released.
    pub fn close(self) {}
}

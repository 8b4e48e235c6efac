//! RudpConnection
//!
//! Server-side handle to one established peer.
//!
use std::any::Any;
use std::net::SocketAddr;

use crate::error::RudpError;
use crate::peer::peer::AppMessage;
use crate::peer::peer::Peer;
use crate::peer::session::LinkInfo;

/// This is owned by the driver. Dropping it (or calling `close`)
/// sends a best-effort CLOSE to the remote and releases the peer.
pub struct RudpConnection {
    peer: Peer,
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl RudpConnection {
    pub(crate) fn new(peer: Peer) -> Self {
        Self {
            peer,
            user_data: None,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    pub fn link_info(&self) -> LinkInfo {
        self.peer.link_info()
    }

    /// Send an application packet to the remote.
    pub fn send(&self, reliable: bool, command: u8, payload: &[u8]) -> Result<(), RudpError> {
        self.peer.send(reliable, command, payload)
    }

    /// Await the next application packet from the remote.
    /// A terminal error means the peer dropped (close or timeout).
    pub async fn recv(&mut self) -> Result<AppMessage, RudpError> {
        self.peer.recv().await
    }

    /// Attach arbitrary per-connection state.
    pub fn set_user_data(&mut self, data: Box<dyn Any + Send + Sync>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.user_data.as_deref()
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.user_data.take()
    }

    pub fn close(self) {}
}

//!
//! Peer
//!
//! Wires a `PeerSession` to the socket task and to the owning role.
//! Each peer runs on its own task: it owns the session exclusively,
//! services it before every suspension point, and sleeps until the
//! session's next deadline.
//!
use anyhow::bail;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::error::RudpError;
use crate::wire::packet::CMD_APP_MAX;

use super::session::DropReason;
use super::session::LinkInfo;
use super::session::PeerSession;
use super::session::PeerState;
use super::session::RudpConfig;
use super::session::RudpTime;
use super::session::SessionEvent;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer sent close packet")]
    PeerSentClose,
    #[error("Peer timed out")]
    TimedOut,
    #[error("Socket closed")]
    SocketClosed,
    #[error("Controller closed")]
    ControllerClosed,
}

/// One received application packet.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Peer state snapshot published to the owning role.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub connected: bool,
    pub link: LinkInfo,
    pub send_error: Option<ErrorKind>,
}

// This is held by the role (client or server connection)
pub struct Peer {
    remote_addr: SocketAddr,
    send: UnboundedSender<PeerCommand>,
    recv: UnboundedReceiver<Result<AppMessage, PeerError>>,
    status: watch::Receiver<PeerStatus>,
}

impl Peer {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    pub fn link_info(&self) -> LinkInfo {
        self.status.borrow().link
    }

    /// Resolves once the handshake completes. Fails if the peer dies
    /// first (garbage handshake, timeout).
    pub async fn wait_connected(&mut self) -> Result<(), RudpError> {
        loop {
            if self.status.borrow_and_update().connected {
                return Ok(());
            }
            if self.status.changed().await.is_err() {
                return Err(RudpError::NotConnected);
            }
        }
    }

    /// Queue an application packet to the remote.
    ///
    /// A recorded transport error from an earlier transmission is
    /// reported here, without tearing down the connection.
    pub fn send(&self, reliable: bool, command: u8, payload: &[u8]) -> Result<(), RudpError> {
        if command > CMD_APP_MAX {
            return Err(RudpError::InvalidArgument("user command out of range"));
        }
        let status = self.status.borrow().clone();
        if !status.connected {
            return Err(RudpError::NotConnected);
        }
        if let Some(kind) = status.send_error {
            return Err(RudpError::Transport(kind));
        }
        self.send
            .send(PeerCommand::Send {
                reliable,
                command,
                payload: payload.to_vec(),
            })
            .map_err(|_| RudpError::NotConnected)
    }

    /// Receive the next application packet from the peer.
    /// A terminal error means the peer dropped.
    pub async fn recv(&mut self) -> Result<AppMessage, RudpError> {
        match self.recv.recv().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(reason)) => Err(RudpError::Dropped(reason)),
            None => Err(RudpError::Dropped(PeerError::SocketClosed)),
        }
    }
}

// This is owned by the socket task
pub struct PeerIO {
    relay: UnboundedSender<SocketToPeer>,
}

impl PeerIO {
    /// Called by the socket task when a datagram arrives for this peer.
    pub fn forward(&mut self, data: &[u8]) {
        let _ = self.relay.send(SocketToPeer::Received(data.to_vec()));
    }

    /// Called by the socket task to fan a server-wide send out to
    /// this peer.
    pub fn enqueue(&self, reliable: bool, command: u8, payload: &[u8]) {
        let _ = self.relay.send(SocketToPeer::Enqueue {
            reliable,
            command,
            payload: payload.to_vec(),
        });
    }

    /// Called by the socket task when a transmit for this peer failed.
    pub fn send_failed(&self, kind: ErrorKind) {
        let _ = self.relay.send(SocketToPeer::SendFailed(kind));
    }
}

#[derive(Debug)]
pub enum SocketToPeer {
    Received(Vec<u8>),
    Enqueue {
        reliable: bool,
        command: u8,
        payload: Vec<u8>,
    },
    SendFailed(ErrorKind),
}

#[derive(Debug)]
pub enum PeerToSocket {
    // Close datagrams jump the send queue
    SendImmediate(SocketAddr, Vec<u8>),
    Send(SocketAddr, Vec<u8>),
    PeerIsDisconnected(SocketAddr),
}

#[derive(Debug)]
enum PeerCommand {
    Send {
        reliable: bool,
        command: u8,
        payload: Vec<u8>,
    },
}

pub fn new_peer(
    remote_addr: SocketAddr,
    config: RudpConfig,
    initiate_connect: bool,
    peer_to_socket: UnboundedSender<PeerToSocket>,
) -> (Peer, PeerIO) {
    let (peer_send_tx, peer_send_rx) = unbounded_channel();
    let (peer_recv_tx, peer_recv_rx) = unbounded_channel();
    let (relay_tx, relay_rx) = unbounded_channel();

    let mut session = PeerSession::new(config, StdRng::from_entropy(), 0);
    if initiate_connect {
        session.start_connect();
    }
    let (status_tx, status_rx) = watch::channel(PeerStatus {
        connected: false,
        link: session.link_info(),
        send_error: None,
    });

    let peer = Peer {
        remote_addr,
        send: peer_send_tx,
        recv: peer_recv_rx,
        status: status_rx,
    };
    let peer_io = PeerIO { relay: relay_tx };
    let runner = PeerRunner {
        remote_addr,
        session,
        epoch: Instant::now(),
        from_socket: relay_rx,
        from_controller: peer_send_rx,
        to_controller: peer_recv_tx,
        to_socket: peer_to_socket,
        status_tx,
    };
    tokio::spawn(async move { runner.run().await });
    (peer, peer_io)
}

struct PeerRunner {
    remote_addr: SocketAddr,
    session: PeerSession,

    // Zero point of the session's millisecond clock
    epoch: Instant,

    from_socket: UnboundedReceiver<SocketToPeer>,
    to_socket: UnboundedSender<PeerToSocket>,

    from_controller: UnboundedReceiver<PeerCommand>,
    to_controller: UnboundedSender<Result<AppMessage, PeerError>>,

    status_tx: watch::Sender<PeerStatus>,
}

impl PeerRunner {
    fn now(&self) -> RudpTime {
        self.epoch.elapsed().as_millis() as RudpTime
    }

    pub async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            let reason = err
                .downcast_ref::<PeerError>()
                .copied()
                .unwrap_or(PeerError::SocketClosed);
            if reason == PeerError::ControllerClosed {
                // User-initiated close: emit the best-effort CLOSE
                // that bypasses the send queue.
                let raw = self.session.close_datagram();
                let _ = self
                    .to_socket
                    .send(PeerToSocket::SendImmediate(self.remote_addr, raw));
            }
            // These channels might already be dead, so ignore errors.
            let _ = self
                .to_socket
                .send(PeerToSocket::PeerIsDisconnected(self.remote_addr));
            let _ = self.to_controller.send(Err(reason));
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        loop {
            // Before select, flush everything the session wants on
            // the wire and compute the next service deadline.
            let now = self.now();
            let pass = self.session.service(now);
            for raw in pass.datagrams {
                self.to_socket
                    .send(PeerToSocket::Send(self.remote_addr, raw))?;
            }
            self.publish_status();
            if pass.dropped {
                bail!(PeerError::TimedOut);
            }

            let wakeup = self.session.next_wakeup(now);
            let deadline = self.epoch + Duration::from_millis(wakeup.max(0) as u64);

            // rust-analyzer chokes on code inside select!, so keep it to a minimum.
            tokio::select! {
                msg = self.from_socket.recv() => self.handle_from_socket(msg)?,
                cmd = self.from_controller.recv() => self.handle_from_controller(cmd)?,
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        }
    }

    fn handle_from_socket(&mut self, msg: Option<SocketToPeer>) -> anyhow::Result<()> {
        let msg = match msg {
            Some(msg) => msg,
            None => bail!(PeerError::SocketClosed),
        };
        match msg {
            SocketToPeer::Received(buf) => {
                let now = self.now();
                match self.session.handle_datagram(now, &buf) {
                    Ok(events) => self.dispatch_events(events)?,
                    Err(err) => {
                        // Malformed or inconsistent datagrams never
                        // tear the peer down.
                        debug!("{}: dropping datagram: {}", self.remote_addr, err);
                    }
                }
            }
            SocketToPeer::Enqueue {
                reliable,
                command,
                payload,
            } => {
                if let Err(err) = self.session.send_app(reliable, command, &payload) {
                    warn!("{}: queued send failed: {}", self.remote_addr, err);
                }
            }
            SocketToPeer::SendFailed(kind) => {
                warn!("{}: sendto failed: {:?}", self.remote_addr, kind);
                self.session.record_send_error(kind);
            }
        }
        Ok(())
    }

    fn handle_from_controller(&mut self, cmd: Option<PeerCommand>) -> anyhow::Result<()> {
        let cmd = match cmd {
            Some(cmd) => cmd,
            None => bail!(PeerError::ControllerClosed),
        };
        match cmd {
            PeerCommand::Send {
                reliable,
                command,
                payload,
            } => {
                if let Err(err) = self.session.send_app(reliable, command, &payload) {
                    warn!("{}: send failed: {}", self.remote_addr, err);
                }
            }
        }
        Ok(())
    }

    fn dispatch_events(&mut self, events: Vec<SessionEvent>) -> anyhow::Result<()> {
        for event in events {
            match event {
                SessionEvent::Connected => {
                    // Status publish at the top of the loop reports it.
                }
                SessionEvent::App { command, payload } => {
                    if self
                        .to_controller
                        .send(Ok(AppMessage { command, payload }))
                        .is_err()
                    {
                        // The owning handle is gone.
                        bail!(PeerError::ControllerClosed);
                    }
                }
                SessionEvent::Dropped(reason) => match reason {
                    DropReason::RemoteClosed => bail!(PeerError::PeerSentClose),
                    DropReason::TimedOut => bail!(PeerError::TimedOut),
                },
            }
        }
        Ok(())
    }

    fn publish_status(&mut self) {
        let status = PeerStatus {
            connected: self.session.state() == PeerState::Run,
            link: self.session.link_info(),
            send_error: self.session.send_error(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

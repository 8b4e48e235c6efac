use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::io::Interest;
use tokio::io::Ready;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::RudpError;
use crate::peer::peer::new_peer;
use crate::peer::peer::Peer;
use crate::peer::peer::PeerIO;
use crate::peer::peer::PeerToSocket;
use crate::peer::session::RudpConfig;
use crate::wire::packet::Command;
use crate::wire::packet::CONN_REQ_SIZE;

///
/// RudpSocket
///
/// Owns the raw UDP socket and demultiplexes datagrams to peers by
/// source address. Unknown sources are only let in through the
/// handshake gate: a datagram that is exactly a CONN_REQ. Everything
/// else from an unknown source is garbage and dropped.
///
/// Protocol state lives in the peers, not here.
///
pub struct RudpSocket {
    accept_rx: UnboundedReceiver<Peer>,
    knock_tx: UnboundedSender<SocketAddr>,
    broadcast_tx: UnboundedSender<Broadcast>,
    local_addr: SocketAddr,
    for_server: bool,
}

#[derive(Debug)]
struct Broadcast {
    reliable: bool,
    command: u8,
    payload: Vec<u8>,
}

impl RudpSocket {
    /// Create a new RudpSocket and bind to address.
    /// The address may be V4 or V6.
    /// To select a random bind port, use 0.0.0.0:0 or [::]:0
    pub async fn new(
        bind_addr: SocketAddr,
        for_server: bool,
        config: RudpConfig,
    ) -> Result<Self, RudpError> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(RudpError::Bind)?;
        let local_addr = socket.local_addr().map_err(RudpError::Bind)?;
        info!("bound to {}", local_addr);
        let (peer_tx, peer_rx) = unbounded_channel();
        let (accept_tx, accept_rx) = unbounded_channel();
        let (knock_tx, knock_rx) = unbounded_channel();
        let (broadcast_tx, broadcast_rx) = unbounded_channel();
        let rudp_socket = Self {
            accept_rx,
            knock_tx,
            broadcast_tx,
            local_addr,
            for_server,
        };
        let runner = RudpSocketRunner {
            socket,
            config,
            peers: HashMap::new(),
            peer_tx,
            peer_rx,
            outgoing: VecDeque::new(),
            accept_tx,
            knock_rx,
            broadcast_rx,
            for_server,
        };
        tokio::spawn(async move { runner.run().await });
        Ok(rudp_socket)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns None when the socket task has shut down.
    pub async fn accept(&mut self) -> Option<Peer> {
        self.accept_rx.recv().await
    }

    // Add a peer (the server to connect to) manually and start its
    // handshake. There is no network I/O at this point.
    //
    // NOTE: This is not cancel safe, and it should not be used if
    // incoming connections are expected, or else they will be
    // discarded.
    pub async fn add_peer(&mut self, remote: SocketAddr) -> Result<Peer, RudpError> {
        assert!(!self.for_server);
        self.knock_tx
            .send(remote)
            .map_err(|_| RudpError::NotConnected)?;

        // Wait for the peer
        loop {
            let peer = self.accept().await.ok_or(RudpError::NotConnected)?;
            if peer.remote_addr() == remote {
                return Ok(peer);
            }
            // Random connect from another address? Ignore it.
        }
    }

    /// Queue a send to every live peer.
    pub fn send_all(&self, reliable: bool, command: u8, payload: &[u8]) {
        let _ = self.broadcast_tx.send(Broadcast {
            reliable,
            command,
            payload: payload.to_vec(),
        });
    }
}

struct RudpSocketRunner {
    socket: UdpSocket,
    config: RudpConfig,
    peers: HashMap<SocketAddr, PeerIO>,
    peer_tx: UnboundedSender<PeerToSocket>,
    peer_rx: UnboundedReceiver<PeerToSocket>,
    outgoing: VecDeque<(SocketAddr, Vec<u8>)>,
    accept_tx: UnboundedSender<Peer>,
    knock_rx: UnboundedReceiver<SocketAddr>,
    broadcast_rx: UnboundedReceiver<Broadcast>,
    for_server: bool,
}

impl RudpSocketRunner {
    pub async fn run(mut self) {
        // Top-level error handler
        match self.run_inner().await {
            Ok(_) => (),
            Err(err) => {
                warn!("socket task abnormal exit: {:?}", err);
            }
        }
    }

    pub async fn run_inner(&mut self) -> anyhow::Result<()> {
        let mut knock_closed = false;
        let mut broadcast_closed = false;
        let mut buf: Vec<u8> = vec![0u8; self.config.recv_buffer_size];

        loop {
            // The owning role is gone, every peer has been unlinked,
            // and the last close datagram is flushed: wind down.
            if self.accept_tx.is_closed() && self.peers.is_empty() && self.outgoing.is_empty() {
                debug!("socket task shutting down");
                return Ok(());
            }

            let mut interest = Interest::READABLE;
            if !self.outgoing.is_empty() {
                interest = interest | Interest::WRITABLE;
            }
            // rust-analyzer chokes on code inside select!, so keep it to a minimum.
            tokio::select! {
                t = self.socket.ready(interest) => self.handle_socket_io(t, &mut buf)?,
                msg = self.peer_rx.recv() => self.handle_peer_message(msg)?,
                t = self.knock_rx.recv(), if !knock_closed => {
                    match t {
                        Some(addr) => { self.insert_peer(addr, true); },
                        None => { knock_closed = true; },
                    }
                }
                msg = self.broadcast_rx.recv(), if !broadcast_closed => {
                    match msg {
                        Some(b) => self.handle_broadcast(b),
                        None => { broadcast_closed = true; },
                    }
                }
            }
        }
    }

    fn handle_socket_io(
        &mut self,
        t: tokio::io::Result<Ready>,
        buf: &mut [u8],
    ) -> anyhow::Result<()> {
        let t = t?;
        if t.is_readable() {
            match self.socket.try_recv_from(buf) {
                Ok((n, remote_addr)) => {
                    let (datagram, _) = buf.split_at(n);
                    self.dispatch_datagram(remote_addr, datagram);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => (),
                // Transient receive errors (e.g. ICMP-triggered) are
                // not fatal to the endpoint.
                Err(e) => warn!("recv error: {}", e),
            };
        }
        if t.is_writable() && !self.outgoing.is_empty() {
            let (addr, data) = self.outgoing.pop_back().unwrap();
            match self.socket.try_send_to(&data, addr) {
                Ok(_) => (),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.outgoing.push_back((addr, data));
                }
                Err(e) => {
                    warn!("sendto {} failed: {}", addr, e);
                    if let Some(peer) = self.peers.get(&addr) {
                        peer.send_failed(e.kind());
                    }
                }
            }
        }
        Ok(())
    }

    /// Route one datagram. An unknown source address may be a new
    /// peer or garbage; we only give it a peer if it looks exactly
    /// like a connection request.
    fn dispatch_datagram(&mut self, remote_addr: SocketAddr, data: &[u8]) {
        if let Some(peer) = self.peers.get_mut(&remote_addr) {
            peer.forward(data);
            return;
        }
        if self.for_server
            && data.len() == CONN_REQ_SIZE
            && data[0] == Command::ConnReq.to_wire()
        {
            info!("new connection from {}", remote_addr);
            self.insert_peer(remote_addr, false);
            if let Some(peer) = self.peers.get_mut(&remote_addr) {
                peer.forward(data);
            }
            return;
        }
        debug!("garbage data from {}", remote_addr);
    }

    fn handle_peer_message(&mut self, msg: Option<PeerToSocket>) -> anyhow::Result<()> {
        let msg = match msg {
            Some(msg) => msg,
            // The runner holds a sender, so this cannot happen.
            None => anyhow::bail!("peer channel closed unexpectedly"),
        };
        match msg {
            PeerToSocket::SendImmediate(addr, data) => self.outgoing.push_back((addr, data)),
            PeerToSocket::Send(addr, data) => self.outgoing.push_front((addr, data)),
            PeerToSocket::PeerIsDisconnected(addr) => self.remove_peer(addr),
        }
        Ok(())
    }

    fn handle_broadcast(&mut self, b: Broadcast) {
        for peer in self.peers.values() {
            peer.enqueue(b.reliable, b.command, &b.payload);
        }
    }

    fn insert_peer(&mut self, remote_addr: SocketAddr, initiate_connect: bool) {
        let (peer, peer_io) = new_peer(
            remote_addr,
            self.config.clone(),
            initiate_connect,
            self.peer_tx.clone(),
        );
        self.peers.insert(remote_addr, peer_io);
        // If the role handle is already gone the peer is released
        // right away and tears itself down.
        let _ = self.accept_tx.send(peer);
    }

    fn remove_peer(&mut self, remote_addr: SocketAddr) {
        debug!("unlinking peer {}", remote_addr);
        self.peers.remove(&remote_addr);
    }
}

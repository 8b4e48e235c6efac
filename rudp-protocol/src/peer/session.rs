//!
//! Peer session
//!
//! The per-peer protocol state machine: handshake, sequence number
//! tracking, piggybacked acknowledgements, retransmission with an
//! RTT-estimated timeout, keepalive, and teardown.
//!
//! The session is sans-IO. It is driven with millisecond timestamps
//! and raw datagrams, and reports datagrams to transmit plus protocol
//! events; the runner in `peer.rs` wires it to a socket and a timer.
//!
use std::io::ErrorKind;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::error::RudpError;
use crate::wire::packet::Command;
use crate::wire::packet::Packet;
use crate::wire::packet::PacketBody;
use crate::wire::packet::CMD_APP_MAX;
use crate::wire::packet::OPT_ACK;
use crate::wire::packet::OPT_RELIABLE;
use crate::wire::packet::OPT_RETRANSMITTED;

use super::send_queue::SendQueue;
use super::util::seq_delta;

/// Milliseconds since an arbitrary, per-process epoch.
pub type RudpTime = i64;

/// Tunable protocol timing and buffer parameters.
#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// Idle time after which a keepalive PING is queued.
    pub action_timeout_ms: i64,
    /// Silence time after which the peer is declared dead.
    pub drop_timeout_ms: i64,
    /// Upper bound for the retransmission timeout.
    pub max_rto_ms: i64,
    /// Smoothed RTT before the first sample arrives.
    pub initial_srtt_ms: i64,
    /// Receive buffer size for the UDP socket.
    pub recv_buffer_size: usize,
}

impl Default for RudpConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 5000,
            drop_timeout_ms: 10000,
            max_rto_ms: 3000,
            initial_srtt_ms: 100,
            recv_buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Run,
    Dead,
}

/// Why a peer reached `PeerState::Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RemoteClosed,
    TimedOut,
}

/// Current link quality estimate, refreshed on every PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub srtt: i64,
    pub rttvar: i64,
    pub rto: i64,
}

#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    /// First packet accepted while in `Run`. Fires once per connection.
    Connected,
    /// Application payload, in order within its reliability class.
    App { command: u8, payload: Vec<u8> },
    /// Terminal: the peer is dead and must be unlinked.
    Dropped(DropReason),
}

/// Output of one service pass.
#[derive(Default)]
pub struct ServicePass {
    /// Datagrams to put on the wire, in order.
    pub datagrams: Vec<Vec<u8>>,
    /// The liveness deadline passed; the peer is now dead.
    pub dropped: bool,
}

enum PacketClass {
    Sequenced,
    Unsequenced,
    Retransmitted,
}

pub struct PeerSession {
    config: RudpConfig,
    rng: StdRng,
    state: PeerState,

    /// Last accepted reliable sequence. 0xffff until the remote's
    /// first reliable sequence is adopted during handshake.
    in_seq_reliable: u16,
    /// Last accepted unreliable sequence within the current epoch.
    in_seq_unreliable: u16,
    /// Sequence of the most recently queued reliable packet.
    out_seq_reliable: u16,
    /// Unreliable counter within the current outgoing epoch.
    out_seq_unreliable: u16,
    /// Highest reliable sequence the remote acknowledged.
    out_seq_acked: u16,

    srtt: i64,
    rttvar: i64,
    rto: i64,

    last_out_time: RudpTime,
    abs_timeout_deadline: RudpTime,

    /// A reliable packet was received; outgoing packets must carry
    /// the acknowledgement. Never cleared once set: the piggyback is
    /// idempotent and subsequent sends keep re-stamping it.
    must_ack: bool,
    connected_reported: bool,

    sendq: SendQueue,
    sendto_err: Option<ErrorKind>,
}

impl PeerSession {
    pub fn new(config: RudpConfig, rng: StdRng, now: RudpTime) -> Self {
        let mut session = PeerSession {
            config,
            rng,
            state: PeerState::New,
            in_seq_reliable: 0,
            in_seq_unreliable: 0,
            out_seq_reliable: 0,
            out_seq_unreliable: 0,
            out_seq_acked: 0,
            srtt: 0,
            rttvar: 0,
            rto: 0,
            last_out_time: 0,
            abs_timeout_deadline: 0,
            must_ack: false,
            connected_reported: false,
            sendq: SendQueue::new(),
            sendto_err: None,
        };
        session.reset(now);
        session
    }

    /// Return the session to a fresh `New` state: the queue is
    /// drained, sequence counters re-seeded, and the first incoming
    /// reliable sequence will be adopted whatever its value.
    pub fn reset(&mut self, now: RudpTime) {
        self.sendq.clear();
        self.abs_timeout_deadline = now + self.config.drop_timeout_ms;
        self.in_seq_reliable = 0xffff;
        self.in_seq_unreliable = 0;
        self.out_seq_reliable = self.rng.gen();
        self.out_seq_unreliable = 0;
        self.out_seq_acked = self.out_seq_reliable.wrapping_sub(1);
        self.state = PeerState::New;
        self.last_out_time = now;
        self.srtt = self.config.initial_srtt_ms;
        self.rttvar = self.srtt / 2;
        self.rto = self.config.max_rto_ms;
        self.must_ack = false;
        self.connected_reported = false;
        self.sendto_err = None;
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn config(&self) -> &RudpConfig {
        &self.config
    }

    pub fn link_info(&self) -> LinkInfo {
        LinkInfo {
            srtt: self.srtt,
            rttvar: self.rttvar,
            rto: self.rto,
        }
    }

    pub fn send_error(&self) -> Option<ErrorKind> {
        self.sendto_err
    }

    /// Record a transport-level send failure. It is surfaced from the
    /// next user send; the session keeps running regardless, since
    /// the liveness timeout is the definitive failure signal.
    pub fn record_send_error(&mut self, kind: ErrorKind) {
        self.sendto_err = Some(kind);
    }

    /// Queue the connection request and start the client handshake.
    pub fn start_connect(&mut self) {
        self.state = PeerState::Connecting;
        self.enqueue_reliable(Packet::conn_req());
    }

    /// Queue an application packet.
    pub fn send_app(
        &mut self,
        reliable: bool,
        command: u8,
        payload: &[u8],
    ) -> Result<(), RudpError> {
        if command > CMD_APP_MAX {
            return Err(RudpError::InvalidArgument("user command out of range"));
        }
        let pkt = Packet::app(command, payload);
        if reliable {
            self.enqueue_reliable(pkt);
        } else {
            self.enqueue_unreliable(pkt);
        }
        match self.sendto_err {
            Some(kind) => Err(RudpError::Transport(kind)),
            None => Ok(()),
        }
    }

    fn enqueue_reliable(&mut self, mut pkt: Packet) {
        self.out_seq_reliable = self.out_seq_reliable.wrapping_add(1);
        self.out_seq_unreliable = 0;
        pkt.header.opt = OPT_RELIABLE;
        pkt.header.reliable = self.out_seq_reliable;
        pkt.header.unreliable = 0;
        trace!(
            ">>> outgoing reliable {} {:04x}:{:04x}",
            pkt.header.command.name(),
            pkt.header.reliable,
            pkt.header.unreliable
        );
        self.sendq.push(pkt);
    }

    fn enqueue_unreliable(&mut self, mut pkt: Packet) {
        self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);
        pkt.header.opt = 0;
        pkt.header.reliable = self.out_seq_reliable;
        pkt.header.unreliable = self.out_seq_unreliable;
        trace!(
            ">>> outgoing unreliable {} {:04x}:{:04x}",
            pkt.header.command.name(),
            pkt.header.reliable,
            pkt.header.unreliable
        );
        self.sendq.push(pkt);
    }

    /// Process one inbound datagram already matched to this peer.
    ///
    /// A malformed datagram or one acking an unsent sequence is
    /// rejected whole; the caller logs and drops it.
    pub fn handle_datagram(
        &mut self,
        now: RudpTime,
        data: &[u8],
    ) -> Result<Vec<SessionEvent>, RudpError> {
        let pkt = Packet::decode(data).map_err(|err| RudpError::Malformed(err.to_string()))?;
        let header = pkt.header.clone();
        trace!(
            "<<< incoming [{:?}] {} {} {:04x}:{:04x}",
            self.state,
            if header.is_reliable() {
                "reliable"
            } else {
                "unreliable"
            },
            header.command.name(),
            header.reliable,
            header.unreliable
        );

        if header.has_ack() {
            trace!("    has ACK flag, {:04x}", header.reliable_ack);
            if self.handle_ack(header.reliable_ack) {
                warn!("    broken ACK flag, ignoring packet");
                return Err(RudpError::InvalidArgument("ack for unsent sequence"));
            }
        }

        let class = if header.is_reliable() {
            self.analyse_reliable(header.reliable)
        } else {
            self.analyse_unreliable(header.reliable, header.unreliable)
        };

        let mut events = Vec::new();
        match class {
            PacketClass::Unsequenced => {
                if self.state == PeerState::New && header.command == Command::ConnReq {
                    // Server side, handling a new client
                    self.handle_conn_req();
                    self.in_seq_reliable = header.reliable;
                    self.state = PeerState::Run;
                } else if self.state == PeerState::Connecting
                    && header.command == Command::ConnRsp
                {
                    // Client side, handling the server's answer
                    self.in_seq_reliable = header.reliable;
                    self.handle_ack(header.reliable_ack);
                    self.state = PeerState::Run;
                } else {
                    warn!("    unsequenced packet in state {:?}, ignored", self.state);
                }
            }
            PacketClass::Retransmitted => {
                // Already delivered once; just proof of liveness.
                self.abs_timeout_deadline = now + self.config.drop_timeout_ms;
            }
            PacketClass::Sequenced => {
                self.abs_timeout_deadline = now + self.config.drop_timeout_ms;
                match header.command {
                    Command::Close => {
                        self.state = PeerState::Dead;
                        info!("peer closed by remote");
                        events.push(SessionEvent::Dropped(DropReason::RemoteClosed));
                        return Ok(events);
                    }
                    Command::Ping => {
                        if self.state == PeerState::Run {
                            self.handle_ping(&pkt);
                        } else {
                            warn!("    ping while not running");
                        }
                    }
                    Command::Pong => {
                        if self.state == PeerState::Run {
                            self.handle_pong(now, &pkt);
                        } else {
                            warn!("    pong while not running");
                        }
                    }
                    Command::Noop | Command::ConnReq | Command::ConnRsp => {}
                    Command::App(user) => {
                        if self.state == PeerState::Run {
                            if let PacketBody::App(payload) = pkt.body {
                                events.push(SessionEvent::App {
                                    command: user,
                                    payload,
                                });
                            }
                        } else {
                            warn!("    user payload while not running");
                        }
                    }
                }
            }
        }

        if header.is_reliable() {
            debug!("    reliable packet, posting ack");
            self.post_ack();
        }

        if self.state == PeerState::Run && !self.connected_reported {
            self.connected_reported = true;
            events.insert(0, SessionEvent::Connected);
        }

        Ok(events)
    }

    fn analyse_reliable(&mut self, reliable_seq: u16) -> PacketClass {
        if self.in_seq_reliable == reliable_seq {
            return PacketClass::Retransmitted;
        }
        if self.in_seq_reliable.wrapping_add(1) != reliable_seq {
            warn!(
                "unsequenced last seq {:04x} packet {:04x}",
                self.in_seq_reliable, reliable_seq
            );
            return PacketClass::Unsequenced;
        }
        self.in_seq_reliable = reliable_seq;
        self.in_seq_unreliable = 0;
        PacketClass::Sequenced
    }

    fn analyse_unreliable(&mut self, reliable_seq: u16, unreliable_seq: u16) -> PacketClass {
        trace!(
            "rel {:04x} == {:04x}, unrel {:04x} >= {:04x}",
            self.in_seq_reliable,
            reliable_seq,
            unreliable_seq,
            self.in_seq_unreliable
        );
        if self.in_seq_reliable != reliable_seq {
            return PacketClass::Unsequenced;
        }
        if seq_delta(self.in_seq_unreliable, unreliable_seq) <= 0 {
            return PacketClass::Unsequenced;
        }
        self.in_seq_unreliable = unreliable_seq;
        PacketClass::Sequenced
    }

    /// Returns true if the ack refers to a sequence we never sent, in
    /// which case the whole datagram must be rejected.
    fn handle_ack(&mut self, ack: u16) -> bool {
        let ack_delta = seq_delta(self.out_seq_acked, ack);
        let adv_delta = seq_delta(self.out_seq_reliable, ack);

        if ack_delta < 0 {
            // ack in the past
            return false;
        }
        if adv_delta > 0 {
            // acking an unsent seqno
            return true;
        }

        debug!("acked seqno is now {:04x}", ack);
        self.out_seq_acked = ack;
        let freed = self.sendq.remove_acked(ack);
        if freed > 0 {
            debug!("ack freed {} entries, {} left in queue", freed, self.sendq.len());
        }
        false
    }

    fn handle_conn_req(&mut self) {
        info!("answering connection request");
        self.enqueue_unreliable(Packet::conn_rsp());
    }

    fn handle_ping(&mut self, pkt: &Packet) {
        // No RTT stats from retransmitted packets, and no duplicate
        // PONG either; the generic ack path still answers it.
        if pkt.header.is_retransmitted() {
            return;
        }
        if let PacketBody::Ping(echo) = &pkt.body {
            debug!("answering ping");
            self.enqueue_unreliable(Packet::pong(echo.clone()));
        }
    }

    fn handle_pong(&mut self, now: RudpTime, pkt: &Packet) {
        if let PacketBody::Pong(echo) = &pkt.body {
            // A peer echoing a future timestamp must not drive the
            // estimator negative.
            let sample = (now - echo.timestamp as i64).max(0);
            self.update_rtt(sample);
        }
    }

    /// An ack can ride on any outgoing packet. If the send queue is
    /// empty there is nothing to ride on, so push a NOOP.
    fn post_ack(&mut self) {
        self.must_ack = true;
        if !self.sendq.is_empty() {
            return;
        }
        debug!("pushing NOOP to carry ack");
        self.enqueue_unreliable(Packet::noop());
    }

    fn update_rtt(&mut self, sample: i64) {
        // The echoed timestamp is remote-controlled; whatever it
        // claims, the estimators stay within [0, max_rto].
        let max = self.config.max_rto_ms;
        self.rttvar = ((3 * self.rttvar + (self.srtt - sample).abs()) / 4).clamp(0, max);
        self.srtt = ((7 * self.srtt + sample) / 8).clamp(0, max);
        self.rto = self.srtt;
        info!(
            "timeout state: rttvar {} srtt {} rto {}",
            self.rttvar, self.srtt, self.rto
        );
    }

    fn rto_backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.config.max_rto_ms);
        info!(
            "timeout state: rttvar {} srtt {} rto {}",
            self.rttvar, self.srtt, self.rto
        );
    }

    /// One service pass: liveness check, keepalive, and the send
    /// walk. At most one retransmission goes out per pass.
    pub fn service(&mut self, now: RudpTime) -> ServicePass {
        let mut pass = ServicePass::default();
        if self.state == PeerState::Dead {
            return pass;
        }

        if now >= self.abs_timeout_deadline {
            info!("liveness deadline passed, dropping peer");
            self.state = PeerState::Dead;
            pass.dropped = true;
            return pass;
        }

        if self.sendq.is_empty() && now - self.last_out_time > self.config.action_timeout_ms {
            debug!("pushing keepalive PING");
            self.enqueue_reliable(Packet::ping(now as u64));
        }

        let must_ack = self.must_ack;
        let ack_seq = self.in_seq_reliable;
        let mut index = 0;
        while let Some(entry) = self.sendq.get_mut(index) {
            if must_ack {
                entry.header.opt |= OPT_ACK;
                entry.header.reliable_ack = ack_seq;
            } else {
                entry.header.reliable_ack = 0;
            }
            trace!(
                ">>>>>> {}send {}reliable {} {:04x}:{:04x} {} {:04x}",
                if entry.header.is_retransmitted() { "RE" } else { "" },
                if entry.header.is_reliable() { "" } else { "un" },
                entry.header.command.name(),
                entry.header.reliable,
                entry.header.unreliable,
                if entry.header.has_ack() { "ack" } else { "noack" },
                entry.header.reliable_ack
            );
            pass.datagrams.push(entry.encode());
            let reliable = entry.header.is_reliable();
            let retransmitted = entry.header.is_retransmitted();
            self.last_out_time = now;

            if reliable && retransmitted {
                self.rto_backoff();
                break;
            }
            if reliable {
                if let Some(entry) = self.sendq.get_mut(index) {
                    entry.header.opt |= OPT_RETRANSMITTED;
                }
                index += 1;
            } else {
                self.sendq.remove(index);
            }
        }

        pass
    }

    /// Absolute time of the next needed service pass.
    pub fn next_wakeup(&self, now: RudpTime) -> RudpTime {
        let mut delta = self.config.action_timeout_ms;
        if let Some(head) = self.sendq.head() {
            delta = if head.header.is_retransmitted() {
                // Transmitted head: wait out the retransmission timer.
                self.rto - (now - self.last_out_time)
            } else {
                // Fresh entry: transmit as soon as possible.
                0
            };
        }

        let deadline_delta = self.abs_timeout_deadline - now;
        if deadline_delta < delta {
            delta = deadline_delta;
        }
        if delta <= 0 {
            delta = 1;
        }
        now + delta
    }

    /// Serialise a terminal CLOSE that bypasses the queue. Best
    /// effort: it is transmitted once and never retransmitted.
    pub fn close_datagram(&mut self) -> Vec<u8> {
        let mut pkt = Packet::close();
        self.out_seq_unreliable = self.out_seq_unreliable.wrapping_add(1);
        pkt.header.reliable = self.out_seq_reliable;
        pkt.header.unreliable = self.out_seq_unreliable;
        trace!(
            ">>> outgoing noqueue CLOSE {:04x}:{:04x}",
            pkt.header.reliable,
            pkt.header.unreliable
        );
        pkt.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn session(seed: u64) -> PeerSession {
        PeerSession::new(RudpConfig::default(), StdRng::seed_from_u64(seed), 0)
    }

    /// Run the full handshake and return (client, server, now).
    fn establish(now: RudpTime) -> (PeerSession, PeerSession, RudpTime) {
        let mut client = session(1);
        let mut server = session(2);
        client.start_connect();
        let pass = client.service(now);
        assert_eq!(pass.datagrams.len(), 1);

        let events = server.handle_datagram(now, &pass.datagrams[0]).unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(server.state(), PeerState::Run);

        let rsp = server.service(now);
        assert_eq!(rsp.datagrams.len(), 1);
        let events = client.handle_datagram(now, &rsp.datagrams[0]).unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(client.state(), PeerState::Run);
        assert!(client.sendq.is_empty(), "CONN_REQ must be acked away");
        (client, server, now)
    }

    fn raw_reliable_app(reliable: u16) -> Vec<u8> {
        let mut pkt = Packet::app(0, b"");
        pkt.header.opt = OPT_RELIABLE;
        pkt.header.reliable = reliable;
        pkt.encode()
    }

    #[test]
    fn handshake_happy_path() {
        let mut client = session(1);
        let mut server = session(2);
        client.start_connect();
        assert_eq!(client.state(), PeerState::Connecting);
        let client_isn = client.out_seq_reliable;

        let pass = client.service(0);
        let conn_req = Packet::decode(&pass.datagrams[0]).unwrap();
        assert_eq!(conn_req.header.command, Command::ConnReq);
        assert!(conn_req.header.is_reliable());
        assert_eq!(conn_req.header.reliable, client_isn);

        let events = server.handle_datagram(0, &pass.datagrams[0]).unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(server.state(), PeerState::Run);
        assert_eq!(server.in_seq_reliable, client_isn);

        let rsp_pass = server.service(0);
        assert_eq!(rsp_pass.datagrams.len(), 1);
        let conn_rsp = Packet::decode(&rsp_pass.datagrams[0]).unwrap();
        assert_eq!(conn_rsp.header.command, Command::ConnRsp);
        assert!(!conn_rsp.header.is_reliable());
        assert_eq!(conn_rsp.header.unreliable, 1);
        assert!(conn_rsp.header.has_ack());
        assert_eq!(conn_rsp.header.reliable_ack, client_isn);
        assert_eq!(conn_rsp.body, PacketBody::ConnRsp(crate::wire::packet::ConnRspBody { accepted: 1 }));

        let events = client.handle_datagram(0, &rsp_pass.datagrams[0]).unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(client.state(), PeerState::Run);
        assert_eq!(client.out_seq_acked, client_isn);
        assert_eq!(client.in_seq_reliable, conn_rsp.header.reliable);
        assert!(client.sendq.is_empty());
    }

    #[test]
    fn sentinel_accepts_any_initial_reliable_seq() {
        let mut server = session(7);
        assert_eq!(server.in_seq_reliable, 0xffff);
        let mut conn_req = Packet::conn_req();
        conn_req.header.opt = OPT_RELIABLE;
        conn_req.header.reliable = 0xabcd;
        let events = server.handle_datagram(0, &conn_req.encode()).unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(server.in_seq_reliable, 0xabcd);
    }

    #[test]
    fn retransmit_then_ack() {
        let (mut client, mut server, now) = establish(0);
        client.rto = 500;

        client.send_app(true, 0, b"hello").unwrap();
        let seq = client.out_seq_reliable;
        let pass1 = client.service(now);
        assert_eq!(pass1.datagrams.len(), 1);
        let first = Packet::decode(&pass1.datagrams[0]).unwrap();
        assert!(first.header.is_reliable());
        assert!(!first.header.is_retransmitted());
        assert_eq!(first.header.reliable, seq);

        // No ack within rto: the same bytes go out again, flagged.
        let t1 = now + 500;
        assert_eq!(client.next_wakeup(now), t1);
        let pass2 = client.service(t1);
        assert_eq!(pass2.datagrams.len(), 1);
        let second = Packet::decode(&pass2.datagrams[0]).unwrap();
        assert!(second.header.is_retransmitted());
        assert_eq!(second.header.reliable, seq);
        assert_eq!(second.body, first.body);
        assert_eq!(client.rto, 1000);

        // First copy delivers; the duplicate only refreshes the deadline.
        let events = server.handle_datagram(t1, &pass1.datagrams[0]).unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::App {
                command: 0,
                payload: b"hello".to_vec()
            }]
        );
        let events = server.handle_datagram(t1, &pass2.datagrams[0]).unwrap();
        assert_eq!(events, vec![]);

        // The server had nothing queued: a NOOP carries the ack back.
        let ack_pass = server.service(t1);
        assert_eq!(ack_pass.datagrams.len(), 1);
        let noop = Packet::decode(&ack_pass.datagrams[0]).unwrap();
        assert_eq!(noop.header.command, Command::Noop);
        assert!(noop.header.has_ack());
        assert_eq!(noop.header.reliable_ack, seq);

        client.handle_datagram(t1, &ack_pass.datagrams[0]).unwrap();
        assert_eq!(client.out_seq_acked, seq);
        assert!(client.sendq.is_empty());
    }

    #[test]
    fn rto_backoff_caps_at_max() {
        let (mut client, _server, now) = establish(0);
        client.rto = 500;
        client.send_app(true, 0, b"x").unwrap();
        let mut t = now;
        client.service(t);
        for expected in [1000, 2000, 3000, 3000] {
            t = client.next_wakeup(t);
            let pass = client.service(t);
            assert_eq!(pass.datagrams.len(), 1);
            assert_eq!(client.rto, expected);
        }
    }

    #[test]
    fn keepalive_ping_and_rtt_estimate() {
        let (mut client, mut server, now) = establish(0);

        // Nothing queued and the line has been idle too long.
        let t = now + 5001;
        let pass = client.service(t);
        assert_eq!(pass.datagrams.len(), 1);
        let ping = Packet::decode(&pass.datagrams[0]).unwrap();
        assert_eq!(ping.header.command, Command::Ping);
        assert!(ping.header.is_reliable());
        assert_eq!(ping.body, PacketBody::Ping(crate::wire::packet::PingBody { timestamp: t as u64 }));

        server.handle_datagram(t, &pass.datagrams[0]).unwrap();
        let pong_pass = server.service(t);
        let pong = Packet::decode(&pong_pass.datagrams[0]).unwrap();
        assert_eq!(pong.header.command, Command::Pong);
        assert!(!pong.header.is_reliable());
        assert_eq!(pong.body, PacketBody::Pong(crate::wire::packet::PingBody { timestamp: t as u64 }));

        // Echo arrives 40ms later; the estimators move toward it.
        client.handle_datagram(t + 40, &pong_pass.datagrams[0]).unwrap();
        let info = client.link_info();
        assert_eq!(info.srtt, (7 * 100 + 40) / 8);
        assert_eq!(info.rttvar, (3 * 50 + 60) / 4);
        assert_eq!(info.rto, info.srtt);
    }

    /// The echoed timestamp in a PONG is arbitrary wire data; no
    /// trace of echoes may push the estimators past the rto cap.
    #[test]
    fn rtt_estimators_stay_bounded() {
        let (mut client, _server, start) = establish(0);
        let mut t = start;
        for i in 0..30u64 {
            // Cycle through ancient echoes (huge samples), future
            // echoes (negative samples), and plausible ones.
            let timestamp = match i % 3 {
                0 => 0,
                1 => (t + 1_000_000) as u64,
                _ => (t - 40).max(0) as u64,
            };
            let mut pong = Packet::pong(crate::wire::packet::PingBody { timestamp });
            pong.header.reliable = client.in_seq_reliable;
            pong.header.unreliable = client.in_seq_unreliable.wrapping_add(1);
            client.handle_datagram(t, &pong.encode()).unwrap();

            let info = client.link_info();
            assert!((0..=3000).contains(&info.srtt), "srtt {} out of bounds", info.srtt);
            assert!(
                (0..=3000).contains(&info.rttvar),
                "rttvar {} out of bounds",
                info.rttvar
            );
            assert!((0..=3000).contains(&info.rto), "rto {} out of bounds", info.rto);
            t += 100_000;
        }
    }

    #[test]
    fn retransmitted_ping_gets_no_pong() {
        let (mut client, mut server, now) = establish(0);
        let t = now + 5001;
        let pass = client.service(t);
        let mut ping = Packet::decode(&pass.datagrams[0]).unwrap();
        ping.header.opt |= OPT_RETRANSMITTED;

        // First delivery of a retransmitted PING: sequenced, but the
        // reply is suppressed. The ack still goes out via NOOP.
        let events = server.handle_datagram(t, &ping.encode()).unwrap();
        assert_eq!(events, vec![]);
        let out = server.service(t);
        assert_eq!(out.datagrams.len(), 1);
        let noop = Packet::decode(&out.datagrams[0]).unwrap();
        assert_eq!(noop.header.command, Command::Noop);
        assert!(noop.header.has_ack());
        assert_eq!(noop.header.reliable_ack, ping.header.reliable);
    }

    #[test]
    fn sequence_wrap_is_sequenced() {
        let (_, mut server, now) = establish(0);
        server.in_seq_reliable = 0xfffe;
        let events = server.handle_datagram(now, &raw_reliable_app(0xffff)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(server.in_seq_reliable, 0xffff);
        let events = server.handle_datagram(now, &raw_reliable_app(0x0000)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(server.in_seq_reliable, 0x0000);
    }

    #[test]
    fn gap_is_unsequenced_and_not_delivered() {
        let (_, mut server, now) = establish(0);
        let next = server.in_seq_reliable.wrapping_add(2);
        let events = server.handle_datagram(now, &raw_reliable_app(next)).unwrap();
        assert_eq!(events, vec![]);
    }

    #[test]
    fn broken_ack_rejects_datagram_stale_ack_ignored() {
        let (mut client, _server, now) = establish(0);
        let acked = client.out_seq_acked;

        let mut pkt = Packet::noop();
        pkt.header.opt = OPT_ACK;
        pkt.header.reliable_ack = client.out_seq_reliable.wrapping_add(1);
        pkt.header.reliable = client.in_seq_reliable;
        pkt.header.unreliable = 100;
        let err = client.handle_datagram(now, &pkt.encode()).unwrap_err();
        assert!(matches!(err, RudpError::InvalidArgument(_)));
        assert_eq!(client.out_seq_acked, acked);

        let mut pkt = Packet::noop();
        pkt.header.opt = OPT_ACK;
        pkt.header.reliable_ack = acked.wrapping_sub(3);
        pkt.header.reliable = client.in_seq_reliable;
        pkt.header.unreliable = 101;
        client.handle_datagram(now, &pkt.encode()).unwrap();
        assert_eq!(client.out_seq_acked, acked);
    }

    #[test]
    fn stale_unreliable_is_dropped() {
        let (mut client, mut server, now) = establish(0);
        client.send_app(false, 3, b"a").unwrap();
        client.send_app(false, 3, b"b").unwrap();
        let pass = client.service(now);
        assert_eq!(pass.datagrams.len(), 2);
        // Deliver out of order: "b" first, then the stale "a".
        let events = server.handle_datagram(now, &pass.datagrams[1]).unwrap();
        assert_eq!(events.len(), 1);
        let events = server.handle_datagram(now, &pass.datagrams[0]).unwrap();
        assert_eq!(events, vec![]);
    }

    #[test]
    fn clean_close() {
        let (mut client, mut server, now) = establish(0);
        let unreliable_before = client.out_seq_unreliable;
        let raw = client.close_datagram();
        let close = Packet::decode(&raw).unwrap();
        assert_eq!(close.header.command, Command::Close);
        assert_eq!(close.header.opt, 0);
        assert_eq!(close.header.reliable, client.out_seq_reliable);
        assert_eq!(close.header.unreliable, unreliable_before.wrapping_add(1));

        let events = server.handle_datagram(now, &raw).unwrap();
        assert_eq!(events, vec![SessionEvent::Dropped(DropReason::RemoteClosed)]);
        assert_eq!(server.state(), PeerState::Dead);
        // Dead peers transmit nothing.
        assert!(server.service(now).datagrams.is_empty());
    }

    #[test]
    fn liveness_timeout_drops_once() {
        let (mut client, _server, now) = establish(0);
        let pass = client.service(now + 10000);
        assert!(pass.dropped);
        assert_eq!(client.state(), PeerState::Dead);
        let pass = client.service(now + 20000);
        assert!(!pass.dropped);
        assert!(pass.datagrams.is_empty());
    }

    #[test]
    fn incoming_traffic_refreshes_deadline() {
        let (mut client, mut server, now) = establish(0);
        client.send_app(true, 0, b"still here").unwrap();
        let pass = client.service(now);
        let t = now + 9000;
        server.handle_datagram(t, &pass.datagrams[0]).unwrap();
        // Old deadline would have expired; the packet pushed it out.
        let pass = server.service(now + 10000);
        assert!(!pass.dropped);
        assert_eq!(server.state(), PeerState::Run);
    }

    #[test]
    fn ack_piggyback_is_idempotent() {
        let (mut client, mut server, now) = establish(0);
        client.send_app(true, 0, b"one").unwrap();
        server
            .handle_datagram(now, &client.service(now).datagrams[0])
            .unwrap();

        // Every subsequent outbound keeps carrying the ack.
        for i in 0..3u8 {
            server.send_app(false, 1, &[i]).unwrap();
        }
        let pass = server.service(now);
        assert_eq!(pass.datagrams.len(), 4); // NOOP + three payloads
        for raw in &pass.datagrams {
            let pkt = Packet::decode(raw).unwrap();
            assert!(pkt.header.has_ack());
            assert_eq!(pkt.header.reliable_ack, server.in_seq_reliable);
        }
    }

    #[test]
    fn user_command_range_is_checked() {
        let (mut client, _server, _now) = establish(0);
        assert!(matches!(
            client.send_app(true, CMD_APP_MAX + 1, b""),
            Err(RudpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn send_error_is_surfaced_on_next_send() {
        let (mut client, _server, _now) = establish(0);
        client.record_send_error(ErrorKind::PermissionDenied);
        let err = client.send_app(true, 0, b"x").unwrap_err();
        assert!(matches!(err, RudpError::Transport(ErrorKind::PermissionDenied)));
        // The packet is still queued; the engine keeps going.
        assert_eq!(client.sendq.len(), 1);
    }

    #[test]
    fn reset_restores_fresh_state() {
        let (mut client, _server, now) = establish(0);
        client.send_app(true, 0, b"x").unwrap();
        client.service(now);
        client.reset(now + 123);
        assert_eq!(client.state(), PeerState::New);
        assert!(client.sendq.is_empty());
        assert_eq!(client.in_seq_reliable, 0xffff);
        assert_eq!(client.in_seq_unreliable, 0);
        assert_eq!(client.out_seq_unreliable, 0);
        assert_eq!(
            client.out_seq_acked,
            client.out_seq_reliable.wrapping_sub(1)
        );
        assert_eq!(client.rto, 3000);
        assert_eq!(client.abs_timeout_deadline, now + 123 + 10000);
    }

    /// Reliable payloads cross a lossy link exactly once and in
    /// order; unreliable payloads arrive as an in-order subset.
    #[test]
    fn lossy_link_delivery_guarantees() {
        let (mut client, mut server, start) = establish(0);
        let mut now = start;
        let total = 40u16;
        let mut received: Vec<u16> = Vec::new();
        let mut received_unreliable: Vec<u16> = Vec::new();
        let mut sent = 0u16;
        let mut drop_counter = 0u32;

        for round in 0..2000 {
            if sent < total && round % 3 == 0 {
                client.send_app(true, 0, &sent.to_be_bytes()).unwrap();
                client.send_app(false, 1, &sent.to_be_bytes()).unwrap();
                sent += 1;
            }

            for raw in client.service(now).datagrams {
                drop_counter += 1;
                // Lose roughly a third of everything client-to-server.
                if drop_counter % 3 == 0 {
                    continue;
                }
                if let Ok(events) = server.handle_datagram(now, &raw) {
                    for ev in events {
                        match ev {
                            SessionEvent::App { command: 0, payload } => {
                                received.push(u16::from_be_bytes(payload.try_into().unwrap()))
                            }
                            SessionEvent::App { command: 1, payload } => received_unreliable
                                .push(u16::from_be_bytes(payload.try_into().unwrap())),
                            other => panic!("unexpected event {:?}", other),
                        }
                    }
                }
            }
            // The reverse path does not lose packets.
            for raw in server.service(now).datagrams {
                client.handle_datagram(now, &raw).unwrap();
            }

            now += 50;
            if received.len() == total as usize && client.sendq.is_empty() {
                break;
            }
        }

        let expected: Vec<u16> = (0..total).collect();
        assert_eq!(received, expected, "reliable stream must be lossless and ordered");

        // Unreliable: a subset, in send order, no duplicates.
        let mut last = None;
        for &v in &received_unreliable {
            if let Some(prev) = last {
                assert!(v > prev, "unreliable delivery out of order");
            }
            last = Some(v);
        }
    }
}

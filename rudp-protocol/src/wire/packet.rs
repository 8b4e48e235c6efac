use anyhow::bail;

use super::deser::Deserialize;
use super::deser::DeserializeError;
use super::deser::DeserializeResult;
use super::deser::Deserializer;
use super::ser::Serialize;
use super::ser::SerializeResult;
use super::ser::Serializer;
use super::ser::VecSerializer;

pub const HEADER_SIZE: usize = 8;

/// Size on the wire of a full CONN_REQ datagram (header + nonce).
/// Unknown sources must match this exactly to be treated as a handshake.
pub const CONN_REQ_SIZE: usize = HEADER_SIZE + 4;

/// Wire command code of the first application command.
pub const CMD_APP_BASE: u8 = 0x10;

/// Highest user command value (wire code 0xFF).
pub const CMD_APP_MAX: u8 = 0xFF - CMD_APP_BASE;

/// Packet delivery is reliable: kept in the send queue and
/// retransmitted until acknowledged.
pub const OPT_RELIABLE: u8 = 0x01;

/// Packet piggybacks an acknowledgement; the acked sequence
/// number is in `reliable_ack`.
pub const OPT_ACK: u8 = 0x02;

/// Packet was transmitted at least once before.
pub const OPT_RETRANSMITTED: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Noop,
    Close,
    ConnReq,
    ConnRsp,
    Ping,
    Pong,
    /// Application packet. The stored value is the user command,
    /// i.e. the wire code minus `CMD_APP_BASE`.
    App(u8),
}

impl Command {
    pub fn to_wire(self) -> u8 {
        match self {
            Command::Noop => 0,
            Command::Close => 1,
            Command::ConnReq => 2,
            Command::ConnRsp => 3,
            Command::Ping => 4,
            Command::Pong => 5,
            Command::App(user) => CMD_APP_BASE + user,
        }
    }

    pub fn from_wire(code: u8) -> DeserializeResult<Self> {
        match code {
            0 => Ok(Command::Noop),
            1 => Ok(Command::Close),
            2 => Ok(Command::ConnReq),
            3 => Ok(Command::ConnRsp),
            4 => Ok(Command::Ping),
            5 => Ok(Command::Pong),
            code if code >= CMD_APP_BASE => Ok(Command::App(code - CMD_APP_BASE)),
            code => bail!(DeserializeError::UnknownCommand(code)),
        }
    }

    /// Log-friendly command name, total over all codes.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "NOOP",
            Command::Close => "CLOSE",
            Command::ConnReq => "CONN_REQ",
            Command::ConnRsp => "CONN_RSP",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::App(_) => "APP",
        }
    }
}

impl Serialize for Command {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        u8::serialize(&value.to_wire(), ser)
    }
}

impl Deserialize for Command {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Command::from_wire(u8::deserialize(deser)?)
    }
}

/// Fixed 8-byte header present on every datagram.
/// All multi-byte fields travel in network byte order.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHeader {
    pub command: Command,
    pub opt: u8,
    pub reliable_ack: u16,
    pub reliable: u16,
    pub unreliable: u16,
}

impl PacketHeader {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            opt: 0,
            reliable_ack: 0,
            reliable: 0,
            unreliable: 0,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.opt & OPT_RELIABLE != 0
    }

    pub fn has_ack(&self) -> bool {
        self.opt & OPT_ACK != 0
    }

    pub fn is_retransmitted(&self) -> bool {
        self.opt & OPT_RETRANSMITTED != 0
    }
}

impl Serialize for PacketHeader {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        Command::serialize(&value.command, ser)?;
        u8::serialize(&value.opt, ser)?;
        u16::serialize(&value.reliable_ack, ser)?;
        u16::serialize(&value.reliable, ser)?;
        u16::serialize(&value.unreliable, ser)?;
        Ok(())
    }
}

impl Deserialize for PacketHeader {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(PacketHeader {
            command: Command::deserialize(deser)?,
            opt: u8::deserialize(deser)?,
            reliable_ack: u16::deserialize(deser)?,
            reliable: u16::deserialize(deser)?,
            unreliable: u16::deserialize(deser)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnReqBody {
    pub nonce: u32,
}

impl Serialize for ConnReqBody {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        u32::serialize(&value.nonce, ser)
    }
}

impl Deserialize for ConnReqBody {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(Self {
            nonce: u32::deserialize(deser)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnRspBody {
    pub accepted: u32,
}

impl Serialize for ConnRspBody {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        u32::serialize(&value.accepted, ser)
    }
}

impl Deserialize for ConnRspBody {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(Self {
            accepted: u32::deserialize(deser)?,
        })
    }
}

/// PING/PONG body: a millisecond timestamp, opaque to the remote
/// side except that a PONG must echo it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct PingBody {
    pub timestamp: u64,
}

impl Serialize for PingBody {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        u64::serialize(&value.timestamp, ser)
    }
}

impl Deserialize for PingBody {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(Self {
            timestamp: u64::deserialize(deser)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Empty,
    ConnReq(ConnReqBody),
    ConnRsp(ConnRspBody),
    Ping(PingBody),
    Pong(PingBody),
    App(Vec<u8>),
}

impl Serialize for PacketBody {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        match value {
            PacketBody::Empty => Ok(()),
            PacketBody::ConnReq(b) => ConnReqBody::serialize(b, ser),
            PacketBody::ConnRsp(b) => ConnRspBody::serialize(b, ser),
            PacketBody::Ping(b) => PingBody::serialize(b, ser),
            PacketBody::Pong(b) => PingBody::serialize(b, ser),
            PacketBody::App(payload) => ser.write_bytes(payload),
        }
    }
}

/// One protocol datagram: header plus a command-specific body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl Packet {
    pub fn noop() -> Self {
        Self {
            header: PacketHeader::new(Command::Noop),
            body: PacketBody::Empty,
        }
    }

    pub fn close() -> Self {
        Self {
            header: PacketHeader::new(Command::Close),
            body: PacketBody::Empty,
        }
    }

    pub fn conn_req() -> Self {
        Self {
            header: PacketHeader::new(Command::ConnReq),
            body: PacketBody::ConnReq(ConnReqBody { nonce: 0 }),
        }
    }

    pub fn conn_rsp() -> Self {
        Self {
            header: PacketHeader::new(Command::ConnRsp),
            body: PacketBody::ConnRsp(ConnRspBody { accepted: 1 }),
        }
    }

    pub fn ping(timestamp: u64) -> Self {
        Self {
            header: PacketHeader::new(Command::Ping),
            body: PacketBody::Ping(PingBody { timestamp }),
        }
    }

    pub fn pong(echo: PingBody) -> Self {
        Self {
            header: PacketHeader::new(Command::Pong),
            body: PacketBody::Pong(echo),
        }
    }

    pub fn app(command: u8, payload: &[u8]) -> Self {
        debug_assert!(command <= CMD_APP_MAX);
        Self {
            header: PacketHeader::new(Command::App(command)),
            body: PacketBody::App(payload.to_vec()),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut ser = VecSerializer::new(HEADER_SIZE + 16);
        // Infallible with a Vec-backed serializer.
        Packet::serialize(self, &mut ser).expect("packet serialization cannot fail");
        ser.take()
    }

    /// Parse one datagram. Rejects anything shorter than the fixed
    /// header and anything with an unrecognised command code.
    pub fn decode(data: &[u8]) -> DeserializeResult<Self> {
        if data.len() < HEADER_SIZE {
            bail!(DeserializeError::Truncated(data.len()));
        }
        let mut deser = Deserializer::new(data);
        let header = PacketHeader::deserialize(&mut deser)?;
        let body = match header.command {
            Command::Noop | Command::Close => {
                deser.take_all();
                PacketBody::Empty
            }
            Command::ConnReq => PacketBody::ConnReq(ConnReqBody::deserialize(&mut deser)?),
            Command::ConnRsp => PacketBody::ConnRsp(ConnRspBody::deserialize(&mut deser)?),
            Command::Ping => PacketBody::Ping(PingBody::deserialize(&mut deser)?),
            Command::Pong => PacketBody::Pong(PingBody::deserialize(&mut deser)?),
            Command::App(_) => PacketBody::App(Vec::from(deser.take_all())),
        };
        Ok(Packet { header, body })
    }
}

impl Serialize for Packet {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        PacketHeader::serialize(&value.header, ser)?;
        PacketBody::serialize(&value.body, ser)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_bit_exact() {
        let mut pkt = Packet::app(0x42, b"hi");
        pkt.header.opt = OPT_RELIABLE | OPT_ACK;
        pkt.header.reliable_ack = 0x1234;
        pkt.header.reliable = 0xfffe;
        pkt.header.unreliable = 0x0001;
        let raw = pkt.encode();
        assert_eq!(
            raw,
            vec![0x52, 0x03, 0x12, 0x34, 0xff, 0xfe, 0x00, 0x01, b'h', b'i']
        );
    }

    #[test]
    fn round_trip_every_command() {
        let mut packets = vec![
            Packet::noop(),
            Packet::close(),
            Packet::conn_req(),
            Packet::conn_rsp(),
            Packet::ping(0x0123456789abcdef),
            Packet::pong(PingBody {
                timestamp: u64::MAX,
            }),
            Packet::app(0, b""),
            Packet::app(CMD_APP_MAX, b"payload bytes"),
        ];
        for (i, pkt) in packets.iter_mut().enumerate() {
            pkt.header.reliable = i as u16;
            pkt.header.unreliable = (i * 3) as u16;
            let raw = pkt.encode();
            let parsed = Packet::decode(&raw).unwrap();
            assert_eq!(&parsed, pkt);
            assert_eq!(parsed.encode(), raw);
        }
    }

    #[test]
    fn app_command_maps_to_wire_code() {
        let raw = Packet::app(0, b"x").encode();
        assert_eq!(raw[0], CMD_APP_BASE);
        match Packet::decode(&raw).unwrap().header.command {
            Command::App(user) => assert_eq!(user, 0),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_short_datagrams() {
        for len in 0..HEADER_SIZE {
            let data = vec![0u8; len];
            assert!(Packet::decode(&data).is_err(), "accepted {} bytes", len);
        }
    }

    #[test]
    fn rejects_unknown_commands() {
        for code in 6..CMD_APP_BASE {
            let mut data = vec![0u8; HEADER_SIZE];
            data[0] = code;
            assert!(
                Packet::decode(&data).is_err(),
                "accepted command {:#04x}",
                code
            );
        }
    }

    #[test]
    fn conn_req_datagram_has_expected_size() {
        assert_eq!(Packet::conn_req().encode().len(), CONN_REQ_SIZE);
    }
}

//! Wire primitives shared by the server and client halves of the transport.
//!
//! Every application packet on either transport is `[i32 length][payload]`,
//! little-endian. UDP datagrams additionally lead with the sender's
//! `[i32 client id]` so the server can multiplex one socket across clients.

pub mod framing;
pub mod packet;

pub use framing::FrameBuffer;
pub use packet::Packet;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a length prefix or a client id on the wire.
pub const HEADER_SIZE: usize = 4;
/// Hard ceiling for the logical packet carried by one UDP datagram.
pub const MAX_UDP_PACKET_SIZE: usize = 500;
/// Default OS and read buffer size for both transports.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Default ceiling for a single TCP application packet.
pub const DEFAULT_MAX_TCP_PACKET_SIZE: usize = 1024 * 1024;
pub const DEFAULT_PORT: u16 = 26950;

/// Identity of one connection session, valid only for that session's lifetime.
///
/// Live ids are always in `[1, max_clients]`; zero is the unassigned sentinel
/// and can never be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u32);

impl ClientId {
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Interprets an id read off the wire. Non-positive values are never valid.
    pub fn from_wire(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().and_then(Self::new)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn to_wire(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application messages exchanged by the demo server and client.
///
/// The transport never looks inside a payload; these only exist so the two
/// binaries have something to say to each other.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Message {
    Welcome {
        client_id: u32,
        motd: String,
    },
    Login {
        name: String,
    },
    LoginAccepted,
    Ping {
        sequence: u32,
        timestamp: u64,
    },
    Pong {
        sequence: u32,
        timestamp: u64,
    },
    Chat {
        from: u32,
        text: String,
    },
    Logout,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(payload)
    }

    /// Wraps the encoded message in a packet ready for `write_length`.
    pub fn to_packet(&self) -> Result<Packet, bincode::Error> {
        let mut packet = Packet::new();
        packet.write_bytes(&self.encode()?);
        Ok(packet)
    }
}

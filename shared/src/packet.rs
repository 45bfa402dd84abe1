//! Growable byte cursor used to build and pick apart application packets.

use crate::{ClientId, HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A write buffer plus a read position.
///
/// Integers are little-endian. Reads never panic: running off the end yields
/// `None` and leaves the cursor where it was.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    data: BytesMut,
    read_pos: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps received bytes for reading.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            read_pos: 0,
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32_le(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Prefixes the current contents with their length.
    pub fn write_length(&mut self) {
        let mut framed = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        framed.put_i32_le(self.data.len() as i32);
        framed.extend_from_slice(&self.data);
        self.data = framed;
    }

    /// Prefixes the current contents with a client id, as UDP datagrams require.
    pub fn insert_client_id(&mut self, client_id: ClientId) {
        let mut prefixed = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        prefixed.put_i32_le(client_id.to_wire());
        prefixed.extend_from_slice(&self.data);
        self.data = prefixed;
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        if self.unread_len() < HEADER_SIZE {
            return None;
        }
        let value = (&self.data[self.read_pos..self.read_pos + HEADER_SIZE]).get_i32_le();
        self.read_pos += HEADER_SIZE;
        Some(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<Bytes> {
        if self.unread_len() < len {
            return None;
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.read_pos..self.read_pos + len]);
        self.read_pos += len;
        Some(bytes)
    }

    pub fn unread_len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

/// Frames a payload as `[length][payload]`.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut packet = Packet::new();
    packet.write_bytes(payload);
    packet.write_length();
    packet.to_bytes()
}

/// Builds a client-to-server datagram: `[client id][length][payload]`.
pub fn udp_datagram(client_id: ClientId, payload: &[u8]) -> Bytes {
    let mut packet = Packet::new();
    packet.write_bytes(payload);
    packet.write_length();
    packet.insert_client_id(client_id);
    packet.to_bytes()
}

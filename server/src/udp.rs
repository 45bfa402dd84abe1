//! Per-client view of the server's single shared UDP socket.
//!
//! A client owns no socket here, only the endpoint bound during the one-shot
//! handshake. Sends before that handshake are silently skipped.

use crate::client::Client;
use crate::config::Protocol;
use crate::dispatch::{Dispatcher, MainThreadCommand};
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{ClientId, Packet, MAX_UDP_PACKET_SIZE};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Why a datagram's embedded packet was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRejection {
    MissingLength,
    NonPositiveLength(i32),
    TooLarge(usize),
    Truncated { declared: usize, available: usize },
    /// Well formed, but the main thread queue was full or closed.
    Undeliverable,
}

impl fmt::Display for PayloadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRejection::MissingLength => write!(f, "missing length header"),
            PayloadRejection::NonPositiveLength(len) => write!(f, "non-positive length {}", len),
            PayloadRejection::TooLarge(len) => {
                write!(f, "length {} exceeds {} bytes", len, MAX_UDP_PACKET_SIZE)
            }
            PayloadRejection::Truncated {
                declared,
                available,
            } => write!(f, "length {} but only {} bytes left", declared, available),
            PayloadRejection::Undeliverable => write!(f, "main thread queue full or closed"),
        }
    }
}

/// Reads `[length][payload]` from the cursor, enforcing the UDP ceiling.
pub fn extract_payload(packet: &mut Packet) -> Result<Bytes, PayloadRejection> {
    let declared = packet.read_i32().ok_or(PayloadRejection::MissingLength)?;
    if declared <= 0 {
        return Err(PayloadRejection::NonPositiveLength(declared));
    }
    let declared = declared as usize;
    if declared > MAX_UDP_PACKET_SIZE {
        return Err(PayloadRejection::TooLarge(declared));
    }
    let available = packet.unread_len();
    packet
        .read_bytes(declared)
        .ok_or(PayloadRejection::Truncated {
            declared,
            available,
        })
}

#[derive(Debug)]
pub struct UdpConnection {
    id: ClientId,
    socket: Option<Arc<UdpSocket>>,
    endpoint: Mutex<Option<SocketAddr>>,
}

impl UdpConnection {
    pub fn new(id: ClientId, socket: Option<Arc<UdpSocket>>) -> Self {
        Self {
            id,
            socket,
            endpoint: Mutex::new(None),
        }
    }

    /// Binds the remote endpoint. Only the first call takes effect.
    pub fn connect(&self, endpoint: SocketAddr) -> bool {
        let mut bound = self.endpoint.lock();
        if bound.is_some() {
            return false;
        }
        *bound = Some(endpoint);
        debug!("Client {} UDP bound to {}", self.id, endpoint);
        true
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock()
    }

    pub fn is_bound(&self) -> bool {
        self.endpoint.lock().is_some()
    }

    /// Frames the packet and sends it to the bound endpoint, if any.
    pub fn send_packet(&self, packet: &Packet) -> bool {
        let mut framed = packet.clone();
        framed.write_length();
        self.send_frame(&framed.to_bytes())
    }

    pub(crate) fn send_frame(&self, frame: &[u8]) -> bool {
        let (Some(socket), Some(endpoint)) = (self.socket.as_ref(), self.endpoint()) else {
            return false;
        };
        match socket.try_send_to(frame, endpoint) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Client {} UDP send would block, dropping datagram", self.id);
                false
            }
            Err(e) => {
                warn!("Client {} UDP send to {} failed: {}", self.id, endpoint, e);
                false
            }
        }
    }

    /// Extracts the embedded packet and marshals it to the main thread.
    ///
    /// One receive loop serves every client, so a full queue drops the
    /// datagram instead of stalling everyone's handshakes and traffic. TCP
    /// waits for room because its stream is per client and must stay ordered.
    pub(crate) fn handle_data(
        &self,
        client: &Arc<Client>,
        mut packet: Packet,
        dispatcher: &Dispatcher,
    ) -> Result<(), PayloadRejection> {
        let payload = extract_payload(&mut packet)?;
        let queued = dispatcher.try_send(MainThreadCommand::DataReceived {
            client: Arc::clone(client),
            protocol: Protocol::Udp,
            payload,
        });
        if queued {
            Ok(())
        } else {
            Err(PayloadRejection::Undeliverable)
        }
    }

    pub fn disconnect(&self) {
        if let Some(endpoint) = self.endpoint.lock().take() {
            debug!("Client {} UDP unbound from {}", self.id, endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram_body(declared: i32, payload: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.write_i32(declared);
        packet.write_bytes(payload);
        Packet::from_bytes(&packet.to_bytes())
    }

    #[test]
    fn test_extract_payload_accepts_well_formed() {
        let mut packet = datagram_body(3, b"abc");
        assert_eq!(extract_payload(&mut packet).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_extract_payload_at_ceiling() {
        let body = vec![7u8; MAX_UDP_PACKET_SIZE];
        let mut packet = datagram_body(MAX_UDP_PACKET_SIZE as i32, &body);
        assert_eq!(extract_payload(&mut packet).unwrap().len(), MAX_UDP_PACKET_SIZE);
    }

    #[test]
    fn test_extract_payload_rejects_over_ceiling() {
        let body = vec![7u8; MAX_UDP_PACKET_SIZE + 1];
        let mut packet = datagram_body(MAX_UDP_PACKET_SIZE as i32 + 1, &body);
        assert_eq!(
            extract_payload(&mut packet),
            Err(PayloadRejection::TooLarge(MAX_UDP_PACKET_SIZE + 1))
        );
    }

    #[test]
    fn test_extract_payload_rejects_read_past_end() {
        let mut packet = datagram_body(10, b"short");
        assert_eq!(
            extract_payload(&mut packet),
            Err(PayloadRejection::Truncated {
                declared: 10,
                available: 5
            })
        );
    }

    #[test]
    fn test_extract_payload_rejects_bad_headers() {
        let mut empty = Packet::from_bytes(&[1, 2]);
        assert_eq!(
            extract_payload(&mut empty),
            Err(PayloadRejection::MissingLength)
        );

        let mut negative = datagram_body(-1, b"abc");
        assert_eq!(
            extract_payload(&mut negative),
            Err(PayloadRejection::NonPositiveLength(-1))
        );
    }

    #[test]
    fn test_connect_binds_once() {
        let connection = UdpConnection::new(ClientId::new(1).unwrap(), None);
        let first: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        assert!(!connection.is_bound());
        assert!(connection.connect(first));
        assert!(!connection.connect(second));
        assert_eq!(connection.endpoint(), Some(first));

        connection.disconnect();
        assert!(!connection.is_bound());
    }

    #[test]
    fn test_send_before_handshake_is_noop() {
        let connection = UdpConnection::new(ClientId::new(1).unwrap(), None);
        assert!(!connection.send_packet(&Packet::new()));
    }

    #[test]
    fn test_handle_data_reports_a_full_queue() {
        let (dispatcher, mut main_thread) = crate::dispatch::channel(1);
        let client = crate::client::tests::detached_client(2);

        assert_eq!(
            client.udp().handle_data(&client, datagram_body(1, b"a"), &dispatcher),
            Ok(())
        );
        assert_eq!(
            client.udp().handle_data(&client, datagram_body(1, b"b"), &dispatcher),
            Err(PayloadRejection::Undeliverable)
        );
        assert!(main_thread.try_next().is_some());
        assert!(main_thread.try_next().is_none());
    }

    #[tokio::test]
    async fn test_send_after_handshake_reaches_endpoint() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connection = UdpConnection::new(ClientId::new(4).unwrap(), Some(server));
        assert!(!connection.send_packet(&Packet::new()));
        connection.connect(peer.local_addr().unwrap());

        let mut packet = Packet::new();
        packet.write_bytes(b"hi");
        assert!(connection.send_packet(&packet));

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let mut received = Packet::from_bytes(&buf[..len]);
        assert_eq!(received.read_i32(), Some(2));
        assert_eq!(received.read_bytes(2).unwrap().as_ref(), b"hi");
    }
}

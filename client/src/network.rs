//! Client half of the hybrid transport.

use bytes::Bytes;
use log::{debug, info, warn};
use shared::packet::{frame, udp_datagram};
use shared::{ClientId, FrameBuffer, Message, Packet, DEFAULT_BUFFER_SIZE};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// A payload received from the server, tagged with its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Tcp(Bytes),
    Udp(Bytes),
}

impl Incoming {
    pub fn payload(&self) -> &Bytes {
        match self {
            Incoming::Tcp(payload) | Incoming::Udp(payload) => payload,
        }
    }

    pub fn message(&self) -> Result<Message, bincode::Error> {
        Message::decode(self.payload())
    }
}

/// An established session: TCP connected, id known, UDP optionally bound.
pub struct Connection {
    client_id: ClientId,
    tcp_writer: OwnedWriteHalf,
    udp: Option<Arc<UdpSocket>>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Connects over TCP, waits for the server's `Welcome`, then performs the
    /// UDP handshake against `udp_addr` if given.
    pub async fn connect(
        tcp_addr: SocketAddr,
        udp_addr: Option<SocketAddr>,
        welcome_timeout: Duration,
    ) -> Result<Self, BoxError> {
        let stream = TcpStream::connect(tcp_addr).await?;
        let local_ip = stream.local_addr()?.ip();
        let (reader, tcp_writer) = stream.into_split();
        let (tx, mut incoming) = mpsc::unbounded_channel();

        let mut tasks = vec![tokio::spawn(tcp_receive_loop(reader, tx.clone()))];

        let client_id = match timeout(welcome_timeout, incoming.recv()).await {
            Ok(Some(first)) => match first.message()? {
                Message::Welcome { client_id, motd } => {
                    info!("Server says: {}", motd);
                    ClientId::new(client_id).ok_or("server assigned client id 0")?
                }
                other => return Err(format!("expected welcome, got {:?}", other).into()),
            },
            Ok(None) => return Err("server closed the connection before welcoming us".into()),
            Err(_) => return Err("timed out waiting for welcome".into()),
        };
        info!("Connected to {} as client {}", tcp_addr, client_id);

        let udp = match udp_addr {
            Some(addr) => {
                let socket = Arc::new(UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?);
                socket.connect(addr).await?;
                // One-shot handshake: the server binds our endpoint and does not reply.
                socket.send(&udp_datagram(client_id, &[])).await?;
                tasks.push(tokio::spawn(udp_receive_loop(Arc::clone(&socket), tx)));
                Some(socket)
            }
            None => None,
        };

        Ok(Self {
            client_id,
            tcp_writer,
            udp,
            incoming,
            tasks,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Sends one framed packet over TCP.
    pub async fn send_tcp(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.tcp_writer.write_all(&frame(payload)).await
    }

    /// Writes raw bytes to the TCP stream, framing left to the caller.
    pub async fn send_tcp_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.tcp_writer.write_all(bytes).await?;
        self.tcp_writer.flush().await
    }

    /// Sends one datagram. Fails if UDP was not set up.
    pub async fn send_udp(&self, payload: &[u8]) -> std::io::Result<()> {
        let socket = self.udp.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "UDP not configured")
        })?;
        socket.send(&udp_datagram(self.client_id, payload)).await?;
        Ok(())
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), BoxError> {
        self.send_tcp(&message.encode()?).await?;
        Ok(())
    }

    pub async fn send_message_udp(&self, message: &Message) -> Result<(), BoxError> {
        self.send_udp(&message.encode()?).await?;
        Ok(())
    }

    /// Next payload from either transport. `None` once both have closed.
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.incoming.recv().await
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Incoming> {
        timeout(wait, self.incoming.recv()).await.ok().flatten()
    }

    /// Closes the TCP write side and stops the receive tasks.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.tcp_writer.shutdown().await {
            debug!("TCP shutdown: {}", e);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn tcp_receive_loop<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Incoming>) {
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut frames = FrameBuffer::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Server closed the TCP connection");
                return;
            }
            Ok(n) => {
                frames.extend(&buf[..n]);
                while let Some(payload) = frames.next_frame() {
                    if tx.send(Incoming::Tcp(payload)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("TCP receive failed: {}", e);
                return;
            }
        }
    }
}

/// Server-to-client datagrams carry `[length][payload]` with no id.
async fn udp_receive_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Incoming>) {
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];

    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                continue;
            }
        };

        let mut packet = Packet::from_bytes(&buf[..len]);
        let payload = packet
            .read_i32()
            .and_then(|declared| usize::try_from(declared).ok())
            .and_then(|declared| packet.read_bytes(declared));
        match payload {
            Some(payload) => {
                if tx.send(Incoming::Udp(payload)).is_err() {
                    return;
                }
            }
            None => debug!("Dropping malformed {}-byte datagram", len),
        }
    }
}

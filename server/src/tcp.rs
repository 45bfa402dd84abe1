//! Reliable, ordered per-client connection.
//!
//! Each connected client gets a receive task feeding its own [`FrameBuffer`]
//! and a send task draining an outbound queue. Any I/O error on either task
//! disconnects the whole client; nothing is retried.

use crate::client::Client;
use crate::config::{Protocol, ServerOptions};
use crate::dispatch::{Dispatcher, MainThreadCommand};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{ClientId, FrameBuffer, Packet};
use socket2::SockRef;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-connection socket settings taken from [`ServerOptions`].
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub max_packet_size: usize,
}

impl From<&ServerOptions> for TcpSettings {
    fn from(options: &ServerOptions) -> Self {
        Self {
            receive_buffer_size: options.receive_buffer_size,
            send_buffer_size: options.send_buffer_size,
            receive_timeout: options.receive_timeout(),
            send_timeout: options.send_timeout(),
            max_packet_size: options.max_tcp_packet_size,
        }
    }
}

/// Present exactly while the client is connected over TCP.
#[derive(Debug)]
struct TcpLink {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Stops the receive task; the send task flushes then closes.
    shutdown: CancellationToken,
    /// Stops both tasks immediately.
    abort: CancellationToken,
}

#[derive(Debug)]
pub struct TcpConnection {
    id: ClientId,
    settings: TcpSettings,
    link: Mutex<Option<TcpLink>>,
}

impl TcpConnection {
    pub fn new(id: ClientId, settings: TcpSettings) -> Self {
        Self {
            id,
            settings,
            link: Mutex::new(None),
        }
    }

    /// Applies socket settings, records the peer, and starts the I/O tasks.
    ///
    /// Must be called from within the server runtime.
    pub(crate) fn connect(
        &self,
        stream: TcpStream,
        client: &Arc<Client>,
        dispatcher: Dispatcher,
    ) -> io::Result<()> {
        let remote = stream.peer_addr()?;
        let socket = SockRef::from(&stream);
        socket.set_recv_buffer_size(self.settings.receive_buffer_size)?;
        socket.set_send_buffer_size(self.settings.send_buffer_size)?;

        let (mut reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        {
            let mut link = self.link.lock();
            if link.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "client already connected over TCP",
                ));
            }
            *link = Some(TcpLink {
                remote,
                outbound: outbound_tx,
                shutdown: shutdown.clone(),
                abort: abort.clone(),
            });
        }

        let receive_client = Arc::clone(client);
        let settings = self.settings.clone();
        let receive_abort = abort.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                result = receive_loop(&mut reader, &receive_client, &dispatcher, &settings) => result,
            };
            match result {
                Ok(()) => {
                    if receive_abort.is_cancelled() {
                        let _ = SockRef::from(reader.as_ref()).shutdown(Shutdown::Both);
                    }
                }
                Err(e) => {
                    info!("Client {} TCP receive ended: {}", receive_client.id(), e);
                    receive_client.disconnect(true);
                }
            }
        });

        let send_client = Arc::clone(client);
        let send_timeout = self.settings.send_timeout;
        tokio::spawn(async move {
            if let Err(e) = send_loop(writer, outbound_rx, send_timeout, abort).await {
                warn!("Client {} TCP send failed: {}", send_client.id(), e);
                send_client.disconnect(true);
            }
        });

        debug!("Client {} TCP connected from {}", self.id, remote);
        Ok(())
    }

    /// Frames the packet and queues it for writing.
    pub fn send_packet(&self, packet: &Packet) -> bool {
        let mut framed = packet.clone();
        framed.write_length();
        self.send_frame(framed.to_bytes())
    }

    /// Queues an already framed packet. Returns false if not connected.
    pub(crate) fn send_frame(&self, frame: Bytes) -> bool {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            warn!("Client {} TCP send while not connected", self.id);
            return false;
        };
        if link.outbound.send(frame).is_err() {
            debug!("Client {} TCP send task already gone", self.id);
            return false;
        }
        true
    }

    /// Closes the connection. A graceful close flushes queued frames first.
    pub fn disconnect(&self, force: bool) {
        if let Some(link) = self.link.lock().take() {
            link.shutdown.cancel();
            if force {
                link.abort.cancel();
            }
            debug!(
                "Client {} TCP disconnected from {} (force: {})",
                self.id, link.remote, force
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.lock().as_ref().map(|link| link.remote)
    }
}

/// Reads until EOF or error, dispatching every complete packet in order.
///
/// The decode buffer lives for the whole connection so packets split across
/// reads are reassembled.
pub(crate) async fn receive_loop<R>(
    reader: &mut R,
    client: &Arc<Client>,
    dispatcher: &Dispatcher,
    settings: &TcpSettings,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut read_buf = vec![0u8; settings.receive_buffer_size];
    let mut frames = FrameBuffer::new(settings.max_packet_size);

    loop {
        let read = with_timeout(settings.receive_timeout, reader.read(&mut read_buf)).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }

        frames.extend(&read_buf[..read]);
        while let Some(payload) = frames.next_frame() {
            let command = MainThreadCommand::DataReceived {
                client: Arc::clone(client),
                protocol: Protocol::Tcp,
                payload,
            };
            if !dispatcher.send(command).await {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "main thread queue closed",
                ));
            }
        }
    }
}

/// Writes queued frames until the queue closes (graceful) or `abort` fires.
pub(crate) async fn send_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    send_timeout: Option<Duration>,
    abort: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(()),
            frame = outbound.recv() => match frame {
                Some(frame) => with_timeout(send_timeout, writer.write_all(&frame)).await?,
                None => {
                    with_timeout(send_timeout, writer.shutdown()).await?;
                    return Ok(());
                }
            },
        }
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socket operation timed out"))?,
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::detached_client;
    use crate::dispatch;
    use shared::packet::frame;
    use tokio_test::io::Builder;

    fn settings() -> TcpSettings {
        TcpSettings::from(&ServerOptions::default())
    }

    fn drain_payloads(main_thread: &mut dispatch::MainThread) -> Vec<Vec<u8>> {
        let mut payloads = Vec::new();
        while let Some(command) = main_thread.try_next() {
            if let MainThreadCommand::DataReceived { payload, protocol, .. } = command {
                assert_eq!(protocol, Protocol::Tcp);
                payloads.push(payload.to_vec());
            }
        }
        payloads
    }

    #[tokio::test]
    async fn test_receive_loop_reassembles_split_reads() {
        let first: Vec<u8> = (0..10).collect();
        let second: Vec<u8> = (100..120).collect();
        let mut stream = frame(&first).to_vec();
        stream.extend_from_slice(&frame(&second));

        let mut reader = Builder::new().read(&stream[..15]).read(&stream[15..]).build();
        let (dispatcher, mut main_thread) = dispatch::channel(16);
        let client = detached_client(1);

        let result = receive_loop(&mut reader, &client, &dispatcher, &settings()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(drain_payloads(&mut main_thread), vec![first, second]);
    }

    #[tokio::test]
    async fn test_receive_loop_coalesced_reads() {
        let mut stream = Vec::new();
        for i in 0..4u8 {
            stream.extend_from_slice(&frame(&[i; 3]));
        }

        let mut reader = Builder::new().read(&stream).build();
        let (dispatcher, mut main_thread) = dispatch::channel(16);
        let client = detached_client(1);

        let _ = receive_loop(&mut reader, &client, &dispatcher, &settings()).await;
        let payloads = drain_payloads(&mut main_thread);
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[3], vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn test_receive_loop_surfaces_read_errors() {
        let mut reader = Builder::new()
            .read(&frame(b"ok"))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (dispatcher, mut main_thread) = dispatch::channel(16);
        let client = detached_client(1);

        let result = receive_loop(&mut reader, &client, &dispatcher, &settings()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(drain_payloads(&mut main_thread), vec![b"ok".to_vec()]);
    }

    #[tokio::test]
    async fn test_receive_loop_fails_when_main_thread_is_gone() {
        let mut reader = Builder::new().read(&frame(b"orphan")).build();
        let (dispatcher, main_thread) = dispatch::channel(16);
        drop(main_thread);
        let client = detached_client(1);

        let result = receive_loop(&mut reader, &client, &dispatcher, &settings()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_send_loop_writes_frames_then_shuts_down() {
        let one = frame(b"one");
        let two = frame(b"two");
        let writer = Builder::new().write(&one).write(&two).build();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(one.clone()).unwrap();
        tx.send(two.clone()).unwrap();
        drop(tx);

        let result = send_loop(writer, rx, None, CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_loop_stops_on_abort() {
        let writer = Builder::new().build();
        let (_tx, rx) = mpsc::unbounded_channel();
        let abort = CancellationToken::new();
        abort.cancel();

        assert!(send_loop(writer, rx, None, abort).await.is_ok());
    }

    #[test]
    fn test_send_without_connection_fails() {
        let connection = TcpConnection::new(ClientId::new(1).unwrap(), settings());
        assert!(!connection.is_connected());
        assert!(connection.remote_addr().is_none());
        assert!(!connection.send_packet(&Packet::new()));
        connection.disconnect(true);
    }
}

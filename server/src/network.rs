//! Server transport layer: TCP accept, UDP demultiplexing and the send API.
//!
//! `listen` starts one background thread that owns an I/O runtime. Accept and
//! datagram handling run on that runtime; everything they produce for the
//! domain goes through the dispatch queue to the main thread.

use crate::callbacks::ServerCallbacks;
use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::config::{Protocol, ServerOptions};
use crate::dispatch::{self, Dispatcher, MainThread};
use crate::error::{Result, ServerError};
use crate::udp::PayloadRejection;
use log::{debug, error, info, warn};
use shared::{ClientId, Packet, HEADER_SIZE};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

/// What happened to one incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    Forwarded(ClientId),
    /// The handshake datagram itself; it binds the endpoint and is not forwarded.
    Bound(ClientId),
    TooShort,
    UnknownClient(i32),
    TcpNotConnected(ClientId),
    SourceIpMismatch(ClientId),
    EndpointMismatch(ClientId),
    Malformed(ClientId),
    /// Well formed, but the main thread queue had no room.
    Dropped(ClientId),
}

/// State shared between the server handle, its I/O tasks and its clients.
pub(crate) struct ServerShared {
    pub(crate) options: ServerOptions,
    pub(crate) callbacks: Box<dyn ServerCallbacks>,
    pub(crate) clients: ClientManager,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) runtime: OnceLock<Handle>,
    udp_socket: OnceLock<Arc<UdpSocket>>,
    /// Stops both listeners. Accepts that land after it fires are abandoned.
    shutdown: CancellationToken,
}

impl ServerShared {
    fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Some(id) = self.clients.reserve_id() else {
            warn!("Server full, refusing connection from {}", addr);
            self.callbacks.on_server_full();
            return;
        };

        let client = Arc::new(Client::new(
            id,
            &self.options,
            self.udp_socket.get().cloned(),
            Arc::downgrade(self),
        ));

        if !self.callbacks.on_client_connecting(&client) {
            info!("Connection from {} rejected", addr);
            self.clients.release_id(id);
            return;
        }

        if !self.clients.insert(Arc::clone(&client)) {
            self.clients.release_id(id);
            return;
        }

        // Inserted after `stop` began draining the registry.
        if self.shutdown.is_cancelled() {
            debug!("Server stopping, dropping connection from {}", addr);
            self.clients.remove(&client);
            return;
        }

        // Never established, so no disconnect callback either.
        if let Err(e) = client.connect_tcp(stream) {
            warn!("Failed to set up connection from {}: {}", addr, e);
            self.clients.remove(&client);
            return;
        }

        if client.is_disconnected() {
            client.tcp().disconnect(true);
            return;
        }

        info!("Client {} connected from {}", id, addr);
        self.callbacks.on_client_established(&client);

        if let Some(timeout) = self.options.authentication_timeout {
            client.start_authentication_timer(timeout, |client| client.disconnect(true));
        }
    }

    /// Routes one datagram: `[client id][length][payload]`.
    pub(crate) fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> DatagramOutcome {
        if datagram.len() < HEADER_SIZE {
            debug!("Dropping {}-byte datagram from {}", datagram.len(), from);
            return DatagramOutcome::TooShort;
        }

        let mut packet = Packet::from_bytes(datagram);
        let raw_id = packet.read_i32().unwrap_or_default();
        let Some(client) = ClientId::from_wire(raw_id).and_then(|id| self.clients.get(id)) else {
            warn!("Dropping datagram from {} for unknown client {}", from, raw_id);
            return DatagramOutcome::UnknownClient(raw_id);
        };
        let id = client.id();

        let Some(tcp_remote) = client.tcp().remote_addr() else {
            warn!("Dropping datagram from {} for client {} without TCP", from, id);
            return DatagramOutcome::TcpNotConnected(id);
        };

        match client.udp().endpoint() {
            None => {
                if tcp_remote.ip() != from.ip() {
                    warn!(
                        "Client {} UDP handshake from {} does not match TCP address {}",
                        id, from, tcp_remote
                    );
                    return DatagramOutcome::SourceIpMismatch(id);
                }
                if client.udp().connect(from) {
                    return DatagramOutcome::Bound(id);
                }
                // Lost a race with another handshake; fall through to the bound check.
                if client.udp().endpoint() != Some(from) {
                    return DatagramOutcome::EndpointMismatch(id);
                }
            }
            Some(endpoint) if endpoint != from => {
                warn!(
                    "Possible spoofing: client {} is bound to {} but datagram came from {}",
                    id, endpoint, from
                );
                return DatagramOutcome::EndpointMismatch(id);
            }
            Some(_) => {}
        }

        match client.udp().handle_data(&client, packet, &self.dispatcher) {
            Ok(()) => DatagramOutcome::Forwarded(id),
            Err(PayloadRejection::Undeliverable) => DatagramOutcome::Dropped(id),
            Err(reason) => {
                warn!("Dropping datagram from client {}: {}", id, reason);
                DatagramOutcome::Malformed(id)
            }
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => shared.handle_accept(stream, addr),
            Err(e) => {
                error!("Error accepting TCP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("TCP accept loop stopped");
}

async fn udp_receive_loop(shared: Arc<ServerShared>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
    let mut buffer = vec![0u8; shared.options.receive_buffer_size.max(HEADER_SIZE)];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((len, from)) => {
                shared.handle_datagram(&buffer[..len], from);
            }
            Err(e) => {
                // ICMP port-unreachable from a vanished peer surfaces here; keep going.
                warn!("Error receiving UDP datagram: {}", e);
            }
        }
    }
    debug!("UDP receive loop stopped");
}

/// Owner of the listening sockets, the client registry and the send API.
pub struct Server {
    shared: Arc<ServerShared>,
    thread: Option<JoinHandle<()>>,
    local_tcp_addr: Option<SocketAddr>,
    local_udp_addr: Option<SocketAddr>,
}

impl Server {
    /// Validates `options` and builds a server plus the main-thread end of
    /// its dispatch queue. Nothing is bound until [`Server::listen`].
    pub fn new(
        options: ServerOptions,
        callbacks: impl ServerCallbacks,
    ) -> Result<(Self, MainThread)> {
        options.validate()?;

        let (dispatcher, main_thread) = dispatch::channel(options.dispatch_queue_capacity);
        let shared = Arc::new(ServerShared {
            clients: ClientManager::new(options.max_clients),
            callbacks: Box::new(callbacks),
            dispatcher,
            runtime: OnceLock::new(),
            udp_socket: OnceLock::new(),
            shutdown: CancellationToken::new(),
            options,
        });

        let server = Server {
            shared,
            thread: None,
            local_tcp_addr: None,
            local_udp_addr: None,
        };
        Ok((server, main_thread))
    }

    /// Binds the configured transports and starts the I/O thread.
    ///
    /// With `Both`, UDP binds to the port TCP actually got, so port 0 works.
    pub fn listen(&mut self) -> Result<()> {
        if self.thread.is_some() || self.shared.shutdown.is_cancelled() {
            return Err(ServerError::AlreadyListening);
        }

        let options = &self.shared.options;
        let addr = options.socket_addr();

        let tcp_listener = if options.protocol.allows_tcp() {
            let listener =
                std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            listener.set_nonblocking(true)?;
            self.local_tcp_addr = Some(listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        let udp_socket = if options.protocol.allows_udp() {
            let udp_addr = self.local_tcp_addr.unwrap_or(addr);
            let socket = std::net::UdpSocket::bind(udp_addr)
                .map_err(|source| ServerError::Bind { addr: udp_addr, source })?;
            socket.set_nonblocking(true)?;
            self.local_udp_addr = Some(socket.local_addr()?);
            Some(socket)
        } else {
            None
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("transport-io")
            .build()
            .map_err(ServerError::Runtime)?;
        let _ = self.shared.runtime.set(runtime.handle().clone());

        // The UDP socket must exist before the first client is built.
        if let Some(socket) = udp_socket {
            let socket = {
                let _guard = runtime.enter();
                Arc::new(UdpSocket::from_std(socket)?)
            };
            let _ = self.shared.udp_socket.set(socket);
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("transport-server".to_string())
            .spawn(move || run_io_thread(runtime, shared, tcp_listener, shutdown))
            .map_err(ServerError::Runtime)?;
        self.thread = Some(thread);

        info!(
            "Server listening ({}) tcp: {:?} udp: {:?}",
            self.shared.options.protocol, self.local_tcp_addr, self.local_udp_addr
        );
        Ok(())
    }

    /// Stops both listeners, force-disconnects every client and joins the
    /// I/O thread.
    pub fn stop(&mut self) {
        info!("Stopping server");
        self.shared.shutdown.cancel();
        for client in self.shared.clients.snapshot() {
            client.disconnect(true);
        }
        // Anything an in-flight accept registered after the snapshot.
        for client in self.shared.clients.clear() {
            client.disconnect(true);
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Server I/O thread panicked");
            }
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.local_tcp_addr
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.local_udp_addr
    }

    pub fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.shared.clients.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Disconnects one client, e.g. on logout. Returns false if unknown.
    pub fn disconnect_client(&self, id: ClientId, force: bool) -> bool {
        match self.shared.clients.get(id) {
            Some(client) => {
                client.disconnect(force);
                true
            }
            None => false,
        }
    }

    /// # Panics
    /// If the server was configured without TCP.
    pub fn send_tcp(&self, id: ClientId, packet: &Packet) -> bool {
        self.require(Protocol::Tcp);
        match self.shared.clients.get(id) {
            Some(client) => client.tcp().send_packet(packet),
            None => {
                debug!("TCP send to unknown client {}", id);
                false
            }
        }
    }

    /// # Panics
    /// If the server was configured without TCP.
    pub fn send_tcp_to_all(&self, packet: &Packet) {
        self.broadcast_tcp(packet, None);
    }

    /// # Panics
    /// If the server was configured without TCP.
    pub fn send_tcp_to_all_except(&self, except: ClientId, packet: &Packet) {
        self.broadcast_tcp(packet, Some(except));
    }

    /// Sends to the client's bound UDP endpoint. A client that has not yet
    /// completed the handshake is skipped silently.
    ///
    /// # Panics
    /// If the server was configured without UDP.
    pub fn send_udp(&self, id: ClientId, packet: &Packet) -> bool {
        self.require(Protocol::Udp);
        match self.shared.clients.get(id) {
            Some(client) => client.udp().send_packet(packet),
            None => {
                debug!("UDP send to unknown client {}", id);
                false
            }
        }
    }

    /// # Panics
    /// If the server was configured without UDP.
    pub fn send_udp_to_all(&self, packet: &Packet) {
        self.broadcast_udp(packet, None);
    }

    /// # Panics
    /// If the server was configured without UDP.
    pub fn send_udp_to_all_except(&self, except: ClientId, packet: &Packet) {
        self.broadcast_udp(packet, Some(except));
    }

    fn broadcast_tcp(&self, packet: &Packet, except: Option<ClientId>) {
        self.require(Protocol::Tcp);
        let frame = framed(packet);
        for client in self.shared.clients.snapshot() {
            if Some(client.id()) == except || !client.tcp().is_connected() {
                continue;
            }
            client.tcp().send_frame(frame.clone());
        }
    }

    fn broadcast_udp(&self, packet: &Packet, except: Option<ClientId>) {
        self.require(Protocol::Udp);
        let frame = framed(packet);
        for client in self.shared.clients.snapshot() {
            if Some(client.id()) == except {
                continue;
            }
            client.udp().send_frame(&frame);
        }
    }

    fn require(&self, transport: Protocol) {
        let configured = self.shared.options.protocol;
        let allowed = match transport {
            Protocol::Tcp => configured.allows_tcp(),
            Protocol::Udp => configured.allows_udp(),
            Protocol::Both => configured == Protocol::Both,
        };
        assert!(
            allowed,
            "{} send on a server configured for {}",
            transport, configured
        );
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn framed(packet: &Packet) -> bytes::Bytes {
    let mut framed = packet.clone();
    framed.write_length();
    framed.to_bytes()
}

fn run_io_thread(
    runtime: Runtime,
    shared: Arc<ServerShared>,
    tcp_listener: Option<std::net::TcpListener>,
    shutdown: CancellationToken,
) {
    runtime.block_on(async {
        if let Some(listener) = tcp_listener {
            match TcpListener::from_std(listener) {
                Ok(listener) => {
                    tokio::spawn(accept_loop(Arc::clone(&shared), listener, shutdown.clone()));
                }
                Err(e) => error!("Failed to register TCP listener: {}", e),
            }
        }
        if let Some(socket) = shared.udp_socket.get().cloned() {
            tokio::spawn(udp_receive_loop(Arc::clone(&shared), socket, shutdown.clone()));
        }
        shutdown.cancelled().await;
    });
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("Server stopped");
}

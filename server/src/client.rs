//! One connection session: its two transports plus authentication state.

use crate::config::ServerOptions;
use crate::network::ServerShared;
use crate::tcp::{TcpConnection, TcpSettings};
use crate::udp::UdpConnection;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::ClientId;
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Domain state attached to an authenticated session, opaque to the transport.
pub type DomainPayload = Box<dyn Any + Send + Sync>;

/// A connected client.
///
/// Created by the server on an approved accept and destroyed by
/// [`Client::disconnect`], which runs at most once.
pub struct Client {
    id: ClientId,
    tcp: TcpConnection,
    udp: UdpConnection,
    authenticated: AtomicBool,
    running_task: AtomicBool,
    cancel: CancellationToken,
    payload: Mutex<Option<DomainPayload>>,
    disconnecting: AtomicBool,
    server: Weak<ServerShared>,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        options: &ServerOptions,
        udp_socket: Option<Arc<UdpSocket>>,
        server: Weak<ServerShared>,
    ) -> Self {
        Self {
            id,
            tcp: TcpConnection::new(id, TcpSettings::from(options)),
            udp: UdpConnection::new(id, udp_socket),
            authenticated: AtomicBool::new(false),
            running_task: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            payload: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            server,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn tcp(&self) -> &TcpConnection {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpConnection {
        &self.udp
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// Whether domain code has async work in flight for this client.
    pub fn is_running_task(&self) -> bool {
        self.running_task.load(Ordering::Acquire)
    }

    pub fn set_running_task(&self, running: bool) {
        self.running_task.store(running, Ordering::Release);
    }

    /// Cancelled when the client disconnects. Domain work scoped to this
    /// connection should select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attaches domain state, returning any previous payload.
    pub fn attach_payload(&self, payload: DomainPayload) -> Option<DomainPayload> {
        self.payload.lock().replace(payload)
    }

    pub fn has_payload(&self) -> bool {
        self.payload.lock().is_some()
    }

    /// Runs `f` against the attached payload if it is a `T`.
    pub fn with_payload<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.payload.lock();
        let payload = &mut **guard.as_mut()?;
        payload.downcast_mut::<T>().map(f)
    }

    /// True once teardown has started. No data is delivered after this.
    pub fn is_disconnected(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn connect_tcp(self: &Arc<Self>, stream: TcpStream) -> io::Result<()> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server dropped"))?;
        self.tcp.connect(stream, self, server.dispatcher.clone())
    }

    /// Tears the session down. Only the first call has any effect.
    ///
    /// Closes TCP then UDP, cancels in-flight domain work, notifies the
    /// disconnect callback, frees the id, and if the client was authenticated
    /// with a payload, queues world teardown for the main thread.
    pub fn disconnect(self: &Arc<Self>, force: bool) {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            debug!("Client {} already disconnecting", self.id);
            return;
        }

        self.tcp.disconnect(force);
        self.udp.disconnect();
        self.cancel.cancel();
        self.set_running_task(false);

        let Some(server) = self.server.upgrade() else {
            return;
        };

        server
            .callbacks
            .on_client_disconnected(self, server.options.protocol);
        server.clients.remove(self);
        info!("Client {} disconnected", self.id);

        if self.is_authenticated() {
            if let Some(payload) = self.payload.lock().take() {
                server.dispatcher.schedule_teardown(Arc::clone(self), payload);
            }
        }
    }

    /// Calls `on_timeout` if the client is still unauthenticated after `timeout`.
    ///
    /// The timer dies with the client: disconnecting first cancels it.
    pub fn start_authentication_timer<F>(self: &Arc<Self>, timeout: Duration, on_timeout: F)
    where
        F: FnOnce(&Arc<Client>) + Send + 'static,
    {
        let Some(runtime) = self.runtime() else {
            warn!("Client {} has no runtime for its auth timer", self.id);
            return;
        };

        let client = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(client) = client.upgrade() {
                        if !client.is_authenticated() {
                            warn!("Client {} failed to authenticate within {:?}", client.id(), timeout);
                            on_timeout(&client);
                        }
                    }
                }
            }
        });
    }

    fn runtime(&self) -> Option<Handle> {
        self.server
            .upgrade()
            .and_then(|server| server.runtime.get().cloned())
            .or_else(|| Handle::try_current().ok())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("tcp", &self.tcp.remote_addr())
            .field("udp", &self.udp.endpoint())
            .field("authenticated", &self.is_authenticated())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A client with no server behind it.
    pub(crate) fn detached_client(raw_id: u32) -> Arc<Client> {
        Arc::new(Client::new(
            ClientId::new(raw_id).unwrap(),
            &ServerOptions::default(),
            None,
            Weak::new(),
        ))
    }

    struct PlayerRecord {
        name: String,
    }

    #[test]
    fn test_client_creation() {
        let client = detached_client(3);
        assert_eq!(client.id().get(), 3);
        assert!(!client.is_authenticated());
        assert!(!client.tcp().is_connected());
        assert!(!client.udp().is_bound());
        assert!(!client.is_disconnected());
    }

    #[test]
    fn test_disconnect_cancels_domain_work() {
        let client = detached_client(1);
        let token = client.cancellation_token();
        client.set_running_task(true);

        client.disconnect(false);

        assert!(token.is_cancelled());
        assert!(!client.is_running_task());
        assert!(client.is_disconnected());
    }

    #[test]
    fn test_disconnect_twice_is_harmless() {
        let client = detached_client(1);
        client.disconnect(true);
        client.disconnect(true);
        assert!(client.is_disconnected());
    }

    #[test]
    fn test_payload_round_trip() {
        let client = detached_client(1);
        assert!(!client.has_payload());
        client.attach_payload(Box::new(PlayerRecord {
            name: "ada".to_string(),
        }));

        let name = client.with_payload(|record: &mut PlayerRecord| record.name.clone());
        assert_eq!(name.as_deref(), Some("ada"));
        assert!(client.with_payload(|_: &mut u32| ()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timer_fires_when_unauthenticated() {
        let client = detached_client(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        client.start_authentication_timer(Duration::from_secs(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timer_skips_authenticated_client() {
        let client = detached_client(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        client.start_authentication_timer(Duration::from_secs(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.set_authenticated(true);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timer_cancelled_by_disconnect() {
        let client = detached_client(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        client.start_authentication_timer(Duration::from_secs(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.disconnect(true);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

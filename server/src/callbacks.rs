//! Notifications the transport raises to the domain layer.

use crate::client::{Client, DomainPayload};
use crate::config::Protocol;
use crate::network::Server;
use shared::Packet;
use std::sync::Arc;

/// Connection lifecycle hooks.
///
/// These run on transport threads, so implementations must not touch
/// simulation state directly. Every method has a default.
pub trait ServerCallbacks: Send + Sync + 'static {
    /// Gate for a freshly accepted connection. Returning false closes it
    /// without registering the client.
    fn on_client_connecting(&self, _client: &Client) -> bool {
        true
    }

    fn on_client_established(&self, _client: &Arc<Client>) {}

    fn on_client_disconnected(&self, _client: &Client, _protocol: Protocol) {}

    fn on_server_full(&self) {}
}

/// Callbacks with all defaults, for servers that only care about data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl ServerCallbacks for NoCallbacks {}

/// Domain hooks run on the main thread while it drains the dispatch queue.
pub trait MainThreadHandler {
    /// A complete application packet from `client`.
    fn on_data_received(
        &mut self,
        server: &Server,
        client: &Arc<Client>,
        protocol: Protocol,
        packet: Packet,
    );

    /// An authenticated client with an attached payload disconnected.
    /// World teardown and persistence belong here.
    fn on_session_teardown(
        &mut self,
        _server: &Server,
        _client: &Arc<Client>,
        _payload: DomainPayload,
    ) {
    }
}

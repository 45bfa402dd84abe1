//! Demo simulation: logins, pings and chat, all mutated on the main thread.

use log::{info, warn};
use server::{Client, DomainPayload, MainThreadHandler, Protocol, Server, ServerCallbacks};
use shared::{ClientId, Message, Packet};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-session record attached to an authenticated client.
#[derive(Debug, Clone)]
pub struct Player {
    pub name: String,
    pub joined: Instant,
}

/// Transport-thread hooks: greet each connection with its id.
pub struct Greeter {
    pub motd: String,
}

impl ServerCallbacks for Greeter {
    fn on_client_established(&self, client: &Arc<Client>) {
        let welcome = Message::Welcome {
            client_id: client.id().get(),
            motd: self.motd.clone(),
        };
        match welcome.to_packet() {
            Ok(packet) => {
                client.tcp().send_packet(&packet);
            }
            Err(e) => warn!("Failed to encode welcome: {}", e),
        }
    }

    fn on_client_disconnected(&self, client: &Client, protocol: Protocol) {
        info!("Client {} left ({})", client.id(), protocol);
    }

    fn on_server_full(&self) {
        warn!("Server full, turning a connection away");
    }
}

#[derive(Default)]
pub struct GameState {
    pub tick: u64,
    pub players: HashMap<ClientId, Player>,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_message(&mut self, server: &Server, client: &Arc<Client>, protocol: Protocol, message: Message) {
        match message {
            Message::Login { name } => {
                if client.is_authenticated() {
                    return;
                }
                let player = Player {
                    name: name.clone(),
                    joined: Instant::now(),
                };
                self.players.insert(client.id(), player.clone());
                client.attach_payload(Box::new(player));
                client.set_authenticated(true);
                info!("Client {} logged in as {}", client.id(), name);
                send(server, client.id(), Protocol::Tcp, &Message::LoginAccepted);
            }
            Message::Ping { sequence, timestamp } => {
                // Answer on the transport the ping arrived on.
                send(server, client.id(), protocol, &Message::Pong { sequence, timestamp });
            }
            Message::Chat { text, .. } => {
                if !client.is_authenticated() {
                    warn!("Client {} chatted before logging in", client.id());
                    return;
                }
                let relay = Message::Chat {
                    from: client.id().get(),
                    text,
                };
                if let Ok(packet) = relay.to_packet() {
                    server.send_tcp_to_all_except(client.id(), &packet);
                }
            }
            Message::Logout => {
                server.disconnect_client(client.id(), false);
            }
            other => warn!("Unexpected message from client {}: {:?}", client.id(), other),
        }
    }
}

impl MainThreadHandler for GameState {
    fn on_data_received(&mut self, server: &Server, client: &Arc<Client>, protocol: Protocol, mut packet: Packet) {
        let len = packet.unread_len();
        let Some(payload) = packet.read_bytes(len) else {
            return;
        };
        match Message::decode(&payload) {
            Ok(message) => self.handle_message(server, client, protocol, message),
            Err(e) => warn!("Undecodable packet from client {}: {}", client.id(), e),
        }
    }

    fn on_session_teardown(&mut self, _server: &Server, client: &Arc<Client>, payload: DomainPayload) {
        self.players.remove(&client.id());
        if let Ok(player) = payload.downcast::<Player>() {
            info!(
                "Saving {} after {:.1}s online",
                player.name,
                player.joined.elapsed().as_secs_f32()
            );
        }
    }
}

fn send(server: &Server, id: ClientId, protocol: Protocol, message: &Message) {
    let packet = match message.to_packet() {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Failed to encode {:?}: {}", message, e);
            return;
        }
    };
    match protocol {
        Protocol::Udp => {
            server.send_udp(id, &packet);
        }
        _ => {
            server.send_tcp(id, &packet);
        }
    }
}

//! # Hybrid TCP/UDP Server Transport
//!
//! This library is the server side of a game transport that pairs a reliable
//! TCP stream with an unreliable UDP channel for every connected client. It
//! owns connection lifecycles and framing, and it marshals everything the
//! domain needs to see onto a single simulation thread.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! - TCP accept with a bounded id pool and an approval gate
//! - A one-shot, unacknowledged UDP handshake that binds an endpoint to a
//!   client only when it comes from the client's TCP address
//! - Teardown on logout, I/O error or shutdown, run exactly once per client
//!
//! ### Framing
//! Every application packet is `[i32 length][payload]`. TCP reads are
//! reassembled by a per-connection [`shared::FrameBuffer`]; UDP datagrams lead
//! with the sender's client id and carry at most 500 payload bytes.
//!
//! ### Main-Thread Hand-off
//! Socket tasks never call into domain state. Received packets and session
//! teardown are queued as [`dispatch::MainThreadCommand`]s and executed when
//! the simulation loop calls [`dispatch::MainThread::run_pending`].
//!
//! ## Module Organization
//!
//! - `network`: the [`Server`] handle, accept and datagram loops, send API
//! - `client`: per-session state and the disconnect path
//! - `client_manager`: the locked registry and id pool
//! - `id_allocator`: first-fit id slots
//! - `tcp` / `udp`: the two per-client transports
//! - `dispatch`: the bounded producer/consumer queue to the main thread
//! - `callbacks`: the notification traits the domain implements
//! - `config` / `error`: options and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{MainThreadHandler, NoCallbacks, Protocol, Server, ServerOptions};
//! use server::client::Client;
//! use shared::Packet;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl MainThreadHandler for Echo {
//!     fn on_data_received(&mut self, server: &Server, client: &Arc<Client>, _: Protocol, packet: Packet) {
//!         server.send_tcp(client.id(), &packet);
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut server, mut main_thread) = Server::new(ServerOptions::default(), NoCallbacks)?;
//!     server.listen()?;
//!
//!     let mut echo = Echo;
//!     loop {
//!         main_thread.run_pending(&server, &mut echo);
//!         std::thread::sleep(std::time::Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod callbacks;
pub mod client;
pub mod client_manager;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id_allocator;
pub mod network;
pub mod tcp;
pub mod udp;

pub use callbacks::{MainThreadHandler, NoCallbacks, ServerCallbacks};
pub use client::{Client, DomainPayload};
pub use config::{Protocol, ServerOptions};
pub use dispatch::{MainThread, MainThreadCommand};
pub use error::{Result, ServerError};
pub use network::{DatagramOutcome, Server};

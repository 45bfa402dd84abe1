//! # Hybrid Transport Client
//!
//! The peer side of the server transport. A [`network::Connection`] opens the
//! TCP stream, learns its client id from the server's `Welcome` message and
//! then, if asked, performs the one-shot UDP handshake from the same host.
//!
//! ## Wire Format
//!
//! - TCP: a stream of `[i32 length][payload]` frames, reassembled with
//!   [`shared::FrameBuffer`]
//! - UDP to the server: `[i32 client id][i32 length][payload]`
//! - UDP from the server: `[i32 length][payload]`
//!
//! All integers are little-endian.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Connection;
//! use shared::Message;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), client::network::BoxError> {
//! let addr = "127.0.0.1:26950".parse()?;
//! let mut connection = Connection::connect(addr, Some(addr), Duration::from_secs(5)).await?;
//!
//! connection
//!     .send_message(&Message::Login { name: "bot".to_string() })
//!     .await?;
//!
//! while let Some(incoming) = connection.recv().await {
//!     println!("{:?}", incoming.message()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod network;

pub use network::{BoxError, Connection, Incoming};

//! Hand-off queue from transport threads to the single main thread.
//!
//! Transport tasks are producers; the simulation loop is the only consumer and
//! drains the queue once per tick. Nothing received off a socket reaches domain
//! code except through here.
//!
//! Received data goes through a bounded lane. Session teardown has its own
//! unbounded lane: there is at most one per session and it must never be lost.

use crate::callbacks::MainThreadHandler;
use crate::client::{Client, DomainPayload};
use crate::config::Protocol;
use crate::network::Server;
use bytes::Bytes;
use log::{debug, error, warn};
use shared::Packet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Work marshalled onto the main thread.
pub enum MainThreadCommand {
    DataReceived {
        client: Arc<Client>,
        protocol: Protocol,
        payload: Bytes,
    },
    SessionTeardown {
        client: Arc<Client>,
        payload: DomainPayload,
    },
}

impl std::fmt::Debug for MainThreadCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MainThreadCommand::DataReceived {
                client,
                protocol,
                payload,
            } => f
                .debug_struct("DataReceived")
                .field("client", &client.id())
                .field("protocol", protocol)
                .field("len", &payload.len())
                .finish(),
            MainThreadCommand::SessionTeardown { client, .. } => f
                .debug_struct("SessionTeardown")
                .field("client", &client.id())
                .finish(),
        }
    }
}

/// Creates a dispatch queue whose data lane holds `capacity` commands.
pub fn channel(capacity: usize) -> (Dispatcher, MainThread) {
    let (tx, rx) = mpsc::channel(capacity);
    let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
    (
        Dispatcher {
            tx,
            teardown: teardown_tx,
        },
        MainThread {
            rx,
            teardown: teardown_rx,
        },
    )
}

/// Producer side, cloned into every transport task.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<MainThreadCommand>,
    teardown: mpsc::UnboundedSender<MainThreadCommand>,
}

impl Dispatcher {
    /// Queues a command, waiting for room if the main thread is behind.
    pub async fn send(&self, command: MainThreadCommand) -> bool {
        if let Err(e) = self.tx.send(command).await {
            error!("Main thread queue closed, dropping {:?}", e.0);
            return false;
        }
        true
    }

    /// Queues a command from synchronous code. Drops it if the queue is full.
    pub fn try_send(&self, command: MainThreadCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!("Main thread queue full, dropping {:?}", command);
                false
            }
            Err(TrySendError::Closed(command)) => {
                error!("Main thread queue closed, dropping {:?}", command);
                false
            }
        }
    }

    /// Queues world teardown for a session. Never blocks and never drops
    /// while the main thread is alive.
    pub fn schedule_teardown(&self, client: Arc<Client>, payload: DomainPayload) -> bool {
        let command = MainThreadCommand::SessionTeardown { client, payload };
        if let Err(e) = self.teardown.send(command) {
            error!("Main thread queue closed, dropping {:?}", e.0);
            return false;
        }
        true
    }
}

/// Consumer side, owned by the simulation loop.
#[derive(Debug)]
pub struct MainThread {
    rx: mpsc::Receiver<MainThreadCommand>,
    teardown: mpsc::UnboundedReceiver<MainThreadCommand>,
}

impl MainThread {
    /// Pops one queued command without waiting. Pending data comes before
    /// pending teardown.
    pub fn try_next(&mut self) -> Option<MainThreadCommand> {
        match self.rx.try_recv() {
            Ok(command) => return Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        match self.teardown.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Runs every queued command against `handler`. Returns how many ran.
    ///
    /// Data for a client that has since disconnected is discarded, so nothing
    /// reaches the domain on behalf of a dead session.
    pub fn run_pending<H: MainThreadHandler>(&mut self, server: &Server, handler: &mut H) -> usize {
        let mut executed = 0;
        while let Some(command) = self.try_next() {
            match command {
                MainThreadCommand::DataReceived {
                    client,
                    protocol,
                    payload,
                } => {
                    if client.is_disconnected() {
                        debug!(
                            "Discarding {} bytes for disconnected client {}",
                            payload.len(),
                            client.id()
                        );
                        continue;
                    }
                    handler.on_data_received(server, &client, protocol, Packet::from_bytes(&payload));
                }
                MainThreadCommand::SessionTeardown { client, payload } => {
                    handler.on_session_teardown(server, &client, payload);
                }
            }
            executed += 1;
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::detached_client;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (dispatcher, mut main_thread) = channel(8);
        let client = detached_client(1);

        for i in 0..3u8 {
            assert!(
                dispatcher
                    .send(MainThreadCommand::DataReceived {
                        client: Arc::clone(&client),
                        protocol: Protocol::Tcp,
                        payload: Bytes::from(vec![i]),
                    })
                    .await
            );
        }

        for i in 0..3u8 {
            match main_thread.try_next() {
                Some(MainThreadCommand::DataReceived { payload, .. }) => {
                    assert_eq!(payload.as_ref(), &[i])
                }
                other => panic!("Unexpected command: {:?}", other),
            }
        }
        assert!(main_thread.try_next().is_none());
    }

    #[test]
    fn test_try_send_drops_when_full() {
        let (dispatcher, mut main_thread) = channel(1);
        let client = detached_client(1);
        let command = || MainThreadCommand::DataReceived {
            client: Arc::clone(&client),
            protocol: Protocol::Udp,
            payload: Bytes::from_static(b"x"),
        };

        assert!(dispatcher.try_send(command()));
        assert!(!dispatcher.try_send(command()));
        assert!(main_thread.try_next().is_some());
        assert!(main_thread.try_next().is_none());
    }

    #[test]
    fn test_teardown_survives_a_full_data_lane() {
        let (dispatcher, mut main_thread) = channel(1);
        let client = detached_client(1);
        assert!(dispatcher.try_send(MainThreadCommand::DataReceived {
            client: Arc::clone(&client),
            protocol: Protocol::Tcp,
            payload: Bytes::from_static(b"queued"),
        }));

        assert!(dispatcher.schedule_teardown(Arc::clone(&client), Box::new(7u32)));

        assert!(matches!(
            main_thread.try_next(),
            Some(MainThreadCommand::DataReceived { .. })
        ));
        match main_thread.try_next() {
            Some(MainThreadCommand::SessionTeardown { client: torn, payload }) => {
                assert_eq!(torn.id(), client.id());
                assert_eq!(payload.downcast_ref::<u32>(), Some(&7));
            }
            other => panic!("Unexpected command: {:?}", other),
        }
        assert!(main_thread.try_next().is_none());
    }

    #[test]
    fn test_try_send_after_consumer_dropped() {
        let (dispatcher, main_thread) = channel(4);
        drop(main_thread);
        let client = detached_client(2);
        assert!(!dispatcher.try_send(MainThreadCommand::DataReceived {
            client,
            protocol: Protocol::Tcp,
            payload: Bytes::new(),
        }));
    }
}

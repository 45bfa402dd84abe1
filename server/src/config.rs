//! Server configuration, fixed once the server is constructed.

use crate::error::{Result, ServerError};
use shared::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_TCP_PACKET_SIZE, DEFAULT_PORT};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Which transports a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn allows_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub fn allows_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }
}

impl FromStr for Protocol {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            _ => Err(ServerError::InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        };
        f.write_str(name)
    }
}

/// Listening and per-connection settings.
///
/// Timeouts are in milliseconds; zero disables the timeout.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Upper bound on concurrently live clients and on the id range.
    pub max_clients: usize,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub receive_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub protocol: Protocol,
    /// Capacity of the queue feeding the main thread.
    pub dispatch_queue_capacity: usize,
    /// Largest TCP application packet accepted before the decode buffer is discarded.
    pub max_tcp_packet_size: usize,
    /// Disconnect clients that are not authenticated within this window.
    pub authentication_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_clients: 50,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            receive_timeout_ms: 0,
            send_timeout_ms: 0,
            protocol: Protocol::Both,
            dispatch_queue_capacity: 4096,
            max_tcp_packet_size: DEFAULT_MAX_TCP_PACKET_SIZE,
            authentication_timeout: None,
        }
    }
}

impl ServerOptions {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.send_timeout_ms)
    }

    /// Rejects settings the server could not run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(ServerError::config_invalid(
                "max_clients",
                "must be at least 1",
            ));
        }
        if self.max_clients > i32::MAX as usize {
            return Err(ServerError::config_invalid(
                "max_clients",
                "client ids must fit in a positive i32",
            ));
        }
        if self.receive_buffer_size == 0 {
            return Err(ServerError::config_invalid(
                "receive_buffer_size",
                "must be positive",
            ));
        }
        if self.send_buffer_size == 0 {
            return Err(ServerError::config_invalid(
                "send_buffer_size",
                "must be positive",
            ));
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(ServerError::config_invalid(
                "dispatch_queue_capacity",
                "must be positive",
            ));
        }
        if self.max_tcp_packet_size == 0 {
            return Err(ServerError::config_invalid(
                "max_tcp_packet_size",
                "must be positive",
            ));
        }
        if self.authentication_timeout == Some(Duration::ZERO) {
            return Err(ServerError::config_invalid(
                "authentication_timeout",
                "must be positive when set",
            ));
        }
        Ok(())
    }
}

fn millis_to_timeout(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

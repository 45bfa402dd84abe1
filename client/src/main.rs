use clap::Parser;
use client::{BoxError, Connection, Incoming};
use log::{info, warn};
use shared::Message;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:26950")]
    server: SocketAddr,

    /// Name to log in with
    #[arg(short, long, default_value = "bot")]
    name: String,

    /// Number of UDP pings to send before logging out
    #[arg(short, long, default_value = "10")]
    pings: u32,

    /// Skip the UDP handshake and ping over TCP
    #[arg(long)]
    tcp_only: bool,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Headless client: log in, measure round trips, log out.
#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let udp = (!args.tcp_only).then_some(args.server);
    let mut connection = Connection::connect(args.server, udp, Duration::from_secs(5)).await?;

    connection
        .send_message(&Message::Login {
            name: args.name.clone(),
        })
        .await?;

    match connection.recv_timeout(Duration::from_secs(5)).await {
        Some(incoming) if matches!(incoming.message(), Ok(Message::LoginAccepted)) => {
            info!("Logged in as {}", args.name);
        }
        other => {
            warn!("Login not accepted: {:?}", other);
            connection.shutdown().await;
            return Ok(());
        }
    }

    for sequence in 0..args.pings {
        let ping = Message::Ping {
            sequence,
            timestamp: now_millis(),
        };
        if args.tcp_only {
            connection.send_message(&ping).await?;
        } else {
            connection.send_message_udp(&ping).await?;
        }

        match connection.recv_timeout(Duration::from_secs(1)).await {
            Some(incoming) => match incoming.message() {
                Ok(Message::Pong { sequence, timestamp }) => {
                    let transport = match incoming {
                        Incoming::Tcp(_) => "tcp",
                        Incoming::Udp(_) => "udp",
                    };
                    info!(
                        "Pong {} over {}: {}ms",
                        sequence,
                        transport,
                        now_millis().saturating_sub(timestamp)
                    );
                }
                Ok(Message::Chat { from, text }) => info!("[{}] {}", from, text),
                Ok(other) => info!("Received {:?}", other),
                Err(e) => warn!("Undecodable packet: {}", e),
            },
            None => warn!("Ping {} lost", sequence),
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    connection.send_message(&Message::Logout).await?;
    connection.shutdown().await;
    info!("Logged out");

    Ok(())
}

mod game;

use clap::Parser;
use game::{GameState, Greeter};
use log::{debug, info};
use server::{Protocol, Server, ServerOptions};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind both transports to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port shared by TCP and UDP
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Maximum concurrent clients
    #[arg(short, long, default_value = "50")]
    max_clients: usize,

    /// Transports to run: tcp, udp or both
    #[arg(long, default_value = "both")]
    protocol: String,

    /// Simulation ticks per second
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Disconnect clients that have not logged in after this many seconds (0 = never)
    #[arg(long, default_value = "10")]
    auth_timeout: u64,
}

/// Runs the transport on its own thread and the simulation on this one.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let protocol: Protocol = args.protocol.parse()?;

    let options = ServerOptions {
        bind_address: args.host,
        port: args.port,
        max_clients: args.max_clients,
        protocol,
        authentication_timeout: (args.auth_timeout > 0)
            .then(|| Duration::from_secs(args.auth_timeout)),
        ..Default::default()
    };

    let greeter = Greeter {
        motd: "Welcome to the server!".to_string(),
    };
    let (mut server, mut main_thread) = Server::new(options, greeter)?;
    server.listen()?;

    let mut game = GameState::new();
    let mut ticker = interval(Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Server started successfully");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                main_thread.run_pending(&server, &mut game);
                game.tick += 1;

                // Periodic monitoring
                if game.tick % 300 == 0 {
                    debug!(
                        "Tick {}: {} clients, {} players",
                        game.tick,
                        server.client_count(),
                        game.players.len()
                    );
                }
            }
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.stop();
    // Persist whatever the shutdown disconnects queued.
    main_thread.run_pending(&server, &mut game);

    Ok(())
}

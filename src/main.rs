use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mixshare::client::run_client;
use mixshare::config::{parse_server_list, ServerConfig};
use mixshare::server::spawn_server;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one mix server of the cluster
    Server {
        /// This server's index into the server list
        #[arg(short, long)]
        id: usize,
        /// Path to the server list file (one host:port per line)
        #[arg(short, long)]
        servers: String,
        /// Total number of clients to wait for before starting rounds
        #[arg(short, long)]
        num_clients: usize,
    },
    /// Run the demo client against a running cluster
    Client {
        /// Path to the server list file (one host:port per line)
        #[arg(short, long)]
        servers: String,
        /// Home server index for this client
        #[arg(long, default_value_t = 0)]
        home: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server {
            id,
            servers,
            num_clients,
        } => {
            let addrs = parse_server_list(&servers)?;
            let cfg = ServerConfig::new(id, addrs, num_clients);
            let server = spawn_server(cfg).await?;
            server.wait_ready().await;
            info!(id, "mix server up");
            futures::future::pending::<()>().await;
        }
        Commands::Client { servers, home } => {
            let addrs = parse_server_list(&servers)?;
            run_client(&addrs, home).await?;
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use knowledge_chat::{config::Config, run_server};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "knowledge-chat", version, about = "Conversational AI request pipeline server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API. Flags override the environment.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;

    match cli.command {
        Command::Serve { host, port, database } => {
            if let Some(host) = host {
                cfg.api_host = host;
            }
            if let Some(port) = port {
                cfg.api_port = port;
            }
            if let Some(database) = database {
                cfg.database_path = database;
            }
            run_server(cfg).await
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use lorelay::{relay, Config};

#[derive(Parser)]
#[command(name = "lorelay", version, about = "A Nostr relay over an embedded LMDB event store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration and exit
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(Command::Config) = cli.command {
        cfg.print();
        return;
    }

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = relay::run(cfg).await {
        error!(error = %e, "relay failed to start");
        std::process::exit(1);
    }
}

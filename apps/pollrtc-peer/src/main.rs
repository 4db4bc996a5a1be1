use anyhow::Result;
use clap::Parser;
use pollrtc_peer::cli::{Cli, Commands};
use pollrtc_peer::{chat, logging, rendezvous};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_config())?;

    match cli.command {
        Commands::Connect(args) => chat::run(args).await,
        Commands::Rendezvous(args) => rendezvous::bind_and_serve(args.listen).await,
    }
}

mod bencode;
mod cli;
mod client;
mod download;
mod error;
mod peer;
mod shutdown;
mod torrent;
mod tracker;

use cli::Cli;
use error::LeechError;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.run().await {
        Ok(()) => {}
        Err(LeechError::Cancelled) => {
            tracing::warn!("Interrupted, shutting down");
            std::process::exit(130);
        }
        Err(err) => {
            tracing::error!("{}", err);
            std::process::exit(1);
        }
    }
}

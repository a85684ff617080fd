use crate::client::{ClientConfig, TorrentClient};
use crate::error::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "leech")]
#[command(about = "Download a torrent from a .torrent file or magnet link", long_about = None)]
pub struct Cli {
    /// Path to a .torrent file or a file containing a magnet URI
    input: PathBuf,

    /// Directory the completed download is written to
    #[arg(short, long, default_value = "./downloads")]
    output: String,

    /// Maximum number of peers to connect to
    #[arg(long, default_value_t = 30)]
    max_peers: usize,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        let input = tokio::fs::read(&self.input).await?;

        let client = TorrentClient::new(ClientConfig {
            max_peers: self.max_peers,
        });

        // Ctrl-C flips the shutdown signal; every suspension point in the
        // run observes it within the I/O timeout
        let shutdown = client.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });

        let downloaded = client.download(&input).await?;

        let dir = Path::new(&self.output);
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&downloaded.name);
        tokio::fs::write(&path, &downloaded.data).await?;

        info!(
            "Wrote {} bytes to {}",
            downloaded.data.len(),
            path.display()
        );
        Ok(())
    }
}

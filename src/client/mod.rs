use crate::download::Scheduler;
use crate::error::{LeechError, Result};
use crate::peer::{ConnectionPool, PeerSession, SessionState};
use crate::shutdown::Shutdown;
use crate::torrent::{self, InputKind, Magnet, Metainfo};
use crate::tracker::{self, Peer, TrackerClient, TrackerRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Configuration for a download run
pub struct ClientConfig {
    /// Upper bound on simultaneous peer connections
    pub max_peers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_peers: 30 }
    }
}

/// A completed download: the payload and its suggested file name
pub struct Downloaded {
    pub name: String,
    pub data: Vec<u8>,
}

/// Orchestrates a full run: tracker announce, peer connections, the
/// magnet metadata bootstrap when needed, and the piece scheduler.
pub struct TorrentClient {
    config: ClientConfig,
    shutdown: Shutdown,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Signal handle for cooperative cancellation of this run
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Download whatever `input` describes: a torrent file or a magnet URI
    pub async fn download(&self, input: &[u8]) -> Result<Downloaded> {
        match torrent::sniff(input)? {
            InputKind::Torrent => self.download_torrent(input).await,
            InputKind::Magnet => {
                let uri = std::str::from_utf8(input)
                    .map_err(|_| LeechError::InvalidMagnet("Input is not UTF-8".to_string()))?;
                self.download_magnet(uri).await
            }
        }
    }

    async fn download_torrent(&self, data: &[u8]) -> Result<Downloaded> {
        let metainfo = Metainfo::from_torrent_bytes(data)?;

        info!("Torrent: {}", metainfo.info.name);
        info!("Total size: {} bytes", metainfo.info.total_length);
        info!("Pieces: {}", metainfo.info.num_pieces());
        info!("Info hash: {}", metainfo.info_hash_hex());

        let peer_id = tracker::generate_peer_id();
        // The listener is never accepted on, but stays bound so the port
        // we advertised remains ours for the whole run
        let (port, _listener) = tracker::reserve_port().await?;

        let request = TrackerRequest::new(
            metainfo.info_hash,
            peer_id,
            port,
            metainfo.info.total_length,
        );
        let response = TrackerClient::new()
            .announce(&metainfo.announce, &request)
            .await?;

        let sessions = self
            .connect_peers(&response.peers, metainfo.info_hash, peer_id, false)
            .await?;

        self.run_scheduler(metainfo, sessions).await
    }

    async fn download_magnet(&self, uri: &str) -> Result<Downloaded> {
        let magnet = Magnet::parse(uri)?;
        if magnet.trackers.is_empty() {
            return Err(LeechError::InvalidMagnet(
                "Magnet link carries no trackers".to_string(),
            ));
        }

        info!(
            "Magnet: {}",
            magnet.display_name.as_deref().unwrap_or("(unnamed)")
        );
        info!("Info hash: {}", hex::encode(magnet.info_hash));

        let peer_id = tracker::random_peer_id();
        let (port, _listener) = tracker::reserve_port().await?;

        // Payload size is unknown until the info dict arrives, so the
        // announce carries a placeholder `left`
        let request = TrackerRequest::for_magnet(magnet.info_hash, peer_id, port);
        let (announce, response) = TrackerClient::new()
            .announce_any(&magnet.trackers, &request)
            .await?;

        let sessions = self
            .connect_peers(&response.peers, magnet.info_hash, peer_id, true)
            .await?;

        let (raw_info, sessions) = self.fetch_info_dict(sessions, &magnet.info_hash).await?;
        let metainfo = Metainfo::from_info_bytes(announce, &raw_info)?;

        info!("Reconstituted metainfo for '{}'", metainfo.info.name);
        self.run_scheduler(metainfo, sessions).await
    }

    /// Dial every announced peer in parallel, keeping whoever completes
    /// the handshake. Individual failures are logged and dropped.
    async fn connect_peers(
        &self,
        peers: &[Peer],
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        extensions: bool,
    ) -> Result<Vec<PeerSession>> {
        info!("Attempting connection to {} peers", peers.len());

        let mut dials = JoinSet::new();
        for peer in peers.iter().take(self.config.max_peers) {
            let addr = peer.addr;
            dials.spawn(async move {
                let mut session = match PeerSession::connect(addr, info_hash, peer_id, extensions)
                    .await
                {
                    Ok(session) => session,
                    Err(err) => {
                        warn!("{}", err);
                        return None;
                    }
                };
                if let Err(err) = session.init().await {
                    warn!("Peer {} dropped during setup: {}", addr, err);
                    return None;
                }
                Some(session)
            });
        }

        let mut shutdown = self.shutdown.clone();
        let mut sessions = Vec::new();
        loop {
            tokio::select! {
                joined = dials.join_next() => match joined {
                    Some(Ok(Some(session))) => sessions.push(session),
                    Some(_) => {}
                    None => break,
                },
                _ = shutdown.wait() => return Err(LeechError::Cancelled),
            }
        }

        info!("Connected to {} of {} peers", sessions.len(), peers.len());
        if sessions.is_empty() {
            return Err(LeechError::NoLivePeers);
        }
        Ok(sessions)
    }

    /// Run the metadata exchange on every session concurrently; the first
    /// to produce a verified info dict wins and the rest are told to stop.
    /// Losing sessions come back intact and join the download pool.
    async fn fetch_info_dict(
        &self,
        sessions: Vec<PeerSession>,
        info_hash: &[u8; 20],
    ) -> Result<(Vec<u8>, Vec<PeerSession>)> {
        let race = Shutdown::new();
        let mut fetches = JoinSet::new();

        for mut session in sessions {
            let race = race.clone();
            let mut global = self.shutdown.clone();
            let hash = *info_hash;
            fetches.spawn(async move {
                tokio::select! {
                    fetched = session.fetch_metadata(&hash, race) => {
                        if let Err(err) = fetched {
                            warn!("Metadata exchange failed: {}", err);
                        }
                    }
                    _ = global.wait() => {}
                }
                session
            });
        }

        let mut raw_info = None;
        let mut survivors = Vec::new();
        while let Some(joined) = fetches.join_next().await {
            let Ok(mut session) = joined else { continue };

            if raw_info.is_none() {
                if let Some(bytes) = session.take_info_dict() {
                    raw_info = Some(bytes);
                    // Cancel the remaining exchanges; their sessions are
                    // still wanted for the download phase
                    race.trigger();
                }
            }

            if session.lifecycle() != SessionState::Dead {
                survivors.push(session);
            }
        }

        if self.shutdown.is_triggered() {
            return Err(LeechError::Cancelled);
        }

        let raw_info = raw_info.ok_or(LeechError::NoLivePeers)?;
        Ok((raw_info, survivors))
    }

    /// Hand the sessions to the scheduler and reassemble its results
    async fn run_scheduler(
        &self,
        metainfo: Metainfo,
        sessions: Vec<PeerSession>,
    ) -> Result<Downloaded> {
        if sessions.is_empty() {
            return Err(LeechError::NoLivePeers);
        }

        let pool = Arc::new(ConnectionPool::new(sessions));
        let scheduler = Scheduler::new(&metainfo.info, Arc::clone(&pool), self.shutdown.clone());
        let results = scheduler.run().await?;
        pool.shutdown().await;

        // Results arrive in completion order; reassemble by index and
        // insist on exactly one result per piece
        let mut by_index = BTreeMap::new();
        for result in results {
            if by_index.insert(result.index, result.bytes).is_some() {
                return Err(LeechError::ProtocolViolation(format!(
                    "Piece {} completed twice",
                    result.index
                )));
            }
        }
        if by_index.len() != metainfo.info.num_pieces() {
            return Err(LeechError::ProtocolViolation(format!(
                "Completed {} of {} pieces",
                by_index.len(),
                metainfo.info.num_pieces()
            )));
        }

        let mut data = Vec::with_capacity(metainfo.info.total_length as usize);
        for bytes in by_index.into_values() {
            data.extend_from_slice(&bytes);
        }

        info!(
            "Download of '{}' complete: {} bytes",
            metainfo.info.name,
            data.len()
        );

        Ok(Downloaded {
            name: metainfo.info.name,
            data,
        })
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

use super::{PieceJob, PieceResult, BLOCK_SIZE};
use crate::error::{LeechError, Result};
use crate::peer::{BlockInfo, ConnectionPool, PeerMessage, PeerSession, REQUEST_TIMEOUT};
use crate::shutdown::Shutdown;
use crate::torrent::TorrentInfo;
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Why a piece attempt came back without bytes
enum PieceFault {
    /// The peer re-choked us mid-piece; the partial data is discarded
    /// and the session stays usable
    Choked,
    /// Cancellation observed while waiting on the peer
    Cancelled,
    /// Session-fatal fault; the session must leave the pool
    Session(LeechError),
}

/// Drives piece downloads across the connection pool.
///
/// All pieces are queued in ascending index order and one worker runs per
/// live session. Workers pull jobs, pull a session, and return both: jobs
/// requeue at the tail on any recoverable failure, sessions go back to the
/// pool marked healthy or dead.
pub struct Scheduler {
    jobs: Arc<Mutex<VecDeque<PieceJob>>>,
    pool: Arc<ConnectionPool>,
    num_pieces: usize,
    shutdown: Shutdown,
}

impl Scheduler {
    pub fn new(info: &TorrentInfo, pool: Arc<ConnectionPool>, shutdown: Shutdown) -> Self {
        let mut jobs = VecDeque::with_capacity(info.num_pieces());
        for piece in info.pieces() {
            jobs.push_back(PieceJob::new(piece.index, piece.length, piece.hash));
        }

        Self {
            jobs: Arc::new(Mutex::new(jobs)),
            pool,
            num_pieces: info.num_pieces(),
            shutdown,
        }
    }

    /// Run until every piece has been fetched and verified.
    ///
    /// Results arrive in completion order, not index order; the caller
    /// reassembles by index.
    pub async fn run(&self) -> Result<Vec<PieceResult>> {
        let (results_tx, mut results_rx) = mpsc::channel(self.num_pieces.max(1));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.pool.live() {
            let jobs = Arc::clone(&self.jobs);
            let pool = Arc::clone(&self.pool);
            let results = results_tx.clone();
            let shutdown = self.shutdown.clone();
            workers.spawn(worker(worker_id, jobs, pool, results, shutdown));
        }
        drop(results_tx);

        if workers.is_empty() {
            return Err(LeechError::NoLivePeers);
        }

        let mut shutdown = self.shutdown.clone();
        let mut results = Vec::with_capacity(self.num_pieces);

        loop {
            tokio::select! {
                maybe_result = results_rx.recv() => match maybe_result {
                    Some(result) => {
                        info!(
                            "Verified piece {} ({}/{})",
                            result.index,
                            results.len() + 1,
                            self.num_pieces
                        );
                        results.push(result);
                        if results.len() == self.num_pieces {
                            return Ok(results);
                        }
                    }
                    // All workers exited before completion; surface the
                    // first failure among them
                    None => {
                        while let Some(joined) = workers.join_next().await {
                            match joined {
                                Ok(Err(err)) => return Err(err),
                                Ok(Ok(())) | Err(_) => {}
                            }
                        }
                        return Err(LeechError::NoLivePeers);
                    }
                },
                Some(joined) = workers.join_next() => {
                    if let Ok(Err(err)) = joined {
                        return Err(err);
                    }
                }
                _ = shutdown.wait() => {
                    return Err(LeechError::Cancelled);
                }
            }
        }
    }
}

/// One worker loop: take a job, take a session, download, verify, emit
async fn worker(
    worker_id: usize,
    jobs: Arc<Mutex<VecDeque<PieceJob>>>,
    pool: Arc<ConnectionPool>,
    results: mpsc::Sender<PieceResult>,
    mut shutdown: Shutdown,
) -> Result<()> {
    loop {
        let Some(mut job) = jobs.lock().await.pop_front() else {
            debug!("Worker {} found the queue empty, exiting", worker_id);
            return Ok(());
        };

        let mut session = tokio::select! {
            acquired = pool.acquire() => acquired?,
            _ = shutdown.wait() => return Err(LeechError::Cancelled),
        };

        // Rotate peers that lack this piece; a full fruitless lap through
        // the pool means nobody has it
        if !session.has_piece(job.index) {
            pool.release(session, true);
            job.skips += 1;
            if job.skips as usize >= pool.live().max(1) {
                return Err(LeechError::PieceUnavailable(job.index));
            }
            jobs.lock().await.push_back(job);
            continue;
        }
        job.skips = 0;

        match download_piece(&mut session, &job, &mut shutdown).await {
            Ok(bytes) => {
                pool.release(session, true);
                // The receiver only goes away when the run is being torn
                // down, so a failed send is not an error
                let _ = results
                    .send(PieceResult {
                        index: job.index,
                        bytes,
                    })
                    .await;
            }
            Err(PieceFault::Choked) => {
                debug!(
                    "Peer {} re-choked mid-piece, requeueing piece {}",
                    session.addr(),
                    job.index
                );
                jobs.lock().await.push_back(job);
                pool.release(session, true);
            }
            Err(PieceFault::Cancelled) => return Err(LeechError::Cancelled),
            Err(PieceFault::Session(err)) => {
                warn!(
                    "Dropping session {} after failure on piece {}: {}",
                    session.addr(),
                    job.index,
                    err
                );
                jobs.lock().await.push_back(job);
                pool.release(session, false);
            }
        }
    }
}

/// Download one piece from a session and verify its hash.
///
/// Interleaved choke/unchoke/have/bitfield messages update the session
/// while a block is outstanding; a block is accepted only when its
/// `(index, begin)` matches the request in flight.
async fn download_piece(
    session: &mut PeerSession,
    job: &PieceJob,
    shutdown: &mut Shutdown,
) -> std::result::Result<Vec<u8>, PieceFault> {
    await_unchoke(session, shutdown).await?;

    let num_blocks = job.length.div_ceil(BLOCK_SIZE);
    let mut piece = Vec::with_capacity(job.length as usize);

    for block in 0..num_blocks {
        let begin = block * BLOCK_SIZE;
        let length = BLOCK_SIZE.min(job.length - begin);

        session
            .send_message(&PeerMessage::Request {
                block: BlockInfo::new(job.index, begin, length),
            })
            .await
            .map_err(PieceFault::Session)?;

        loop {
            let message = tokio::select! {
                received = session.next_message(REQUEST_TIMEOUT) => {
                    received.map_err(PieceFault::Session)?
                }
                _ = shutdown.wait() => return Err(PieceFault::Cancelled),
            };

            match message {
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                } => {
                    if piece_index != job.index || offset != begin {
                        return Err(PieceFault::Session(LeechError::ProtocolViolation(format!(
                            "Block {}:{} arrived while {}:{} was outstanding",
                            piece_index, offset, job.index, begin
                        ))));
                    }
                    if data.len() != length as usize {
                        return Err(PieceFault::Session(LeechError::ProtocolViolation(format!(
                            "Block {}:{} came as {} bytes, requested {}",
                            piece_index,
                            offset,
                            data.len(),
                            length
                        ))));
                    }
                    piece.extend_from_slice(&data);
                    break;
                }
                PeerMessage::Choke => return Err(PieceFault::Choked),
                // Everything else already updated session state inside
                // next_message; keep waiting for our block
                _ => {}
            }
        }
    }

    let digest: [u8; 20] = Sha1::digest(&piece).into();
    if digest != job.expected_hash {
        return Err(PieceFault::Session(LeechError::PieceHashMismatch(
            job.index,
        )));
    }

    Ok(piece)
}

/// Express interest and wait for the peer to unchoke us
async fn await_unchoke(
    session: &mut PeerSession,
    shutdown: &mut Shutdown,
) -> std::result::Result<(), PieceFault> {
    if !session.flags().peer_choking {
        return Ok(());
    }

    if !session.flags().am_interested {
        session
            .send_message(&PeerMessage::Interested)
            .await
            .map_err(PieceFault::Session)?;
    }

    let deadline = Instant::now() + REQUEST_TIMEOUT;
    while session.flags().peer_choking {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PieceFault::Session(LeechError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("peer {} never unchoked us", session.addr()),
            ))));
        }

        tokio::select! {
            received = session.next_message(remaining) => {
                received.map_err(PieceFault::Session)?;
            }
            _ = shutdown.wait() => return Err(PieceFault::Cancelled),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testutil;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const PEER_ID: [u8; 20] = [0x77; 20];

    fn build_info(piece_length: u64, payload: &[u8]) -> TorrentInfo {
        let hashes = payload
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();

        TorrentInfo::new(
            "fixture".to_string(),
            piece_length,
            hashes,
            payload.len() as u64,
        )
        .unwrap()
    }

    /// A peer fixture that seeds `payload` for `info_hash`: replies to the
    /// handshake, claims every piece, unchokes on interest, and answers
    /// requests with canned piece messages until the connection closes.
    async fn spawn_seeder(
        info_hash: [u8; 20],
        payload: Vec<u8>,
        piece_length: usize,
        num_pieces: usize,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, info_hash, false).await;
            testutil::send_message(
                &mut stream,
                &PeerMessage::Bitfield {
                    bitfield: testutil::full_bitfield(num_pieces),
                },
            )
            .await;

            loop {
                let message = tokio::select! {
                    message = testutil::read_message(&mut stream) => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = tokio::time::sleep(std::time::Duration::from_secs(20)) => break,
                };

                match message {
                    PeerMessage::Interested => {
                        testutil::send_message(&mut stream, &PeerMessage::Unchoke).await;
                    }
                    PeerMessage::Request { block } => {
                        let begin =
                            block.piece_index as usize * piece_length + block.offset as usize;
                        let end = begin + block.length as usize;
                        testutil::send_message(
                            &mut stream,
                            &PeerMessage::Piece {
                                piece_index: block.piece_index,
                                offset: block.offset,
                                data: payload[begin..end].to_vec(),
                            },
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_three_seeders_complete_five_pieces() {
        // 5 pieces of 32 KiB (two blocks each), last piece a short 100 bytes
        let piece_length = 2 * BLOCK_SIZE as usize;
        let payload: Vec<u8> = (0..piece_length * 4 + 100)
            .map(|i| (i % 241) as u8)
            .collect();
        let info = build_info(piece_length as u64, &payload);
        assert_eq!(info.num_pieces(), 5);

        let info_hash = [0xCD; 20];
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let addr = spawn_seeder(info_hash, payload.clone(), piece_length, 5).await;
            let mut session = PeerSession::connect(addr, info_hash, PEER_ID, false)
                .await
                .unwrap();
            session.init().await.unwrap();
            sessions.push(session);
        }

        let pool = Arc::new(ConnectionPool::new(sessions));
        let scheduler = Scheduler::new(&info, Arc::clone(&pool), Shutdown::new());
        let mut results = scheduler.run().await.unwrap();

        // Exactly one verified result per index, bytes matching the payload
        assert_eq!(results.len(), 5);
        results.sort_by_key(|result| result.index);
        for (index, result) in results.iter().enumerate() {
            assert_eq!(result.index as usize, index);
            let begin = index * piece_length;
            let end = (begin + piece_length).min(payload.len());
            assert_eq!(result.bytes, &payload[begin..end]);
        }
        assert_eq!(results[4].bytes.len(), 100);
    }

    #[tokio::test]
    async fn test_missing_piece_fails_as_unavailable() {
        let piece_length = BLOCK_SIZE as usize;
        let info_hash = [0xEE; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // This peer only claims piece 0 and never serves anything
        tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, info_hash, false).await;
            testutil::send_message(
                &mut stream,
                &PeerMessage::Bitfield {
                    bitfield: vec![0b1000_0000],
                },
            )
            .await;
            tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        });

        let mut session = PeerSession::connect(addr, info_hash, PEER_ID, false)
            .await
            .unwrap();
        session.init().await.unwrap();

        // Only queue the piece the peer does not have
        let pool = Arc::new(ConnectionPool::new(vec![session]));
        let scheduler = Scheduler {
            jobs: Arc::new(Mutex::new(VecDeque::from([PieceJob::new(
                1,
                piece_length as u32,
                [0u8; 20],
            )]))),
            pool,
            num_pieces: 1,
            shutdown: Shutdown::new(),
        };

        assert!(matches!(
            scheduler.run().await,
            Err(LeechError::PieceUnavailable(1))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_run() {
        let piece_length = BLOCK_SIZE as usize;
        let payload: Vec<u8> = vec![0x66; piece_length];
        let info = build_info(piece_length as u64, &payload);

        let info_hash = [0xAB; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Claims the piece but never unchokes, so the run only ends by
        // cancellation
        tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, info_hash, false).await;
            testutil::send_message(
                &mut stream,
                &PeerMessage::Bitfield {
                    bitfield: vec![0b1000_0000],
                },
            )
            .await;
            tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        });

        let mut session = PeerSession::connect(addr, info_hash, PEER_ID, false)
            .await
            .unwrap();
        session.init().await.unwrap();

        let shutdown = Shutdown::new();
        let pool = Arc::new(ConnectionPool::new(vec![session]));
        let scheduler = Scheduler::new(&info, pool, shutdown.clone());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.trigger();
        });

        assert!(matches!(
            scheduler.run().await,
            Err(LeechError::Cancelled)
        ));
    }
}

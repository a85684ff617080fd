use super::PeerSession;
use crate::error::{LeechError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// The set of live peer sessions, handed out one at a time.
///
/// A session acquired from the pool is exclusively owned until released,
/// which is what lets sessions carry unsynchronized mutable state. Dead
/// sessions leave the pool for good; once the last one dies, blocked and
/// future acquires fail with `NoLivePeers`.
pub struct ConnectionPool {
    slots: Mutex<mpsc::Receiver<PeerSession>>,
    returns: StdMutex<Option<mpsc::Sender<PeerSession>>>,
    live: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(sessions: Vec<PeerSession>) -> Self {
        let live = sessions.len();
        let (tx, rx) = mpsc::channel(live.max(1));
        for session in sessions {
            tx.try_send(session)
                .unwrap_or_else(|_| unreachable!("pool channel sized to session count"));
        }

        Self {
            slots: Mutex::new(rx),
            returns: StdMutex::new((live > 0).then_some(tx)),
            live: AtomicUsize::new(live),
        }
    }

    /// Sessions still alive, pooled or currently held
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Borrow a session exclusively, blocking until one is free
    pub async fn acquire(&self) -> Result<PeerSession> {
        let mut slots = self.slots.lock().await;
        slots.recv().await.ok_or(LeechError::NoLivePeers)
    }

    /// Return a session to the pool, or drop it as dead
    pub fn release(&self, session: PeerSession, healthy: bool) {
        if healthy {
            let returns = self.returns.lock().unwrap();
            if let Some(tx) = returns.as_ref() {
                let _ = tx.try_send(session);
            }
        } else {
            debug!("Dropping dead session {}", session.addr());
            drop(session);
            if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
                // Last session gone: close the channel so blocked
                // acquires observe NoLivePeers instead of waiting forever
                self.returns.lock().unwrap().take();
            }
        }
    }

    /// Close every pooled session in an orderly way
    pub async fn shutdown(&self) {
        self.returns.lock().unwrap().take();

        let mut slots = self.slots.lock().await;
        while let Some(mut session) = slots.recv().await {
            session.close().await;
        }
        self.live.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use std::time::Duration;

    const INFO_HASH: [u8; 20] = [0x33; 20];

    async fn test_session() -> (PeerSession, tokio::net::TcpStream) {
        let (addr, listener) = testutil::listen().await;
        let server =
            tokio::spawn(
                async move { testutil::accept_and_handshake(&listener, INFO_HASH, false).await },
            );
        let session = PeerSession::connect(addr, INFO_HASH, [0x44; 20], false)
            .await
            .unwrap();
        (session, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let (first, _stream_a) = test_session().await;
        let (second, _stream_b) = test_session().await;
        let pool = ConnectionPool::new(vec![first, second]);
        assert_eq!(pool.live(), 2);

        let held_a = pool.acquire().await.unwrap();
        let _held_b = pool.acquire().await.unwrap();

        // Both sessions are out; a third acquire must block
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        pool.release(held_a, true);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .expect("released session becomes acquirable");
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_drained_pool_reports_no_live_peers() {
        let (first, _stream_a) = test_session().await;
        let (second, _stream_b) = test_session().await;
        let pool = ConnectionPool::new(vec![first, second]);

        let held_a = pool.acquire().await.unwrap();
        let held_b = pool.acquire().await.unwrap();
        pool.release(held_a, false);
        assert_eq!(pool.live(), 1);
        pool.release(held_b, false);
        assert_eq!(pool.live(), 0);

        assert!(matches!(
            pool.acquire().await,
            Err(LeechError::NoLivePeers)
        ));
    }

    #[tokio::test]
    async fn test_empty_pool_reports_no_live_peers() {
        let pool = ConnectionPool::new(Vec::new());
        assert!(matches!(
            pool.acquire().await,
            Err(LeechError::NoLivePeers)
        ));
    }
}

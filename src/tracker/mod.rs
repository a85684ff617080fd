mod client;
mod peer;
mod request;
mod response;

pub use client::TrackerClient;
pub use peer::Peer;
pub use request::{TrackerRequest, UNKNOWN_LEFT};
pub use response::TrackerResponse;

use crate::error::{LeechError, Result};
use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

/// Port range conventionally reserved for BitTorrent clients
const FIRST_PORT: u16 = 6881;
const LAST_PORT: u16 = 6889;

/// Generate a peer ID in the Azureus convention: -RS0001-<12 random chars>
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-RS0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }

    peer_id
}

/// Generate a fully random 20-byte peer ID
pub fn random_peer_id() -> [u8; 20] {
    rand::thread_rng().gen()
}

/// Reserve the first free port in [6881, 6889], holding the listener open.
///
/// The announce advertises this port. Nothing accepts on it, but keeping
/// the listener bound for the duration of the run stops another process
/// from advertising the same port out from under us.
pub async fn reserve_port() -> Result<(u16, TcpListener)> {
    for port in FIRST_PORT..=LAST_PORT {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                debug!("Reserved port {}", port);
                return Ok((port, listener));
            }
            Err(_) => continue,
        }
    }

    Err(LeechError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port in {}-{}", FIRST_PORT, LAST_PORT),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert_eq!(&peer_id[0..8], b"-RS0001-");
    }

    #[test]
    fn test_random_peer_ids_differ() {
        assert_ne!(random_peer_id(), random_peer_id());
    }

    #[tokio::test]
    async fn test_reserve_port_within_range() {
        let (port, _listener) = reserve_port().await.unwrap();
        assert!((FIRST_PORT..=LAST_PORT).contains(&port));

        // A second reservation must pick a different port while the
        // first listener is still held
        let (second, _second_listener) = reserve_port().await.unwrap();
        assert_ne!(port, second);
    }
}

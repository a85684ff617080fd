mod connection;
mod extension;
mod message;
mod metadata;
mod pool;
mod protocol;

pub use connection::{PeerSession, REQUEST_TIMEOUT};
pub use message::{BlockInfo, PeerMessage};
pub use pool::ConnectionPool;
pub use protocol::Handshake;

/// Choke and interest flags for one connection.
///
/// Defaults follow the wire protocol: both sides start choked and
/// uninterested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Top-level lifecycle of a peer session.
///
/// `Dialing` and `Handshaking` are passed through inside
/// [`PeerSession::connect`]; a constructed session starts at `Idle` and
/// moves to `Running` on its first message exchange. `Dead` and `Closed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    Idle,
    Running,
    Dead,
    Closed,
}

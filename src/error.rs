use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeechError {
    #[error("Malformed bencode: {0}")]
    MalformedBencode(String),

    #[error("Invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("Invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("Tracker unreachable: {0}")]
    TrackerUnreachable(String),

    #[error("Tracker rejected announce: {0}")]
    TrackerRejected(String),

    #[error("Tracker returned no peers")]
    NoPeers,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame of {0} bytes exceeds the frame size ceiling")]
    OversizedFrame(usize),

    #[error("Piece {0} failed hash verification")]
    PieceHashMismatch(u32),

    #[error("No connected peer has piece {0}")]
    PieceUnavailable(u32),

    #[error("No live peers remain")]
    NoLivePeers,

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, LeechError>;

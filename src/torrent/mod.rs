mod magnet;
mod metainfo;

pub use magnet::Magnet;
pub use metainfo::{Metainfo, Piece, TorrentInfo};

use crate::error::{LeechError, Result};

/// What the single input file turned out to contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// A bencoded .torrent document
    Torrent,
    /// A magnet URI
    Magnet,
}

/// Sniff the input bytes: a bencoded dictionary is a torrent file, a
/// `magnet:?` prefix is a magnet URI.
pub fn sniff(data: &[u8]) -> Result<InputKind> {
    if data.starts_with(b"magnet:?") {
        return Ok(InputKind::Magnet);
    }
    if data.first() == Some(&b'd') && crate::bencode::decode(data).is_ok() {
        return Ok(InputKind::Torrent);
    }
    Err(LeechError::InvalidMetainfo(
        "Input is neither a torrent file nor a magnet URI".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_magnet() {
        let input = b"magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        assert_eq!(sniff(input).unwrap(), InputKind::Magnet);
    }

    #[test]
    fn test_sniff_torrent() {
        assert_eq!(sniff(b"d1:ai1ee").unwrap(), InputKind::Torrent);
    }

    #[test]
    fn test_sniff_garbage() {
        assert!(sniff(b"definitely not bencode").is_err());
        assert!(sniff(b"").is_err());
    }
}

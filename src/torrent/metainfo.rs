use crate::bencode::{decode, value_span, BencodeValue};
use crate::error::{LeechError, Result};
use sha1::{Digest, Sha1};

/// Descriptor of one piece: its index, its exact length (the last piece
/// carries the remainder), and the SHA1 it must hash to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}

/// Contents of the `info` dictionary, reduced to what a leecher needs.
///
/// Multi-file torrents are represented only as the sum of their file
/// lengths; the payload is treated as one contiguous byte range. Piece
/// hashes are not exposed on their own, only as [`Piece`] descriptors
/// that pair each hash with its index and length.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Suggested name for the downloaded file
    pub name: String,
    /// Number of bytes in each piece but the last
    pub piece_length: u64,
    /// Total length of the payload
    pub total_length: u64,
    hashes: Vec<[u8; 20]>,
}

impl TorrentInfo {
    /// Build a `TorrentInfo`, enforcing that the hash count matches
    /// `ceil(total_length / piece_length)`.
    pub fn new(
        name: String,
        piece_length: u64,
        hashes: Vec<[u8; 20]>,
        total_length: u64,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(LeechError::InvalidMetainfo(
                "Piece length must be positive".to_string(),
            ));
        }

        let expected = total_length.div_ceil(piece_length);
        if expected != hashes.len() as u64 {
            return Err(LeechError::InvalidMetainfo(format!(
                "{} bytes in pieces of {} require {} hashes, found {}",
                total_length,
                piece_length,
                expected,
                hashes.len()
            )));
        }

        Ok(Self {
            name,
            piece_length,
            total_length,
            hashes,
        })
    }

    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| LeechError::InvalidMetainfo("Info must be a dict".to_string()))?;

        let name = dict
            .get(b"name".as_ref())
            .and_then(|v| v.as_str())
            .ok_or_else(|| LeechError::InvalidMetainfo("Missing 'name' field".to_string()))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_ref())
            .and_then(|v| v.as_integer())
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                LeechError::InvalidMetainfo("Missing 'piece length' field".to_string())
            })? as u64;

        // The 'pieces' value is the concatenation of 20-byte SHA1 digests
        let pieces_bytes = dict
            .get(b"pieces".as_ref())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| LeechError::InvalidMetainfo("Missing 'pieces' field".to_string()))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(LeechError::InvalidMetainfo(
                "'pieces' length must be a multiple of 20".to_string(),
            ));
        }
        let hashes = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // Single-file mode carries 'length'; multi-file mode carries 'files',
        // which collapses to the sum of the file lengths
        let total_length = if let Some(length) = dict.get(b"length".as_ref()) {
            length
                .as_integer()
                .filter(|len| *len >= 0)
                .ok_or_else(|| LeechError::InvalidMetainfo("Invalid 'length' field".to_string()))?
                as u64
        } else if let Some(files) = dict.get(b"files".as_ref()) {
            let files_list = files
                .as_list()
                .ok_or_else(|| LeechError::InvalidMetainfo("Invalid 'files' field".to_string()))?;

            let mut total = 0u64;
            for file in files_list {
                let length = file
                    .as_dict()
                    .and_then(|d| d.get(b"length".as_ref()))
                    .and_then(|v| v.as_integer())
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| {
                        LeechError::InvalidMetainfo("Missing file 'length'".to_string())
                    })? as u64;
                total += length;
            }
            total
        } else {
            return Err(LeechError::InvalidMetainfo(
                "Missing 'length' or 'files' field".to_string(),
            ));
        };

        Self::new(name, piece_length, hashes, total_length)
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// Piece descriptors in ascending index order
    pub fn pieces(&self) -> impl Iterator<Item = Piece> + '_ {
        self.hashes.iter().enumerate().map(move |(index, hash)| Piece {
            index: index as u32,
            length: self.piece_size(index) as u32,
            hash: *hash,
        })
    }

    /// Length of the piece at `index`; only the last piece may be shorter
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.hashes.len() {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        } else {
            self.piece_length
        }
    }
}

/// Top-level metainfo from a .torrent file, or reconstituted from a
/// magnet link once the info dictionary has been fetched from a peer.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// URL of the tracker
    pub announce: String,
    /// Information about the torrent contents
    pub info: TorrentInfo,
    /// SHA1 hash of the bencoded info dictionary, as it appeared in
    /// the source bytes
    pub info_hash: [u8; 20],
}

impl Metainfo {
    /// Parse a complete .torrent document.
    ///
    /// The info hash is computed over the raw byte span of the `info` value
    /// in `data`, not over a re-encoding, so non-canonical input hashes to
    /// whatever the rest of the swarm computed for it.
    pub fn from_torrent_bytes(data: &[u8]) -> Result<Self> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| LeechError::InvalidMetainfo("Torrent must be a dict".to_string()))?;

        let announce = dict
            .get(b"announce".as_ref())
            .and_then(|v| v.as_str())
            .ok_or_else(|| LeechError::InvalidMetainfo("Missing 'announce' field".to_string()))?
            .to_string();

        let info_value = dict
            .get(b"info".as_ref())
            .ok_or_else(|| LeechError::InvalidMetainfo("Missing 'info' field".to_string()))?;
        let info = TorrentInfo::from_bencode(info_value)?;

        let span = value_span(data, b"info")?;
        let info_hash = sha1_digest(&data[span]);

        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    /// Build a synthetic metainfo from a raw info dictionary obtained over
    /// the metadata extension, paired with the tracker that supplied peers.
    pub fn from_info_bytes(announce: String, raw_info: &[u8]) -> Result<Self> {
        let value = decode(raw_info)?;
        let info = TorrentInfo::from_bencode(&value)?;
        let info_hash = sha1_digest(raw_info);

        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    /// Info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

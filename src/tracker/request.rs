/// Placeholder `left` value announced on the magnet path, where the total
/// length is unknown until the info dictionary has been fetched from a
/// peer. Trackers tolerate an inaccurate value here; it only skews their
/// completion statistics.
pub const UNKNOWN_LEFT: u64 = 999;

/// Parameters for a tracker announce
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    /// SHA1 hash of the info dictionary
    pub info_hash: [u8; 20],
    /// Our peer ID for this session
    pub peer_id: [u8; 20],
    /// Port this peer has reserved
    pub port: u16,
    /// Total amount uploaded
    pub uploaded: u64,
    /// Total amount downloaded
    pub downloaded: u64,
    /// Number of bytes left to download
    pub left: u64,
}

impl TrackerRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
        }
    }

    /// Announce for a magnet download, before the payload size is known
    pub fn for_magnet(info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> Self {
        Self::new(info_hash, peer_id, port, UNKNOWN_LEFT)
    }

    /// Build the query string for the announce GET.
    ///
    /// The raw 20-byte hash and peer ID are percent-encoded here exactly
    /// once; handing them to a URL builder as strings would encode the
    /// percent signs a second time.
    pub fn to_query_string(&self) -> String {
        format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash),
            percent_encode(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        )
    }
}

/// Percent-encode raw bytes for a query value
fn percent_encode(bytes: &[u8; 20]) -> String {
    bytes.iter().map(|b| format!("%{:02x}", b)).collect()
}

use crate::error::{LeechError, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Byte index within the reserved field carrying the extension protocol bit
const EXTENSION_BYTE: usize = 5;
/// Bit 20 counted from the most significant bit of the reserved field
const EXTENSION_BIT: u8 = 0x10;

/// The 68-byte handshake opening every peer connection
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], extensions: bool) -> Self {
        let mut reserved = [0u8; 8];
        if extensions {
            reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        }

        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender advertised the extension protocol (BEP-10)
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize to the 68-byte wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(68);

        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 68 {
            return Err(LeechError::HandshakeFailed(
                "Handshake too short".to_string(),
            ));
        }

        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(LeechError::HandshakeFailed(
                "Invalid protocol string length".to_string(),
            ));
        }

        if &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(LeechError::HandshakeFailed(
                "Invalid protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

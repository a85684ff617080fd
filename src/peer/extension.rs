use crate::bencode::{decode, encode, BencodeValue};
use crate::error::{LeechError, Result};
use std::collections::BTreeMap;

/// Sub-id of the extension handshake itself (BEP-10)
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Extension name for metadata exchange (BEP-9)
pub const UT_METADATA: &str = "ut_metadata";

/// The message id we assign to ut_metadata in our own handshake. Peers
/// address their metadata messages to us with this id.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// The bencoded dictionary carried by an extension handshake.
///
/// The `m` sub-dictionary maps extension names to the message ids the
/// sender has chosen for them; `metadata_size` announces the length of
/// the info dictionary and matters on the magnet path.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<u64>,
}

impl ExtensionHandshake {
    /// The handshake we send: just ut_metadata under our local id
    pub fn ours() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        Self {
            extensions,
            metadata_size: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(name.as_bytes().to_vec(), BencodeValue::Integer(*id as i64));
        }

        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(
                b"metadata_size".to_vec(),
                BencodeValue::Integer(size as i64),
            );
        }

        encode(&BencodeValue::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = decode(payload)?;
        let dict = value.as_dict().ok_or_else(|| {
            LeechError::ProtocolViolation("Extension handshake must be a dict".to_string())
        })?;

        let mut handshake = Self::default();

        if let Some(m) = dict.get(b"m".as_ref()).and_then(|v| v.as_dict()) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    // Id 0 means the sender disabled the extension
                    if (1..=255).contains(&id) {
                        handshake.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        handshake.metadata_size = dict
            .get(b"metadata_size".as_ref())
            .and_then(|v| v.as_integer())
            .filter(|size| *size > 0)
            .map(|size| size as u64);

        Ok(handshake)
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}

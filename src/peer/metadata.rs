use crate::bencode::{decode_prefix, encode, BencodeValue};
use crate::error::{LeechError, Result};
use std::collections::BTreeMap;

/// Metadata is transferred in 16 KiB pieces (BEP-9)
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// BEP-9 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    fn from_integer(value: i64) -> Option<Self> {
        match value {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: a bencoded header, followed by raw piece bytes
/// for `Data` messages.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    /// Total metadata size; only present in data messages
    pub total_size: Option<u64>,
    /// The raw piece bytes; only present in data messages
    pub data: Option<Vec<u8>>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"msg_type".to_vec(),
            BencodeValue::Integer(self.msg_type as i64),
        );
        dict.insert(b"piece".to_vec(), BencodeValue::Integer(self.piece as i64));
        if let Some(total_size) = self.total_size {
            dict.insert(
                b"total_size".to_vec(),
                BencodeValue::Integer(total_size as i64),
            );
        }

        let mut encoded = encode(&BencodeValue::Dict(dict));
        if let Some(ref data) = self.data {
            encoded.extend_from_slice(data);
        }
        encoded
    }

    /// Decode the bencoded header; for data messages the raw bytes follow it
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (value, consumed) = decode_prefix(payload)?;
        let dict = value.as_dict().ok_or_else(|| {
            LeechError::ProtocolViolation("Metadata message must be a dict".to_string())
        })?;

        let msg_type = dict
            .get(b"msg_type".as_ref())
            .and_then(|v| v.as_integer())
            .and_then(MetadataMessageType::from_integer)
            .ok_or_else(|| {
                LeechError::ProtocolViolation("Missing or invalid msg_type".to_string())
            })?;

        let piece = dict
            .get(b"piece".as_ref())
            .and_then(|v| v.as_integer())
            .filter(|p| *p >= 0)
            .ok_or_else(|| LeechError::ProtocolViolation("Missing piece index".to_string()))?
            as u32;

        let total_size = dict
            .get(b"total_size".as_ref())
            .and_then(|v| v.as_integer())
            .filter(|size| *size >= 0)
            .map(|size| size as u64);

        let data = if msg_type == MetadataMessageType::Data && consumed < payload.len() {
            Some(payload[consumed..].to_vec())
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Number of 16 KiB pieces covering `metadata_size` bytes
pub fn metadata_piece_count(metadata_size: u64) -> u32 {
    metadata_size.div_ceil(METADATA_PIECE_SIZE as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_form() {
        // The exact form peers expect for a piece request
        assert_eq!(
            MetadataMessage::request(0).encode(),
            b"d8:msg_typei0e5:piecei0ee"
        );
        assert_eq!(
            MetadataMessage::request(3).encode(),
            b"d8:msg_typei0e5:piecei3ee"
        );
    }

    #[test]
    fn test_decode_data_with_trailing_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei2e10:total_sizei50000ee".to_vec();
        payload.extend_from_slice(&[0xAA; 100]);

        let message = MetadataMessage::decode(&payload).unwrap();
        assert_eq!(message.msg_type, MetadataMessageType::Data);
        assert_eq!(message.piece, 2);
        assert_eq!(message.total_size, Some(50000));
        assert_eq!(message.data.as_deref(), Some(&[0xAA; 100][..]));
    }

    #[test]
    fn test_decode_reject() {
        let message = MetadataMessage::decode(b"d8:msg_typei2e5:piecei7ee").unwrap();
        assert_eq!(message.msg_type, MetadataMessageType::Reject);
        assert_eq!(message.piece, 7);
        assert!(message.data.is_none());
    }

    #[test]
    fn test_metadata_piece_count() {
        assert_eq!(metadata_piece_count(1), 1);
        assert_eq!(metadata_piece_count(16384), 1);
        assert_eq!(metadata_piece_count(16385), 2);
        assert_eq!(metadata_piece_count(50000), 4);
    }
}

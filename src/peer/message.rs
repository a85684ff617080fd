use crate::error::{LeechError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Hard ceiling on a single frame. The largest legitimate frame is a
/// `piece` carrying one 16 KiB block; anything approaching this limit is
/// a hostile or broken peer.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// A block within a piece, addressed as (piece, begin, length)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Peer announces possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces, MSB-first
    Bitfield { bitfield: Vec<u8> },
    /// Request a block
    Request { block: BlockInfo },
    /// Deliver a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    /// Cancel a block request
    Cancel { block: BlockInfo },
    /// Extension protocol message (BEP-10): sub-id plus opaque payload
    Extended { ext_id: u8, payload: Vec<u8> },
    /// Unrecognized message id; logged and skipped by the receiver
    Unknown { id: u8 },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const EXTENDED: u8 = 20;

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                buf.put_u32(13); // length = 1 + 4 + 4 + 4
                buf.put_u8(Self::REQUEST);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32((9 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::CANCEL);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::Extended { ext_id, payload } => {
                buf.put_u32((2 + payload.len()) as u32);
                buf.put_u8(Self::EXTENDED);
                buf.put_u8(*ext_id);
                buf.put_slice(payload);
            }
            PeerMessage::Unknown { .. } => {
                unreachable!("unknown messages are never sent");
            }
        }

        buf.to_vec()
    }

    /// Deserialize a framed message (length prefix included)
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(LeechError::ProtocolViolation(
                "Message too short".to_string(),
            ));
        }

        let length = data.get_u32() as usize;

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() < length {
            return Err(LeechError::ProtocolViolation(
                "Incomplete message".to_string(),
            ));
        }

        let message_id = data.get_u8();

        match message_id {
            Self::CHOKE => Ok(PeerMessage::Choke),
            Self::UNCHOKE => Ok(PeerMessage::Unchoke),
            Self::INTERESTED => Ok(PeerMessage::Interested),
            Self::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            Self::HAVE => {
                if data.len() < 4 {
                    return Err(LeechError::ProtocolViolation(
                        "Invalid Have message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                Ok(PeerMessage::Have { piece_index })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield {
                bitfield: data.to_vec(),
            }),
            Self::REQUEST => {
                if data.len() < 12 {
                    return Err(LeechError::ProtocolViolation(
                        "Invalid Request message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                let length = data.get_u32();
                Ok(PeerMessage::Request {
                    block: BlockInfo::new(piece_index, offset, length),
                })
            }
            Self::PIECE => {
                if data.len() < 8 {
                    return Err(LeechError::ProtocolViolation(
                        "Invalid Piece message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: data.to_vec(),
                })
            }
            Self::CANCEL => {
                if data.len() < 12 {
                    return Err(LeechError::ProtocolViolation(
                        "Invalid Cancel message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                let length = data.get_u32();
                Ok(PeerMessage::Cancel {
                    block: BlockInfo::new(piece_index, offset, length),
                })
            }
            Self::EXTENDED => {
                if data.is_empty() {
                    return Err(LeechError::ProtocolViolation(
                        "Extended message without sub-id".to_string(),
                    ));
                }
                let ext_id = data.get_u8();
                Ok(PeerMessage::Extended {
                    ext_id,
                    payload: data.to_vec(),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }
}

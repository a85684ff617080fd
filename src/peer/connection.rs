use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, UT_METADATA};
use super::message::MAX_FRAME_SIZE;
use super::metadata::{metadata_piece_count, MetadataMessage, MetadataMessageType};
use super::{Handshake, PeerFlags, PeerMessage, SessionState};
use crate::error::{LeechError, Result};
use crate::shutdown::Shutdown;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Time allowed for dialing plus both handshake directions
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for one request/response exchange on an established session
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound peer connection and its wire-protocol state.
///
/// A session is exclusively owned by whoever drives it; the connection
/// pool enforces single ownership, so none of this state needs locking.
pub struct PeerSession {
    addr: SocketAddr,
    stream: TcpStream,
    lifecycle: SessionState,
    flags: PeerFlags,
    /// Pieces the peer claims to have, MSB-first
    bitfield: Vec<u8>,
    /// Both sides advertised the extension protocol bit
    extensions: bool,
    /// Extension name to the peer's message id, from its extended handshake
    ext_msg_ids: BTreeMap<String, u8>,
    metadata_size: Option<u64>,
    /// Raw bencoded info dictionary, populated by the metadata exchange
    info_dict: Option<Vec<u8>>,
}

impl PeerSession {
    /// Dial a peer and exchange handshakes.
    ///
    /// The whole exchange shares one timeout. A peer answering with the
    /// wrong protocol string or a different info hash is rejected.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        extensions: bool,
    ) -> Result<Self> {
        // Dial and handshake share one deadline
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        let mut lifecycle = SessionState::Dialing;
        debug!("Peer {} entering {:?}", addr, lifecycle);

        let mut stream = timeout(
            deadline.saturating_duration_since(Instant::now()),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| LeechError::HandshakeFailed(format!("{}: connect timed out", addr)))?
        .map_err(|e| LeechError::HandshakeFailed(format!("{}: {}", addr, e)))?;

        lifecycle = SessionState::Handshaking;
        debug!("Peer {} entering {:?}", addr, lifecycle);

        let exchange = async {
            let ours = Handshake::new(info_hash, our_peer_id, extensions);
            stream.write_all(&ours.to_bytes()).await?;

            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        let buf = timeout(deadline.saturating_duration_since(Instant::now()), exchange)
            .await
            .map_err(|_| LeechError::HandshakeFailed(format!("{}: handshake timed out", addr)))?
            .map_err(|e| LeechError::HandshakeFailed(format!("{}: {}", addr, e)))?;
        let theirs = Handshake::from_bytes(&buf)?;

        if theirs.info_hash != info_hash {
            return Err(LeechError::HandshakeFailed(format!(
                "{}: info hash mismatch",
                addr
            )));
        }

        info!(
            "Connected to peer {} ({})",
            addr,
            String::from_utf8_lossy(&theirs.peer_id)
        );
        lifecycle = SessionState::Idle;

        Ok(Self {
            addr,
            stream,
            lifecycle,
            flags: PeerFlags::default(),
            bitfield: Vec::new(),
            extensions: extensions && theirs.supports_extensions(),
            ext_msg_ids: BTreeMap::new(),
            metadata_size: None,
            info_dict: None,
        })
    }

    /// Finish session setup: take the peer's opening bitfield and, when
    /// both sides carry the extension bit, run the extended handshake.
    ///
    /// Our extended handshake goes out first; peers send theirs unprompted
    /// right after the base handshake, in either order relative to their
    /// bitfield.
    pub async fn init(&mut self) -> Result<()> {
        if self.extensions {
            self.send_message(&PeerMessage::Extended {
                ext_id: EXTENSION_HANDSHAKE_ID,
                payload: ExtensionHandshake::ours().encode(),
            })
            .await?;
        }

        let first = self.next_message(HANDSHAKE_TIMEOUT).await?;
        self.lifecycle = SessionState::Running;

        if !matches!(first, PeerMessage::Bitfield { .. }) {
            // A bitfield must come first if it comes at all; haves may
            // still fill the set in later
            debug!("Peer {} opened with {} instead of a bitfield", self.addr, label(&first));
        }

        if self.extensions {
            let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
            while self.ext_msg_ids.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.lifecycle = SessionState::Dead;
                    return Err(LeechError::HandshakeFailed(format!(
                        "{}: no extended handshake",
                        self.addr
                    )));
                }
                self.next_message(remaining).await?;
            }
        }

        Ok(())
    }

    /// Send a message, tracking the flags our own messages change
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<()> {
        let bytes = message.to_bytes();
        if let Err(err) = self.stream.write_all(&bytes).await {
            self.lifecycle = SessionState::Dead;
            return Err(err.into());
        }

        match message {
            PeerMessage::Choke => self.flags.am_choking = true,
            PeerMessage::Unchoke => self.flags.am_choking = false,
            PeerMessage::Interested => self.flags.am_interested = true,
            PeerMessage::NotInterested => self.flags.am_interested = false,
            _ => {}
        }

        debug!("Sent {} to {}", label(message), self.addr);
        Ok(())
    }

    /// Read the next frame, folding any state it carries into the session.
    ///
    /// Fails the session on timeout, transport error, or a frame above the
    /// size ceiling.
    pub async fn next_message(&mut self, wait: Duration) -> Result<PeerMessage> {
        let result = match timeout(wait, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(LeechError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("peer {} read timed out", self.addr),
            ))),
        };

        match result {
            Ok(message) => {
                self.handle_message(&message)?;
                debug!("Received {} from {}", label(&message), self.addr);
                Ok(message)
            }
            Err(err) => {
                self.lifecycle = SessionState::Dead;
                Err(err)
            }
        }
    }

    async fn read_frame(&mut self) -> Result<PeerMessage> {
        let mut length_buf = [0u8; 4];
        self.stream.read_exact(&mut length_buf).await?;

        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(LeechError::OversizedFrame(length));
        }

        let mut frame = vec![0u8; 4 + length];
        frame[..4].copy_from_slice(&length_buf);
        self.stream.read_exact(&mut frame[4..]).await?;

        PeerMessage::from_bytes(&frame)
    }

    /// Fold a received message into session state
    fn handle_message(&mut self, message: &PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Choke => self.flags.peer_choking = true,
            PeerMessage::Unchoke => self.flags.peer_choking = false,
            PeerMessage::Interested => self.flags.peer_interested = true,
            PeerMessage::NotInterested => self.flags.peer_interested = false,
            PeerMessage::Bitfield { bitfield } => self.bitfield = bitfield.clone(),
            PeerMessage::Have { piece_index } => self.set_have(*piece_index),
            PeerMessage::Extended { ext_id, payload } if *ext_id == EXTENSION_HANDSHAKE_ID => {
                let handshake = ExtensionHandshake::decode(payload)?;
                debug!(
                    "Peer {} supports extensions {:?}",
                    self.addr, handshake.extensions
                );
                self.ext_msg_ids = handshake.extensions;
                if handshake.metadata_size.is_some() {
                    self.metadata_size = handshake.metadata_size;
                }
            }
            PeerMessage::Unknown { id } => {
                debug!("Peer {} sent unknown message id {}, skipping", self.addr, id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Fetch the info dictionary over the metadata extension (BEP-9).
    ///
    /// Requests 16 KiB pieces in order, reassembles them, and accepts the
    /// result only if its SHA1 equals `info_hash`. The cancel signal is
    /// checked between pieces, never mid-frame, so a cancelled session's
    /// stream stays aligned and can still serve the download phase.
    pub async fn fetch_metadata(&mut self, info_hash: &[u8; 20], cancel: Shutdown) -> Result<()> {
        let ut_id = self.ext_msg_ids.get(UT_METADATA).copied().ok_or_else(|| {
            LeechError::ProtocolViolation(format!("peer {} does not support ut_metadata", self.addr))
        })?;
        let size = self.metadata_size.ok_or_else(|| {
            LeechError::ProtocolViolation(format!(
                "peer {} did not advertise metadata_size",
                self.addr
            ))
        })?;

        let mut assembled = Vec::with_capacity(size as usize);
        for piece in 0..metadata_piece_count(size) {
            if cancel.is_triggered() {
                return Ok(());
            }

            self.send_message(&PeerMessage::Extended {
                ext_id: ut_id,
                payload: MetadataMessage::request(piece).encode(),
            })
            .await?;

            loop {
                let message = self.next_message(REQUEST_TIMEOUT).await?;
                let PeerMessage::Extended { ext_id, payload } = message else {
                    continue;
                };
                if ext_id != LOCAL_UT_METADATA_ID {
                    continue;
                }

                let metadata = MetadataMessage::decode(&payload)?;
                match metadata.msg_type {
                    MetadataMessageType::Data if metadata.piece == piece => {
                        let data = metadata.data.ok_or_else(|| {
                            LeechError::ProtocolViolation(
                                "Metadata data message without payload".to_string(),
                            )
                        })?;
                        assembled.extend_from_slice(&data);
                        break;
                    }
                    MetadataMessageType::Reject => {
                        return Err(LeechError::ProtocolViolation(format!(
                            "peer {} rejected metadata piece {}",
                            self.addr, piece
                        )));
                    }
                    _ => {
                        return Err(LeechError::ProtocolViolation(format!(
                            "peer {} sent unexpected metadata message",
                            self.addr
                        )));
                    }
                }
            }
        }

        if assembled.len() as u64 != size {
            return Err(LeechError::ProtocolViolation(format!(
                "Metadata came to {} bytes, peer advertised {}",
                assembled.len(),
                size
            )));
        }

        let digest: [u8; 20] = Sha1::digest(&assembled).into();
        if &digest != info_hash {
            return Err(LeechError::ProtocolViolation(format!(
                "peer {} metadata hash mismatch",
                self.addr
            )));
        }

        info!("Fetched {}-byte info dictionary from {}", size, self.addr);
        self.info_dict = Some(assembled);
        Ok(())
    }

    /// Check if the peer claims a specific piece
    pub fn has_piece(&self, piece_index: u32) -> bool {
        let byte_index = piece_index as usize / 8;
        let bit_index = 7 - (piece_index as usize % 8);

        self.bitfield
            .get(byte_index)
            .is_some_and(|byte| (byte >> bit_index) & 1 == 1)
    }

    fn set_have(&mut self, piece_index: u32) {
        let byte_index = piece_index as usize / 8;
        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - (piece_index as usize % 8));
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn flags(&self) -> &PeerFlags {
        &self.flags
    }

    pub fn lifecycle(&self) -> SessionState {
        self.lifecycle
    }

    pub fn take_info_dict(&mut self) -> Option<Vec<u8>> {
        self.info_dict.take()
    }

    /// Orderly shutdown of the underlying socket
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
        self.lifecycle = SessionState::Closed;
    }
}

fn label(message: &PeerMessage) -> &'static str {
    match message {
        PeerMessage::KeepAlive => "keep-alive",
        PeerMessage::Choke => "choke",
        PeerMessage::Unchoke => "unchoke",
        PeerMessage::Interested => "interested",
        PeerMessage::NotInterested => "not-interested",
        PeerMessage::Have { .. } => "have",
        PeerMessage::Bitfield { .. } => "bitfield",
        PeerMessage::Request { .. } => "request",
        PeerMessage::Piece { .. } => "piece",
        PeerMessage::Cancel { .. } => "cancel",
        PeerMessage::Extended { .. } => "extended",
        PeerMessage::Unknown { .. } => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const PEER_ID: [u8; 20] = [0x22; 20];

    #[tokio::test]
    async fn test_rejects_info_hash_mismatch() {
        let (addr, listener) = testutil::listen().await;

        let server = tokio::spawn(async move {
            testutil::accept_and_handshake(&listener, [0x99; 20], false).await
        });

        let result = PeerSession::connect(addr, INFO_HASH, PEER_ID, false).await;
        assert!(matches!(result, Err(LeechError::HandshakeFailed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_init_takes_opening_bitfield() {
        let (addr, listener) = testutil::listen().await;

        let server = tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, INFO_HASH, false).await;
            testutil::send_message(
                &mut stream,
                &PeerMessage::Bitfield {
                    bitfield: vec![0b1010_0000],
                },
            )
            .await;
            stream
        });

        let mut session = PeerSession::connect(addr, INFO_HASH, PEER_ID, false)
            .await
            .unwrap();
        assert_eq!(session.lifecycle(), SessionState::Idle);

        session.init().await.unwrap();
        assert_eq!(session.lifecycle(), SessionState::Running);
        assert!(session.has_piece(0));
        assert!(!session.has_piece(1));
        assert!(session.has_piece(2));
        assert!(!session.has_piece(17));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_have_extends_bitfield() {
        let (addr, listener) = testutil::listen().await;

        let server = tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, INFO_HASH, false).await;
            testutil::send_message(&mut stream, &PeerMessage::Have { piece_index: 12 }).await;
            stream
        });

        let mut session = PeerSession::connect(addr, INFO_HASH, PEER_ID, false)
            .await
            .unwrap();
        session.init().await.unwrap();
        assert!(session.has_piece(12));
        assert!(!session.has_piece(11));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (addr, listener) = testutil::listen().await;

        let server = tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, INFO_HASH, false).await;
            // Announce a frame far above the ceiling
            stream
                .write_all(&(3 * 1024 * 1024u32).to_be_bytes())
                .await
                .unwrap();
            stream
        });

        let mut session = PeerSession::connect(addr, INFO_HASH, PEER_ID, false)
            .await
            .unwrap();
        let result = session.next_message(REQUEST_TIMEOUT).await;
        assert!(matches!(result, Err(LeechError::OversizedFrame(_))));
        assert_eq!(session.lifecycle(), SessionState::Dead);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_exchange() {
        // Arbitrary metadata payload spanning multiple 16 KiB pieces
        let metadata: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let info_hash: [u8; 20] = Sha1::digest(&metadata).into();
        let total = metadata.len() as u64;

        let (addr, listener) = testutil::listen().await;

        let served = metadata.clone();
        let server = tokio::spawn(async move {
            let mut stream = testutil::accept_and_handshake(&listener, info_hash, true).await;

            // Their extended handshake arrives first
            let message = testutil::read_message(&mut stream).await.unwrap();
            assert!(matches!(
                message,
                PeerMessage::Extended { ext_id: 0, .. }
            ));

            let mut reply = ExtensionHandshake::ours();
            reply.extensions.insert(UT_METADATA.to_string(), 3);
            reply.metadata_size = Some(total);
            testutil::send_message(
                &mut stream,
                &PeerMessage::Extended {
                    ext_id: 0,
                    payload: reply.encode(),
                },
            )
            .await;

            // Serve metadata piece requests until the client is satisfied
            for _ in 0..metadata_piece_count(total) {
                let message = testutil::read_message(&mut stream).await.unwrap();
                let PeerMessage::Extended { ext_id: 3, payload } = message else {
                    panic!("expected a metadata request");
                };
                let request = MetadataMessage::decode(&payload).unwrap();
                assert_eq!(request.msg_type, MetadataMessageType::Request);

                let begin = request.piece as usize * 16 * 1024;
                let end = (begin + 16 * 1024).min(served.len());
                let data = MetadataMessage {
                    msg_type: MetadataMessageType::Data,
                    piece: request.piece,
                    total_size: Some(total),
                    data: Some(served[begin..end].to_vec()),
                };
                testutil::send_message(
                    &mut stream,
                    &PeerMessage::Extended {
                        ext_id: LOCAL_UT_METADATA_ID,
                        payload: data.encode(),
                    },
                )
                .await;
            }
            stream
        });

        let mut session = PeerSession::connect(addr, info_hash, PEER_ID, true)
            .await
            .unwrap();
        session.init().await.unwrap();
        session
            .fetch_metadata(&info_hash, Shutdown::new())
            .await
            .unwrap();

        assert_eq!(session.take_info_dict(), Some(metadata));
        server.await.unwrap();
    }
}

//! Wire protocol for peer frames.
//!
//! Every frame carries one bincode-encoded [`WireMessage`]. Stream transports
//! additionally length-prefix frames:
//! ```text
//! +----------------+------------------+
//! | length (4 bytes, big-endian)      |
//! +----------------+------------------+
//! | payload (bincode-encoded message) |
//! +-----------------------------------+
//! ```
//!
//! ## Message Types
//!
//! 1. **Hello** (`PeerAnnouncement`): a node telling a peer which party it is
//!    and where it listens. Refreshes the peer registry on reconnect.
//! 2. **Ready** (`ReadyMessage`): a session's readiness announcement, carrying
//!    the run tag its round messages will use. Answers echo the announcer's
//!    run tag so they cannot be mistaken for answers to another run.
//! 3. **Round** (`RoundMessage`): one protocol-engine message for a round.

use common::{PartyId, PeerEndpoint, RunTag, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::encoding::unix_millis;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message codec error: {0}")]
    Codec(String),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: u32 },

    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Node-level announcement of a party's listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub party: PartyId,
    pub endpoint: PeerEndpoint,
    /// Set on the answer to an announcement so the exchange stops there.
    pub reply: bool,
}

/// Readiness announcement for one session run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub session_id: SessionId,
    pub sender: PartyId,
    /// Tag stamped on every round message of the sender's run.
    pub run: RunTag,
    /// On an answer, the run tag of the announcement being answered.
    /// None on an announcement.
    pub ack: Option<RunTag>,
}


/// Protocol message for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub session_id: SessionId,
    pub sender: PartyId,
    pub run: RunTag,
    /// Recipient party (None = broadcast).
    pub recipient: Option<PartyId>,
    /// Protocol round number, starting at 1.
    pub round: u16,
    /// Serialized protocol message payload.
    pub payload: Vec<u8>,
    /// Sequence number for ordering.
    pub seq: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl RoundMessage {
    pub fn new(
        session_id: SessionId,
        sender: PartyId,
        run: RunTag,
        recipient: Option<PartyId>,
        round: u16,
        payload: Vec<u8>,
        seq: u64,
    ) -> Self {
        Self {
            session_id,
            sender,
            run,
            recipient,
            round,
            payload,
            seq,
            timestamp: unix_millis(),
        }
    }
}

/// Any message sent between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Hello(PeerAnnouncement),
    Ready(ReadyMessage),
    Round(RoundMessage),
}

impl WireMessage {
    /// Session this message belongs to, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Hello(_) => None,
            Self::Ready(msg) => Some(&msg.session_id),
            Self::Round(msg) => Some(&msg.session_id),
        }
    }

    /// Encode to a frame body (no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = bincode::serialize(self).map_err(|e| WireError::Codec(e.to_string()))?;

        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(WireError::TooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(payload)
    }

    /// Decode a frame body (without length prefix).
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::Codec(e.to_string()))
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(WireError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, WireError> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }

    // Read payload
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_message() -> RoundMessage {
        RoundMessage::new(
            SessionId::from("abc123"),
            PartyId::from("p1"),
            42,
            None,
            1,
            vec![1, 2, 3],
            7,
        )
    }

    #[test]
    fn test_message_encode_decode() {
        let msg = WireMessage::Round(round_message());
        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.session_id().unwrap().as_str(), "abc123");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = WireMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(result, Err(WireError::Codec(_))));
    }

    #[test]
    fn test_hello_has_no_session() {
        let msg = WireMessage::Hello(PeerAnnouncement {
            party: "p1".into(),
            endpoint: "127.0.0.1:4000".into(),
            reply: false,
        });
        assert!(msg.session_id().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let body = WireMessage::Round(round_message()).encode().unwrap();

        write_frame(&mut client, &body).await.unwrap();
        drop(client);

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, body);

        // Clean EOF after the last frame
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(WireError::TooLarge { .. })));
    }
}

//! Framing and the signed envelope.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of JSON. Every
//! control message travels inside a [`SignedEnvelope`] whose signature covers the
//! canonical bytes of the embedded message.

use crate::identity::MessageSigner;
use crate::message::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("incomplete stream: expected {expected} frame bytes, received {received}")]
    Incomplete { expected: usize, received: usize },

    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message signature verification failed")]
    Verification,

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("no complete frame within {0:?}")]
    Stalled(Duration),
}

impl ProtocolError {
    /// True when the stream ended exactly on a frame boundary.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, ProtocolError::Incomplete { received: 0, .. })
    }
}

/// Signed wrapper around a control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub message: serde_json::Value,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn sign(message: &Message, signer: &dyn MessageSigner) -> Result<Self, ProtocolError> {
        let message = serde_json::to_value(message)?;
        let signature = signer.sign(&canonical_bytes(&message)?);
        Ok(Self {
            message,
            signature: hex::encode(signature),
        })
    }

    /// Check the signature, then decode the embedded message.
    pub fn verify(self, signer: &dyn MessageSigner) -> Result<Message, ProtocolError> {
        let signature = hex::decode(&self.signature).map_err(|_| ProtocolError::Verification)?;
        if !signer.verify(&canonical_bytes(&self.message)?, &signature) {
            return Err(ProtocolError::Verification);
        }
        Ok(serde_json::from_value(self.message)?)
    }
}

/// Object keys of a `serde_json::Value` are kept sorted, so re-serialising the
/// received value reproduces the bytes the sender signed.
fn canonical_bytes(message: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

#[derive(Debug, Clone)]
pub struct ChunkLinkCodec {
    max_frame_len: usize,
}

impl Default for ChunkLinkCodec {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl ChunkLinkCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub async fn write_message<T, S>(&self, stream: &mut T, value: &S) -> Result<(), ProtocolError>
    where
        T: AsyncWrite + Unpin,
        S: Serialize,
    {
        let json = serde_json::to_vec(value)?;
        if json.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: json.len(),
                limit: self.max_frame_len,
            });
        }
        let len = json.len() as u32;

        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&json).await?;
        stream.flush().await?;

        Ok(())
    }

    pub async fn read_message<T, D>(&self, stream: &mut T) -> Result<D, ProtocolError>
    where
        T: AsyncRead + Unpin,
        D: DeserializeOwned,
    {
        let len = self.read_frame_len(stream).await?;
        self.read_frame_body(stream, len).await
    }

    /// Wait for the next frame header and return the announced body length.
    pub async fn read_frame_len<T>(&self, stream: &mut T) -> Result<usize, ProtocolError>
    where
        T: AsyncRead + Unpin,
    {
        let mut len_bytes = [0u8; FRAME_HEADER_LEN];
        let received = read_full(stream, &mut len_bytes).await?;
        if received < FRAME_HEADER_LEN {
            return Err(ProtocolError::Incomplete {
                expected: FRAME_HEADER_LEN,
                received,
            });
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                limit: self.max_frame_len,
            });
        }
        Ok(len)
    }

    /// Read and decode a frame body of `len` bytes whose header was already consumed.
    pub async fn read_frame_body<T, D>(
        &self,
        stream: &mut T,
        len: usize,
    ) -> Result<D, ProtocolError>
    where
        T: AsyncRead + Unpin,
        D: DeserializeOwned,
    {
        let mut buf = vec![0u8; len];
        let received = read_full(stream, &mut buf).await?;
        if received < len {
            return Err(ProtocolError::Incomplete {
                expected: FRAME_HEADER_LEN + len,
                received: FRAME_HEADER_LEN + received,
            });
        }

        Ok(serde_json::from_slice(&buf)?)
    }

    pub async fn send_signed<T>(
        &self,
        stream: &mut T,
        message: &Message,
        signer: &dyn MessageSigner,
    ) -> Result<(), ProtocolError>
    where
        T: AsyncWrite + Unpin,
    {
        debug!("Writing {}", message.kind());
        let envelope = SignedEnvelope::sign(message, signer)?;
        self.write_message(stream, &envelope).await
    }

    pub async fn receive_verified<T>(
        &self,
        stream: &mut T,
        signer: &dyn MessageSigner,
    ) -> Result<Message, ProtocolError>
    where
        T: AsyncRead + Unpin,
    {
        let envelope: SignedEnvelope = self.read_message(stream).await?;
        let message = envelope.verify(signer)?;
        debug!("Message received {}", message.kind());
        Ok(message)
    }
}

/// Fill `buf` unless the stream ends first; returns how many bytes arrived.
async fn read_full<T>(stream: &mut T, buf: &mut [u8]) -> io::Result<usize>
where
    T: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::message::FileInfo;
    use tokio::io::duplex;

    fn publish() -> Message {
        Message::RequestPublish {
            filename: "doc.bin".to_string(),
            fileinfo: FileInfo {
                size: 1000,
                total_chunknum: 4,
            },
        }
    }

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let codec = ChunkLinkCodec::default();
        let identity = Identity::generate();
        let (mut client, mut server) = duplex(4096);

        codec.send_signed(&mut client, &publish(), &identity).await.unwrap();
        codec
            .send_signed(&mut client, &Message::RequestFileList, &identity)
            .await
            .unwrap();

        let first = codec.receive_verified(&mut server, &identity).await.unwrap();
        let second = codec.receive_verified(&mut server, &identity).await.unwrap();
        assert_eq!(first, publish());
        assert_eq!(second, Message::RequestFileList);
    }

    #[tokio::test]
    async fn test_clean_eof_at_boundary() {
        let codec = ChunkLinkCodec::default();
        let (client, mut server) = duplex(64);
        drop(client);

        let err = codec
            .read_message::<_, serde_json::Value>(&mut server)
            .await
            .unwrap_err();
        assert!(err.is_clean_eof());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_incomplete() {
        let codec = ChunkLinkCodec::default();
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"a\"").await.unwrap();
        drop(client);

        let err = codec
            .read_message::<_, serde_json::Value>(&mut server)
            .await
            .unwrap_err();
        match err {
            ProtocolError::Incomplete { expected, received } => {
                assert_eq!(expected, 14);
                assert_eq!(received, 8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let codec = ChunkLinkCodec::new(8);
        let (mut client, mut server) = duplex(64);
        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let err = codec
            .read_message::<_, serde_json::Value>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge {
                len: 1024,
                limit: 8
            }
        ));
    }

    #[test]
    fn test_tampered_message_rejected() {
        let identity = Identity::generate();
        let mut envelope = SignedEnvelope::sign(&publish(), &identity).unwrap();
        envelope.message["fileinfo"]["total_chunknum"] = serde_json::json!(400);

        assert!(matches!(
            envelope.verify(&identity),
            Err(ProtocolError::Verification)
        ));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let envelope = SignedEnvelope::sign(&publish(), &Identity::generate()).unwrap();
        assert!(matches!(
            envelope.verify(&Identity::generate()),
            Err(ProtocolError::Verification)
        ));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let identity = Identity::generate();
        let mut envelope = SignedEnvelope::sign(&publish(), &identity).unwrap();
        envelope.signature = "zz".to_string();
        assert!(matches!(
            envelope.verify(&identity),
            Err(ProtocolError::Verification)
        ));
    }

    #[test]
    fn test_signature_survives_wire_reordering() {
        let identity = Identity::generate();
        let envelope = SignedEnvelope::sign(&publish(), &identity).unwrap();

        // Re-encode the embedded message with keys in a different textual order.
        let reordered = format!(
            r#"{{"signature":"{}","message":{{"fileinfo":{{"total_chunknum":4,"size":1000}},"type":"request_publish","filename":"doc.bin"}}}}"#,
            envelope.signature
        );
        let parsed: SignedEnvelope = serde_json::from_str(&reordered).unwrap();
        assert_eq!(parsed.verify(&identity).unwrap(), publish());
    }
}

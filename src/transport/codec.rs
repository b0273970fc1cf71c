use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{INCOMING_MESSAGE, INCOMING_STREAM, Rpc, TransportError};

/// Largest control message accepted off the wire.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Reads exactly one framed unit from a connection.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        rpc: &mut Rpc,
    ) -> Result<(), TransportError>;
}

/// Production format: marker byte, then `u32` LE length + payload for control messages.
/// A stream marker consumes nothing beyond itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

#[async_trait]
impl Decoder for DefaultDecoder {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        rpc: &mut Rpc,
    ) -> Result<(), TransportError> {
        let marker = reader.read_u8().await?;

        match marker {
            INCOMING_STREAM => {
                rpc.stream = true;
                Ok(())
            }
            INCOMING_MESSAGE => {
                let len = reader.read_u32_le().await?;
                if len > MAX_FRAME_LEN {
                    return Err(TransportError::FrameTooLarge(len as u64));
                }

                let mut payload = vec![0u8; len as usize];
                reader.read_exact(&mut payload).await?;
                rpc.payload = payload;
                Ok(())
            }
            other => Err(TransportError::UnknownMarker(other)),
        }
    }
}

/// Builds a complete control frame around an encoded envelope.
/// Payloads the decoder would reject are refused here as well.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(TransportError::FrameTooLarge(payload.len() as u64));
    }

    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

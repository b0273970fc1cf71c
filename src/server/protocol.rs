//! Control Envelope
//!
//! The only message type exchanged as a control frame. Serialized as JSON with the variant
//! name as the outer key, e.g. `{"GetFile":{"owner_id":"..","key":".."}}`, so the receiver
//! can dispatch on it.

use serde::{Deserialize, Serialize};

use super::types::ServerError;
use crate::transport::codec::encode_message;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// `size` encrypted bytes for this key follow on a raw stream.
    StoreFile {
        owner_id: String,
        key: String,
        size: u64,
    },
    /// Asks every peer holding the key to stream it back.
    GetFile { owner_id: String, key: String },
    DeleteFile { owner_id: String, key: String },
}

impl Message {
    pub fn owner_id(&self) -> &str {
        match self {
            Message::StoreFile { owner_id, .. }
            | Message::GetFile { owner_id, .. }
            | Message::DeleteFile { owner_id, .. } => owner_id,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. }
            | Message::GetFile { key, .. }
            | Message::DeleteFile { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Complete control frame: marker, length prefix, envelope.
    pub fn to_frame(&self) -> Result<Vec<u8>, ServerError> {
        Ok(encode_message(&self.encode()?)?)
    }
}

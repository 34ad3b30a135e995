use serde::{Deserialize, Serialize};

/// Encrypted data-channel frame. Opaque to everyone without the room key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
  #[serde(with = "crate::b64")]
  pub iv: Vec<u8>,
  #[serde(with = "crate::b64")]
  pub ciphertext: Vec<u8>,
}

/// Plaintext carried inside an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
  Text {
    text: String,
  },
  System {
    text: String,
  },
  #[serde(rename_all = "camelCase")]
  FileMeta {
    file_id: String,
    name: String,
    size: u64,
    mime: String,
    total_chunks: u64,
  },
  #[serde(rename_all = "camelCase")]
  FileChunk {
    file_id: String,
    seq: u64,
    #[serde(with = "crate::b64")]
    data: Vec<u8>,
  },
  #[serde(rename_all = "camelCase")]
  FileComplete { file_id: String },
}

impl Payload {
  pub fn kind(&self) -> &'static str {
    match self {
      Payload::Text { .. } => "text",
      Payload::System { .. } => "system",
      Payload::FileMeta { .. } => "file-meta",
      Payload::FileChunk { .. } => "file-chunk",
      Payload::FileComplete { .. } => "file-complete",
    }
  }
}

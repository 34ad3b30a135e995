//! Passphrase-derived room key and the data-channel encryption envelope.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use getrandom::getrandom;
use meshlane_proto::{Envelope, Payload};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const AES_KEY_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 12;

/// Largest data-channel message webrtc-sctp accepts by default.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const PBKDF2_SALT: &[u8] = b"stealthlan-salt";
const PBKDF2_ITERATIONS: u32 = 50_000;
const ROOM_GATE_DOMAIN: &[u8] = b"meshlane-room-gate:";

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("failed to serialize payload: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("random source unavailable: {0}")]
  Random(String),

  #[error("encryption failed")]
  Encrypt,
}

/// Derives the 256-bit room key from a passphrase. Every participant that
/// knows the passphrase arrives at the same key.
pub fn derive_key(passphrase: &str) -> [u8; AES_KEY_LEN] {
  let mut key = [0u8; AES_KEY_LEN];
  pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), PBKDF2_SALT, PBKDF2_ITERATIONS, &mut key);
  key
}

/// One-way digest the relay uses to gate room access. Unrelated to the key.
pub fn passphrase_hash(passphrase: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(ROOM_GATE_DOMAIN);
  hasher.update(passphrase.as_bytes());
  hex::encode(hasher.finalize())
}

pub struct Codec {
  cipher: Aes256Gcm,
}

impl Codec {
  pub fn new(key: &[u8; AES_KEY_LEN]) -> Self {
    Self {
      cipher: Aes256Gcm::new(key.into()),
    }
  }

  /// Runs the slow key derivation off the async executor.
  pub async fn from_passphrase(passphrase: String) -> anyhow::Result<Self> {
    let key = tokio::task::spawn_blocking(move || derive_key(&passphrase)).await?;
    Ok(Self::new(&key))
  }

  pub fn encrypt(&self, payload: &Payload) -> Result<Envelope, CodecError> {
    let plain = serde_json::to_vec(payload)?;
    let mut iv = [0u8; AES_NONCE_LEN];
    getrandom(&mut iv).map_err(|err| CodecError::Random(err.to_string()))?;
    let ciphertext = self
      .cipher
      .encrypt(Nonce::from_slice(&iv), plain.as_slice())
      .map_err(|_| CodecError::Encrypt)?;
    Ok(Envelope {
      iv: iv.to_vec(),
      ciphertext,
    })
  }

  /// Returns `None` for anything that does not authenticate under this key
  /// or does not decode to a known payload.
  pub fn decrypt(&self, envelope: &Envelope) -> Option<Payload> {
    if envelope.iv.len() != AES_NONCE_LEN {
      debug!(len = envelope.iv.len(), "envelope with bad nonce length dropped");
      return None;
    }
    let plain = match self
      .cipher
      .decrypt(Nonce::from_slice(&envelope.iv), envelope.ciphertext.as_slice())
    {
      Ok(plain) => plain,
      Err(_) => {
        debug!("envelope failed authentication");
        return None;
      }
    };
    match serde_json::from_slice(&plain) {
      Ok(payload) => Some(payload),
      Err(err) => {
        debug!(error = %err, "authenticated envelope with unknown payload dropped");
        None
      }
    }
  }

  pub fn seal(&self, payload: &Payload) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&self.encrypt(payload)?)?)
  }

  /// Parses and decrypts one data-channel text frame.
  pub fn open(&self, frame: &str) -> Option<Payload> {
    let envelope: Envelope = serde_json::from_str(frame).ok()?;
    self.decrypt(&envelope)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn codec(passphrase: &str) -> Codec {
    Codec::new(&derive_key(passphrase))
  }

  fn samples() -> Vec<Payload> {
    vec![
      Payload::Text { text: "hello mesh".into() },
      Payload::System { text: "Bob joined".into() },
      Payload::FileMeta {
        file_id: "f1".into(),
        name: "notes.txt".into(),
        size: 42,
        mime: "text/plain".into(),
        total_chunks: 3,
      },
      Payload::FileChunk {
        file_id: "f1".into(),
        seq: 2,
        data: vec![0, 159, 255, 7],
      },
      Payload::FileComplete { file_id: "f1".into() },
    ]
  }

  #[test]
  fn derivation_is_deterministic() {
    assert_eq!(derive_key("correct-horse"), derive_key("correct-horse"));
    assert_ne!(derive_key("correct-horse"), derive_key("correct-horsf"));
  }

  #[test]
  fn gate_hash_is_hex_and_independent_of_key() {
    let hash = passphrase_hash("correct-horse");
    assert_eq!(hash.len(), 64);
    assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(hash, passphrase_hash("correct-horse"));
    assert_ne!(hash, passphrase_hash("wrong-pw"));
    assert_ne!(hash, hex::encode(derive_key("correct-horse")));
  }

  #[test]
  fn round_trips_every_payload_shape() {
    let codec = codec("correct-horse");
    for payload in samples() {
      let envelope = codec.encrypt(&payload).unwrap();
      assert_eq!(codec.decrypt(&envelope), Some(payload));
    }
  }

  #[test]
  fn fresh_nonce_per_message() {
    let codec = codec("correct-horse");
    let payload = Payload::Text { text: "same".into() };
    let a = codec.encrypt(&payload).unwrap();
    let b = codec.encrypt(&payload).unwrap();
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext, b.ciphertext);
  }

  #[test]
  fn wrong_key_yields_nothing() {
    let alice = codec("correct-horse");
    let eve = codec("wrong-pw");
    for payload in samples() {
      let envelope = alice.encrypt(&payload).unwrap();
      assert_eq!(eve.decrypt(&envelope), None);
    }
  }

  #[test]
  fn tampering_is_detected() {
    let codec = codec("correct-horse");
    let mut envelope = codec.encrypt(&Payload::Text { text: "hi".into() }).unwrap();
    envelope.ciphertext[0] ^= 0x01;
    assert_eq!(codec.decrypt(&envelope), None);

    let mut short = codec.encrypt(&Payload::Text { text: "hi".into() }).unwrap();
    short.iv.truncate(4);
    assert_eq!(codec.decrypt(&short), None);
  }

  #[test]
  fn frames_survive_text_transport() {
    let codec = codec("correct-horse");
    let payload = Payload::Text { text: "over the wire".into() };
    let frame = codec.seal(&payload).unwrap();
    assert!(frame.contains("\"iv\""));
    assert_eq!(codec.open(&frame), Some(payload));
    assert_eq!(codec.open("not json"), None);
  }

  fn chunk_frame(codec: &Codec, len: usize) -> String {
    let payload = Payload::FileChunk {
      file_id: uuid::Uuid::new_v4().to_string(),
      seq: u64::MAX,
      data: vec![0xa5; len],
    };
    codec.seal(&payload).unwrap()
  }

  #[test]
  fn largest_chunk_fits_one_frame() {
    use crate::transfer::MAX_CHUNK_SIZE;

    let codec = codec("correct-horse");
    assert!(chunk_frame(&codec, MAX_CHUNK_SIZE).len() <= MAX_FRAME_LEN);
    // Double base64 inflates a chunk by roughly 16/9.
    assert!(chunk_frame(&codec, 36 * 1024).len() > MAX_FRAME_LEN);
  }

  #[tokio::test]
  async fn async_derivation_matches_sync() {
    let from_async = Codec::from_passphrase("correct-horse".into()).await.unwrap();
    let frame = from_async.seal(&Payload::Text { text: "x".into() }).unwrap();
    assert!(codec("correct-horse").open(&frame).is_some());
  }
}

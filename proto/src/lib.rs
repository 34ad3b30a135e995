//! Wire types shared by the meshlane relay and client.
//!
//! Relay traffic is JSON text frames tagged by `"type"`. Data-channel
//! traffic is an encrypted [`Envelope`] whose plaintext is a [`Payload`].

mod payload;
mod signaling;

pub use payload::{Envelope, Payload};
pub use signaling::{
  AccessErrorCode, ClientEvent, IceCandidate, PeerInfo, RelayEvent, SignalPayload, UserEntry,
};

/// Serde helpers that carry raw bytes as standard base64 strings.
pub mod b64 {
  use base64::{engine::general_purpose::STANDARD, Engine as _};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(value))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
  }
}

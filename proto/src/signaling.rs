use serde::{Deserialize, Serialize};

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
  #[serde(rename_all = "camelCase")]
  CreateRoom {
    room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room_name: Option<String>,
    name: String,
    passphrase_hash: String,
  },
  #[serde(rename_all = "camelCase")]
  JoinRoom {
    room_id: String,
    name: String,
    passphrase_hash: String,
  },
  #[serde(rename_all = "camelCase")]
  LeaveRoom { room_id: String },
  #[serde(rename_all = "camelCase")]
  KickUser { room_id: String, peer_id: String },
  /// `payload` is forwarded verbatim; the relay never looks inside it.
  #[serde(rename_all = "camelCase")]
  Signal {
    room_id: String,
    to: String,
    payload: serde_json::Value,
  },
}

/// Events the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
  #[serde(rename_all = "camelCase")]
  YourId { peer_id: String, room_name: String },
  Peers { peers: Vec<PeerInfo> },
  UserList { users: Vec<UserEntry> },
  #[serde(rename_all = "camelCase")]
  PeerJoined { peer_id: String, name: String },
  #[serde(rename_all = "camelCase")]
  PeerLeft { peer_id: String, name: String },
  Signal {
    from: String,
    payload: serde_json::Value,
  },
  CreateError { code: AccessErrorCode, message: String },
  JoinError { code: AccessErrorCode, message: String },
  Kicked { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessErrorCode {
  RoomExists,
  RoomNotFound,
  PassphraseMismatch,
  AlreadyMember,
  InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
  pub peer_id: String,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
  pub peer_id: String,
  pub name: String,
  pub is_host: bool,
}

/// Peer-to-peer negotiation messages carried inside `signal` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
  Offer { sdp: String },
  Answer { sdp: String },
  Candidate { candidate: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
  pub candidate: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sdp_mid: Option<String>,
  #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
  pub sdp_mline_index: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_fragment: Option<String>,
}

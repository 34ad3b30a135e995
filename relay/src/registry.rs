//! Room membership and the passphrase-hash gate.
//!
//! The registry is a plain owned data structure: every operation mutates it
//! and returns the events that must be delivered as a consequence. The
//! caller is responsible for applying operations for a room one at a time.

use std::collections::HashMap;

use meshlane_proto::{PeerInfo, RelayEvent, UserEntry};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::error::RegistryError;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_NAME_LEN: usize = 64;
const PASSPHRASE_HASH_LEN: usize = 64;

/// An event addressed to one connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
  pub to: String,
  pub event: RelayEvent,
}

impl Delivery {
  fn new(to: &str, event: RelayEvent) -> Self {
    Self { to: to.to_string(), event }
  }
}

#[derive(Debug)]
struct Member {
  peer_id: String,
  name: String,
}

#[derive(Debug)]
struct Room {
  display_name: String,
  passphrase_hash: String,
  // Join order, oldest first. Used for host promotion.
  members: Vec<Member>,
  host: String,
}

impl Room {
  fn user_list(&self) -> Vec<UserEntry> {
    self
      .members
      .iter()
      .map(|member| UserEntry {
        peer_id: member.peer_id.clone(),
        name: member.name.clone(),
        is_host: member.peer_id == self.host,
      })
      .collect()
  }

  fn broadcast_user_list(&self, out: &mut Vec<Delivery>) {
    let users = self.user_list();
    for member in &self.members {
      out.push(Delivery::new(&member.peer_id, RelayEvent::UserList { users: users.clone() }));
    }
  }
}

#[derive(Debug, Default)]
pub struct Registry {
  rooms: HashMap<String, Room>,
  // peer id -> room id
  membership: HashMap<String, String>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn room_count(&self) -> usize {
    self.rooms.len()
  }

  pub fn room_of(&self, peer_id: &str) -> Option<&str> {
    self.membership.get(peer_id).map(String::as_str)
  }

  pub fn users(&self, room_id: &str) -> Option<Vec<UserEntry>> {
    self.rooms.get(room_id).map(Room::user_list)
  }

  pub fn host_of(&self, room_id: &str) -> Option<&str> {
    self.rooms.get(room_id).map(|room| room.host.as_str())
  }

  pub fn create_room(
    &mut self,
    peer_id: &str,
    room_id: &str,
    room_name: Option<&str>,
    name: &str,
    passphrase_hash: &str,
  ) -> Result<Vec<Delivery>, RegistryError> {
    let room_id = validate_room_id(room_id)?;
    let name = validate_name(name)?;
    let passphrase_hash = validate_hash(passphrase_hash)?;
    if self.rooms.contains_key(room_id) {
      return Err(RegistryError::RoomExists(room_id.to_string()));
    }
    let display_name = room_name
      .map(str::trim)
      .filter(|value| !value.is_empty())
      .map(|value| truncate(value, MAX_NAME_LEN))
      .unwrap_or_else(|| room_id.to_string());

    let mut out = self.leave_room(peer_id);
    let room = Room {
      display_name: display_name.clone(),
      passphrase_hash,
      members: vec![Member {
        peer_id: peer_id.to_string(),
        name: name.to_string(),
      }],
      host: peer_id.to_string(),
    };
    out.push(Delivery::new(
      peer_id,
      RelayEvent::YourId {
        peer_id: peer_id.to_string(),
        room_name: display_name,
      },
    ));
    room.broadcast_user_list(&mut out);
    self.rooms.insert(room_id.to_string(), room);
    self.membership.insert(peer_id.to_string(), room_id.to_string());
    info!(peer = peer_id, room = room_id, "room created");
    Ok(out)
  }

  pub fn join_room(
    &mut self,
    peer_id: &str,
    room_id: &str,
    name: &str,
    passphrase_hash: &str,
  ) -> Result<Vec<Delivery>, RegistryError> {
    let room_id = validate_room_id(room_id)?;
    let name = validate_name(name)?;
    let passphrase_hash = validate_hash(passphrase_hash)?;
    let room = self
      .rooms
      .get(room_id)
      .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
    let matches: bool = room
      .passphrase_hash
      .as_bytes()
      .ct_eq(passphrase_hash.as_bytes())
      .into();
    if !matches {
      return Err(RegistryError::PassphraseMismatch(room_id.to_string()));
    }
    if self.room_of(peer_id) == Some(room_id) {
      return Err(RegistryError::AlreadyMember(room_id.to_string()));
    }

    let mut out = self.leave_room(peer_id);
    let Some(room) = self.rooms.get_mut(room_id) else {
      return Err(RegistryError::RoomNotFound(room_id.to_string()));
    };
    let peers: Vec<PeerInfo> = room
      .members
      .iter()
      .map(|member| PeerInfo {
        peer_id: member.peer_id.clone(),
        name: member.name.clone(),
      })
      .collect();
    out.push(Delivery::new(
      peer_id,
      RelayEvent::YourId {
        peer_id: peer_id.to_string(),
        room_name: room.display_name.clone(),
      },
    ));
    out.push(Delivery::new(peer_id, RelayEvent::Peers { peers: peers.clone() }));
    for existing in &peers {
      out.push(Delivery::new(
        &existing.peer_id,
        RelayEvent::PeerJoined {
          peer_id: peer_id.to_string(),
          name: name.to_string(),
        },
      ));
    }
    room.members.push(Member {
      peer_id: peer_id.to_string(),
      name: name.to_string(),
    });
    room.broadcast_user_list(&mut out);
    self.membership.insert(peer_id.to_string(), room_id.to_string());
    info!(peer = peer_id, room = room_id, members = room.members.len(), "peer joined");
    Ok(out)
  }

  /// Removes the peer from whatever room it is in. A peer that is in no
  /// room produces no events.
  pub fn leave_room(&mut self, peer_id: &str) -> Vec<Delivery> {
    let mut out = Vec::new();
    let Some(room_id) = self.membership.remove(peer_id) else {
      return out;
    };
    let Some(room) = self.rooms.get_mut(&room_id) else {
      return out;
    };
    let Some(index) = room.members.iter().position(|member| member.peer_id == peer_id) else {
      return out;
    };
    let member = room.members.remove(index);
    info!(peer = peer_id, room = %room_id, "peer left");

    if room.members.is_empty() {
      self.rooms.remove(&room_id);
      info!(room = %room_id, "room destroyed");
      return out;
    }

    if room.host == peer_id {
      room.host = room.members[0].peer_id.clone();
      info!(room = %room_id, host = %room.host, "host promoted");
    }

    for remaining in &room.members {
      out.push(Delivery::new(
        &remaining.peer_id,
        RelayEvent::PeerLeft {
          peer_id: member.peer_id.clone(),
          name: member.name.clone(),
        },
      ));
    }
    room.broadcast_user_list(&mut out);
    out
  }

  /// Removes `target_id` on behalf of the room host. Unauthorized or
  /// malformed requests are a silent no-op.
  pub fn kick(&mut self, requester_id: &str, room_id: &str, target_id: &str) -> Vec<Delivery> {
    let Some(room) = self.rooms.get(room_id) else {
      debug!(requester = requester_id, room = room_id, "kick for unknown room ignored");
      return Vec::new();
    };
    if room.host != requester_id {
      debug!(requester = requester_id, room = room_id, "kick by non-host ignored");
      return Vec::new();
    }
    if target_id == room.host || self.room_of(target_id) != Some(room_id) {
      debug!(requester = requester_id, target = target_id, "kick target not eligible");
      return Vec::new();
    }

    let message = format!("You were removed from {} by the host", room.display_name);
    let mut out = vec![Delivery::new(target_id, RelayEvent::Kicked { message })];
    out.extend(self.leave_room(target_id));
    info!(room = room_id, target = target_id, "peer kicked");
    out
  }

  /// Addresses a signaling payload to `to_id`. Returns `None` unless both
  /// ends are currently members of `room_id`.
  pub fn route_signal(
    &self,
    from_id: &str,
    room_id: &str,
    to_id: &str,
    payload: serde_json::Value,
  ) -> Option<Delivery> {
    if from_id == to_id || self.room_of(from_id) != Some(room_id) || self.room_of(to_id) != Some(room_id) {
      return None;
    }
    Some(Delivery::new(
      to_id,
      RelayEvent::Signal {
        from: from_id.to_string(),
        payload,
      },
    ))
  }
}

fn validate_room_id(room_id: &str) -> Result<&str, RegistryError> {
  let room_id = room_id.trim();
  if room_id.is_empty() {
    return Err(RegistryError::InvalidRequest("room id is required".into()));
  }
  if room_id.len() > MAX_ROOM_ID_LEN {
    return Err(RegistryError::InvalidRequest("room id is too long".into()));
  }
  Ok(room_id)
}

fn validate_name(name: &str) -> Result<&str, RegistryError> {
  let name = name.trim();
  if name.is_empty() {
    return Err(RegistryError::InvalidRequest("display name is required".into()));
  }
  if name.chars().count() > MAX_NAME_LEN {
    return Err(RegistryError::InvalidRequest("display name is too long".into()));
  }
  Ok(name)
}

fn validate_hash(hash: &str) -> Result<String, RegistryError> {
  if hash.len() != PASSPHRASE_HASH_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
    return Err(RegistryError::InvalidRequest("passphrase hash must be 64 hex characters".into()));
  }
  Ok(hash.to_ascii_lowercase())
}

fn truncate(value: &str, max_chars: usize) -> String {
  value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hash(fill: char) -> String {
    std::iter::repeat(fill).take(64).collect()
  }

  fn events_for<'a>(out: &'a [Delivery], peer: &str) -> Vec<&'a RelayEvent> {
    out.iter().filter(|d| d.to == peer).map(|d| &d.event).collect()
  }

  fn lab_with_alice() -> Registry {
    let mut registry = Registry::new();
    registry
      .create_room("alice", "lab42", Some("Lab"), "Alice", &hash('a'))
      .unwrap();
    registry
  }

  #[test]
  fn create_assigns_host_and_reports_room_name() {
    let mut registry = Registry::new();
    let out = registry
      .create_room("alice", "lab42", Some("Lab"), "Alice", &hash('a'))
      .unwrap();
    assert_eq!(
      out[0],
      Delivery::new(
        "alice",
        RelayEvent::YourId {
          peer_id: "alice".into(),
          room_name: "Lab".into()
        }
      )
    );
    assert!(out.iter().all(|d| d.to == "alice"));
    assert_eq!(registry.host_of("lab42"), Some("alice"));
  }

  #[test]
  fn room_name_defaults_to_room_id() {
    let mut registry = Registry::new();
    let out = registry.create_room("alice", "lab42", None, "Alice", &hash('a')).unwrap();
    assert!(matches!(&out[0].event, RelayEvent::YourId { room_name, .. } if room_name == "lab42"));
  }

  #[test]
  fn create_is_exclusive_even_with_matching_hash() {
    let mut registry = lab_with_alice();
    let err = registry
      .create_room("bob", "lab42", None, "Bob", &hash('a'))
      .unwrap_err();
    assert_eq!(err, RegistryError::RoomExists("lab42".into()));
    assert_eq!(registry.users("lab42").unwrap().len(), 1);
    assert_eq!(registry.room_of("bob"), None);
  }

  #[test]
  fn join_requires_existing_room() {
    let mut registry = Registry::new();
    let err = registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap_err();
    assert_eq!(err, RegistryError::RoomNotFound("lab42".into()));
    assert_eq!(registry.room_count(), 0);
  }

  #[test]
  fn join_with_wrong_hash_leaves_membership_untouched() {
    let mut registry = lab_with_alice();
    let err = registry.join_room("eve", "lab42", "Eve", &hash('e')).unwrap_err();
    assert_eq!(err, RegistryError::PassphraseMismatch("lab42".into()));
    let users = registry.users("lab42").unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].peer_id, "alice");
  }

  #[test]
  fn join_sends_roster_to_newcomer_and_peer_joined_to_existing() {
    let mut registry = lab_with_alice();
    let out = registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();

    let bob = events_for(&out, "bob");
    assert!(matches!(bob[0], RelayEvent::YourId { room_name, .. } if room_name == "Lab"));
    assert_eq!(
      bob[1],
      &RelayEvent::Peers {
        peers: vec![PeerInfo {
          peer_id: "alice".into(),
          name: "Alice".into()
        }]
      }
    );
    assert!(matches!(bob[2], RelayEvent::UserList { users } if users.len() == 2));

    let alice = events_for(&out, "alice");
    assert_eq!(
      alice[0],
      &RelayEvent::PeerJoined {
        peer_id: "bob".into(),
        name: "Bob".into()
      }
    );
  }

  #[test]
  fn hash_comparison_ignores_hex_case() {
    let mut registry = lab_with_alice();
    assert!(registry.join_room("bob", "lab42", "Bob", &hash('A')).is_ok());
  }

  #[test]
  fn rejoining_the_same_room_is_rejected() {
    let mut registry = lab_with_alice();
    let err = registry.join_room("alice", "lab42", "Alice", &hash('a')).unwrap_err();
    assert_eq!(err, RegistryError::AlreadyMember("lab42".into()));
    assert_eq!(registry.room_count(), 1);
  }

  #[test]
  fn joining_another_room_leaves_the_previous_one() {
    let mut registry = lab_with_alice();
    registry.create_room("carol", "other", None, "Carol", &hash('c')).unwrap();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();

    let out = registry.join_room("bob", "other", "Bob", &hash('c')).unwrap();
    assert!(out
      .iter()
      .any(|d| d.to == "alice" && matches!(&d.event, RelayEvent::PeerLeft { peer_id, .. } if peer_id == "bob")));
    assert_eq!(registry.room_of("bob"), Some("other"));
    assert_eq!(registry.users("lab42").unwrap().len(), 1);
  }

  #[test]
  fn invalid_inputs_are_rejected() {
    let mut registry = Registry::new();
    for (room, name, passphrase_hash) in [
      ("  ", "Alice", hash('a')),
      ("lab42", "", hash('a')),
      ("lab42", "Alice", "short".to_string()),
      ("lab42", "Alice", hash('z')),
    ] {
      let err = registry
        .create_room("alice", room, None, name, &passphrase_hash)
        .unwrap_err();
      assert!(matches!(err, RegistryError::InvalidRequest(_)));
    }
    assert_eq!(registry.room_count(), 0);
  }

  #[test]
  fn leave_notifies_remaining_members_and_destroys_empty_room() {
    let mut registry = lab_with_alice();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();

    let out = registry.leave_room("bob");
    assert_eq!(
      events_for(&out, "alice")[0],
      &RelayEvent::PeerLeft {
        peer_id: "bob".into(),
        name: "Bob".into()
      }
    );
    assert!(events_for(&out, "bob").is_empty());

    assert!(registry.leave_room("alice").is_empty());
    assert_eq!(registry.room_count(), 0);
    assert!(registry.leave_room("alice").is_empty());
  }

  #[test]
  fn host_leaving_promotes_earliest_member() {
    let mut registry = lab_with_alice();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();
    registry.join_room("carol", "lab42", "Carol", &hash('a')).unwrap();

    let out = registry.leave_room("alice");
    assert_eq!(registry.host_of("lab42"), Some("bob"));
    let list = events_for(&out, "carol")
      .into_iter()
      .find_map(|event| match event {
        RelayEvent::UserList { users } => Some(users.clone()),
        _ => None,
      })
      .unwrap();
    assert!(list.iter().any(|u| u.peer_id == "bob" && u.is_host));
  }

  #[test]
  fn host_can_kick_member() {
    let mut registry = lab_with_alice();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();

    let out = registry.kick("alice", "lab42", "bob");
    assert!(matches!(out[0].event, RelayEvent::Kicked { .. }));
    assert_eq!(out[0].to, "bob");
    assert!(out
      .iter()
      .any(|d| d.to == "alice" && matches!(&d.event, RelayEvent::PeerLeft { peer_id, .. } if peer_id == "bob")));
    let users = registry.users("lab42").unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(registry.room_of("bob"), None);
  }

  #[test]
  fn kick_by_non_host_or_of_host_is_a_no_op() {
    let mut registry = lab_with_alice();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();
    registry.join_room("carol", "lab42", "Carol", &hash('a')).unwrap();

    assert!(registry.kick("bob", "lab42", "carol").is_empty());
    assert!(registry.kick("bob", "lab42", "alice").is_empty());
    assert!(registry.kick("alice", "lab42", "alice").is_empty());
    assert!(registry.kick("alice", "lab42", "nobody").is_empty());
    assert_eq!(registry.users("lab42").unwrap().len(), 3);
  }

  #[test]
  fn kick_across_rooms_is_rejected() {
    let mut registry = lab_with_alice();
    registry.create_room("carol", "other", None, "Carol", &hash('c')).unwrap();
    assert!(registry.kick("alice", "lab42", "carol").is_empty());
    assert!(registry.kick("alice", "other", "carol").is_empty());
    assert_eq!(registry.room_of("carol"), Some("other"));
  }

  #[test]
  fn signals_only_route_within_a_shared_room() {
    let mut registry = lab_with_alice();
    registry.join_room("bob", "lab42", "Bob", &hash('a')).unwrap();
    registry.create_room("eve", "other", None, "Eve", &hash('e')).unwrap();
    let payload = serde_json::json!({"type": "offer", "sdp": "v=0"});

    let routed = registry.route_signal("bob", "lab42", "alice", payload.clone()).unwrap();
    assert_eq!(routed.to, "alice");
    assert_eq!(
      routed.event,
      RelayEvent::Signal {
        from: "bob".into(),
        payload: payload.clone()
      }
    );

    assert!(registry.route_signal("eve", "lab42", "alice", payload.clone()).is_none());
    assert!(registry.route_signal("eve", "other", "alice", payload.clone()).is_none());
    assert!(registry.route_signal("bob", "lab42", "ghost", payload).is_none());
  }
}

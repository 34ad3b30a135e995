//! Routes client events through the registry to connected sockets.

use std::collections::HashMap;
use std::sync::Mutex;

use meshlane_proto::{ClientEvent, RelayEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::{Delivery, Registry};

pub type EventSender = mpsc::Sender<RelayEvent>;
pub type EventReceiver = mpsc::Receiver<RelayEvent>;

/// Events queued per connection before it is treated as stalled.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Default)]
struct HubState {
  registry: Registry,
  connections: HashMap<String, EventSender>,
}

impl HubState {
  /// Queues deliveries. A connection whose queue is full is dropped and
  /// removed from its room, and the resulting notices are delivered too.
  fn dispatch(&mut self, deliveries: Vec<Delivery>) {
    let mut pending = deliveries;
    while !pending.is_empty() {
      let mut stalled = Vec::new();
      for Delivery { to, event } in pending {
        let Some(tx) = self.connections.get(&to) else {
          debug!(peer = %to, "dropping event for unknown connection");
          continue;
        };
        match tx.try_send(event) {
          Ok(()) => {}
          Err(TrySendError::Full(_)) => {
            if !stalled.contains(&to) {
              stalled.push(to);
            }
          }
          Err(TrySendError::Closed(_)) => debug!(peer = %to, "dropping event for closing connection"),
        }
      }
      pending = Vec::new();
      for peer_id in stalled {
        warn!(peer = %peer_id, "outbound queue full, disconnecting slow client");
        self.connections.remove(&peer_id);
        pending.extend(self.registry.leave_room(&peer_id));
      }
    }
  }
}

/// Shared relay state. Every operation runs under one lock and queues its
/// outbound events before releasing it, so membership changes are atomic and
/// each peer observes them in the order they were applied.
#[derive(Default)]
pub struct SignalingHub {
  state: Mutex<HubState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
  pub rooms: usize,
  pub connections: usize,
}

impl SignalingHub {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new connection and assigns its peer id.
  pub fn connect(&self) -> (String, EventReceiver) {
    self.connect_with_capacity(OUTBOUND_QUEUE)
  }

  fn connect_with_capacity(&self, capacity: usize) -> (String, EventReceiver) {
    let peer_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(capacity);
    self.lock().connections.insert(peer_id.clone(), tx);
    (peer_id, rx)
  }

  pub fn disconnect(&self, peer_id: &str) {
    let mut state = self.lock();
    state.connections.remove(peer_id);
    let out = state.registry.leave_room(peer_id);
    state.dispatch(out);
  }

  pub fn stats(&self) -> HubStats {
    let state = self.lock();
    HubStats {
      rooms: state.registry.room_count(),
      connections: state.connections.len(),
    }
  }

  pub fn handle(&self, peer_id: &str, event: ClientEvent) {
    let mut state = self.lock();
    if !state.connections.contains_key(peer_id) {
      warn!(peer = peer_id, "event from unregistered connection ignored");
      return;
    }
    let out = match event {
      ClientEvent::CreateRoom {
        room_id,
        room_name,
        name,
        passphrase_hash,
      } => state
        .registry
        .create_room(peer_id, &room_id, room_name.as_deref(), &name, &passphrase_hash)
        .unwrap_or_else(|err| {
          debug!(peer = peer_id, room = %room_id, error = %err, "create rejected");
          vec![Delivery {
            to: peer_id.to_string(),
            event: RelayEvent::CreateError {
              code: err.code(),
              message: err.to_string(),
            },
          }]
        }),
      ClientEvent::JoinRoom {
        room_id,
        name,
        passphrase_hash,
      } => state
        .registry
        .join_room(peer_id, &room_id, &name, &passphrase_hash)
        .unwrap_or_else(|err| {
          debug!(peer = peer_id, room = %room_id, error = %err, "join rejected");
          vec![Delivery {
            to: peer_id.to_string(),
            event: RelayEvent::JoinError {
              code: err.code(),
              message: err.to_string(),
            },
          }]
        }),
      ClientEvent::LeaveRoom { room_id } => {
        if state.registry.room_of(peer_id) == Some(room_id.as_str()) {
          state.registry.leave_room(peer_id)
        } else {
          Vec::new()
        }
      }
      ClientEvent::KickUser { room_id, peer_id: target } => state.registry.kick(peer_id, &room_id, &target),
      ClientEvent::Signal { room_id, to, payload } => {
        if !state.connections.contains_key(&to) {
          debug!(from = peer_id, to = %to, "signal to disconnected peer dropped");
          return;
        }
        match state.registry.route_signal(peer_id, &room_id, &to, payload) {
          Some(delivery) => vec![delivery],
          None => {
            debug!(from = peer_id, to = %to, room = %room_id, "signal outside shared room dropped");
            return;
          }
        }
      }
    };
    state.dispatch(out);
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
    // A panic while holding the lock leaves plain data behind; keep serving.
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use meshlane_proto::AccessErrorCode;

  fn hash() -> String {
    "c".repeat(64)
  }

  fn drain(rx: &mut EventReceiver) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  fn create(hub: &SignalingHub, peer: &str, room: &str) {
    hub.handle(
      peer,
      ClientEvent::CreateRoom {
        room_id: room.into(),
        room_name: None,
        name: "Alice".into(),
        passphrase_hash: hash(),
      },
    );
  }

  fn join(hub: &SignalingHub, peer: &str, room: &str, name: &str) {
    hub.handle(
      peer,
      ClientEvent::JoinRoom {
        room_id: room.into(),
        name: name.into(),
        passphrase_hash: hash(),
      },
    );
  }

  #[test]
  fn access_errors_are_reported_to_the_caller_only() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    let (bob, mut bob_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    drain(&mut alice_rx);

    create(&hub, &bob, "lab42");
    let events = drain(&mut bob_rx);
    assert!(matches!(
      events.as_slice(),
      [RelayEvent::CreateError { code: AccessErrorCode::RoomExists, .. }]
    ));
    assert!(drain(&mut alice_rx).is_empty());
  }

  #[test]
  fn signal_is_forwarded_with_sender_tag() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    let (bob, _bob_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    join(&hub, &bob, "lab42", "Bob");
    drain(&mut alice_rx);

    let payload = serde_json::json!({"type": "answer", "sdp": "v=0"});
    hub.handle(
      &bob,
      ClientEvent::Signal {
        room_id: "lab42".into(),
        to: alice.clone(),
        payload: payload.clone(),
      },
    );
    assert_eq!(drain(&mut alice_rx), vec![RelayEvent::Signal { from: bob, payload }]);
  }

  #[test]
  fn spoofed_room_signal_is_dropped() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    let (eve, _eve_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    drain(&mut alice_rx);

    hub.handle(
      &eve,
      ClientEvent::Signal {
        room_id: "lab42".into(),
        to: alice,
        payload: serde_json::json!({}),
      },
    );
    assert!(drain(&mut alice_rx).is_empty());
  }

  #[test]
  fn disconnect_behaves_like_leave() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    let (bob, _bob_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    join(&hub, &bob, "lab42", "Bob");
    drain(&mut alice_rx);

    hub.disconnect(&bob);
    let events = drain(&mut alice_rx);
    assert!(matches!(&events[0], RelayEvent::PeerLeft { peer_id, name } if *peer_id == bob && name == "Bob"));
    assert_eq!(hub.stats(), HubStats { rooms: 1, connections: 1 });

    hub.disconnect(&alice);
    assert_eq!(hub.stats(), HubStats { rooms: 0, connections: 0 });
  }

  #[test]
  fn leave_for_a_different_room_is_ignored() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    drain(&mut alice_rx);

    hub.handle(&alice, ClientEvent::LeaveRoom { room_id: "elsewhere".into() });
    assert_eq!(hub.stats().rooms, 1);
    hub.handle(&alice, ClientEvent::LeaveRoom { room_id: "lab42".into() });
    assert_eq!(hub.stats().rooms, 0);
  }

  #[test]
  fn concurrent_joins_are_all_reflected() {
    let hub = std::sync::Arc::new(SignalingHub::new());
    let (alice, mut alice_rx) = hub.connect();
    create(&hub, &alice, "lab42");
    drain(&mut alice_rx);

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let hub = hub.clone();
        std::thread::spawn(move || {
          let (peer, rx) = hub.connect();
          join(&hub, &peer, "lab42", &format!("peer{i}"));
          (peer, rx)
        })
      })
      .collect();
    let mut joined = Vec::new();
    for handle in handles {
      joined.push(handle.join().unwrap());
    }

    let peer_joined = drain(&mut alice_rx)
      .into_iter()
      .filter(|event| matches!(event, RelayEvent::PeerJoined { .. }))
      .count();
    assert_eq!(peer_joined, 8);

    // Every newcomer either saw another newcomer in its roster or was told
    // about it afterwards: each pair is introduced exactly once.
    let mut introductions = 0;
    for (_, rx) in joined.iter_mut() {
      for event in drain(rx) {
        match event {
          RelayEvent::Peers { peers } => introductions += peers.len() - 1,
          RelayEvent::PeerJoined { .. } => introductions += 1,
          _ => {}
        }
      }
    }
    assert_eq!(introductions, 8 * 7);
  }

  #[test]
  fn stalled_client_is_disconnected() {
    let hub = SignalingHub::new();
    let (alice, mut alice_rx) = hub.connect();
    let (bob, _bob_rx) = hub.connect_with_capacity(4);
    create(&hub, &alice, "lab42");
    join(&hub, &bob, "lab42", "Bob");
    drain(&mut alice_rx);

    // Bob never reads. Join left three events in his queue, so the second
    // signal overflows it.
    for _ in 0..2 {
      hub.handle(
        &alice,
        ClientEvent::Signal {
          room_id: "lab42".into(),
          to: bob.clone(),
          payload: serde_json::json!({"type": "offer", "sdp": "v=0"}),
        },
      );
    }

    assert_eq!(hub.stats(), HubStats { rooms: 1, connections: 1 });
    let events = drain(&mut alice_rx);
    assert!(events
      .iter()
      .any(|event| matches!(event, RelayEvent::PeerLeft { peer_id, .. } if *peer_id == bob)));
  }
}

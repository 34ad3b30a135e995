//! One encrypted data channel per remote room member.
//!
//! Initiator role is fixed by arrival order: peers listed in the `peers`
//! roster (already present when we joined) get an offer from us; peers
//! announced later through `peer-joined` are expected to offer to us. Each
//! unordered pair therefore negotiates exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use meshlane_proto::{ClientEvent, IceCandidate, Payload, PeerInfo, SignalPayload};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecError};
use crate::transport::{Connector, LinkEvent, LinkEventSender, PeerTransport, Role, SdpKind, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
  Idle,
  Offering,
  AwaitingOffer,
  Negotiating,
  Connected,
  Closed,
}

#[derive(Debug, Error)]
pub enum MeshError {
  #[error("session is closed")]
  Closed,

  #[error(transparent)]
  Codec(#[from] CodecError),
}

/// What the session surfaces to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
  Payload { from: String, payload: Payload },
  LinkOpened { peer_id: String },
  LinkClosed { peer_id: String },
}

struct PeerLink {
  name: String,
  role: Role,
  state: LinkState,
  transport: Arc<dyn PeerTransport>,
  pending_candidates: Vec<IceCandidate>,
  remote_description_set: bool,
}

pub struct MeshSession {
  room_id: String,
  connector: Arc<dyn Connector>,
  codec: Option<Codec>,
  links: HashMap<String, PeerLink>,
  signal_tx: mpsc::UnboundedSender<ClientEvent>,
  link_tx: LinkEventSender,
}

impl MeshSession {
  pub fn new(
    room_id: impl Into<String>,
    codec: Codec,
    connector: Arc<dyn Connector>,
    signal_tx: mpsc::UnboundedSender<ClientEvent>,
    link_tx: LinkEventSender,
  ) -> Self {
    Self {
      room_id: room_id.into(),
      connector,
      codec: Some(codec),
      links: HashMap::new(),
      signal_tx,
      link_tx,
    }
  }

  pub fn is_closed(&self) -> bool {
    self.codec.is_none()
  }

  /// Number of links whose data channel is currently open.
  pub fn connected_count(&self) -> usize {
    self
      .links
      .values()
      .filter(|link| link.transport.is_channel_open())
      .count()
  }

  pub fn link_count(&self) -> usize {
    self.links.len()
  }

  pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
    self.links.get(peer_id).map(|link| link.state)
  }

  pub fn role_of(&self, peer_id: &str) -> Option<Role> {
    self.links.get(peer_id).map(|link| link.role)
  }

  pub fn peer_name(&self, peer_id: &str) -> Option<&str> {
    self.links.get(peer_id).map(|link| link.name.as_str())
  }

  /// Linked peers as `(peer id, name)`.
  pub fn peers(&self) -> Vec<(String, String)> {
    self
      .links
      .iter()
      .map(|(peer_id, link)| (peer_id.clone(), link.name.clone()))
      .collect()
  }

  /// We joined after these peers: offer to each of them.
  pub async fn connect_to_roster(&mut self, peers: Vec<PeerInfo>) {
    for peer in peers {
      if self.links.contains_key(&peer.peer_id) {
        debug!(peer = %peer.peer_id, "link already exists, roster entry skipped");
        continue;
      }
      if !self.open_link(&peer.peer_id, &peer.name, Role::Initiator).await {
        continue;
      }
      if let Err(err) = self.send_offer(&peer.peer_id).await {
        warn!(peer = %peer.peer_id, error = %err, "offer failed, abandoning link");
        self.teardown(&peer.peer_id).await;
      }
    }
  }

  /// A peer joined after us: wait for its offer.
  pub async fn on_peer_joined(&mut self, peer_id: &str, name: &str) {
    // An early offer may have created the link under the bare peer id.
    if let Some(link) = self.links.get_mut(peer_id) {
      if link.name != name {
        link.name = name.to_string();
      }
      return;
    }
    self.open_link(peer_id, name, Role::Responder).await;
  }

  pub async fn on_signal(&mut self, from: &str, payload: serde_json::Value) {
    if self.is_closed() {
      return;
    }
    let payload = match serde_json::from_value::<SignalPayload>(payload) {
      Ok(payload) => payload,
      Err(err) => {
        debug!(peer = from, error = %err, "malformed signal ignored");
        return;
      }
    };
    match payload {
      SignalPayload::Offer { sdp } => {
        if !self.links.contains_key(from) && !self.open_link(from, from, Role::Responder).await {
          return;
        }
        if let Err(err) = self.answer_offer(from, sdp).await {
          warn!(peer = from, error = %err, "could not answer offer, abandoning link");
          self.teardown(from).await;
        }
      }
      SignalPayload::Answer { sdp } => {
        if let Err(err) = self.accept_answer(from, sdp).await {
          warn!(peer = from, error = %err, "could not apply answer, abandoning link");
          self.teardown(from).await;
        }
      }
      SignalPayload::Candidate { candidate } => self.on_remote_candidate(from, candidate).await,
    }
  }

  pub async fn on_link_event(&mut self, peer_id: &str, event: LinkEvent) -> Option<MeshEvent> {
    let link = self.links.get_mut(peer_id)?;
    match event {
      LinkEvent::LocalCandidate(candidate) => {
        self.signal(peer_id, SignalPayload::Candidate { candidate });
        None
      }
      LinkEvent::ChannelOpen => {
        if link.state == LinkState::Connected {
          return None;
        }
        link.state = LinkState::Connected;
        info!(peer = peer_id, name = %link.name, "data channel open");
        Some(MeshEvent::LinkOpened {
          peer_id: peer_id.to_string(),
        })
      }
      LinkEvent::Message(frame) => {
        let codec = self.codec.as_ref()?;
        match codec.open(&frame) {
          Some(payload) => Some(MeshEvent::Payload {
            from: peer_id.to_string(),
            payload,
          }),
          None => {
            debug!(peer = peer_id, "undecryptable frame dropped");
            None
          }
        }
      }
      LinkEvent::ChannelClosed | LinkEvent::Failed(_) => {
        if let LinkEvent::Failed(reason) = &event {
          warn!(peer = peer_id, reason = %reason, "link failed");
        }
        self.teardown(peer_id).await.then(|| MeshEvent::LinkClosed {
          peer_id: peer_id.to_string(),
        })
      }
    }
  }

  /// Encrypts once and sends the frame on every open channel. Returns how
  /// many peers it was handed to.
  pub async fn broadcast(&self, payload: &Payload) -> Result<usize, MeshError> {
    let codec = self.codec.as_ref().ok_or(MeshError::Closed)?;
    let frame = codec.seal(payload)?;
    let targets: Vec<(String, Arc<dyn PeerTransport>)> = self
      .links
      .iter()
      .filter(|(_, link)| link.transport.is_channel_open())
      .map(|(peer_id, link)| (peer_id.clone(), link.transport.clone()))
      .collect();
    let mut delivered = 0;
    for (peer_id, transport) in targets {
      match transport.send_text(frame.clone()).await {
        Ok(()) => delivered += 1,
        Err(err) => warn!(peer = %peer_id, kind = payload.kind(), error = %err, "send failed"),
      }
    }
    Ok(delivered)
  }

  /// Peers whose data channel is currently open.
  pub fn open_peers(&self) -> Vec<String> {
    self
      .links
      .iter()
      .filter(|(_, link)| link.transport.is_channel_open())
      .map(|(peer_id, _)| peer_id.clone())
      .collect()
  }

  /// Sends one frame to each listed peer and returns the peers it did not
  /// reach. A peer without a link counts as not reached.
  pub async fn send_to(&self, peers: &[String], payload: &Payload) -> Result<Vec<String>, MeshError> {
    let codec = self.codec.as_ref().ok_or(MeshError::Closed)?;
    let frame = codec.seal(payload)?;
    let mut missed = Vec::new();
    for peer_id in peers {
      let Some(link) = self.links.get(peer_id) else {
        missed.push(peer_id.clone());
        continue;
      };
      if let Err(err) = link.transport.send_text(frame.clone()).await {
        warn!(peer = %peer_id, kind = payload.kind(), error = %err, "send failed");
        missed.push(peer_id.clone());
      }
    }
    Ok(missed)
  }

  /// Closes and forgets the link. Returns `false` if there was none.
  pub async fn teardown(&mut self, peer_id: &str) -> bool {
    let Some(mut link) = self.links.remove(peer_id) else {
      return false;
    };
    link.state = LinkState::Closed;
    link.transport.close().await;
    info!(peer = peer_id, name = %link.name, "link closed");
    true
  }

  /// Tears down every link and discards the room key. Nothing decrypts
  /// after this returns.
  pub async fn shutdown(&mut self) {
    self.codec = None;
    let peers: Vec<String> = self.links.keys().cloned().collect();
    for peer_id in peers {
      self.teardown(&peer_id).await;
    }
  }

  async fn open_link(&mut self, peer_id: &str, name: &str, role: Role) -> bool {
    if self.is_closed() {
      return false;
    }
    match self.connector.open(peer_id, role, self.link_tx.clone()).await {
      Ok(transport) => {
        let state = match role {
          Role::Initiator => LinkState::Idle,
          Role::Responder => LinkState::AwaitingOffer,
        };
        self.links.insert(
          peer_id.to_string(),
          PeerLink {
            name: name.to_string(),
            role,
            state,
            transport,
            pending_candidates: Vec::new(),
            remote_description_set: false,
          },
        );
        debug!(peer = peer_id, ?role, "link created");
        true
      }
      Err(err) => {
        warn!(peer = peer_id, error = %err, "could not create link");
        false
      }
    }
  }

  async fn send_offer(&mut self, peer_id: &str) -> Result<(), TransportError> {
    let transport = self.transport(peer_id)?;
    let sdp = transport.create_offer().await?;
    transport.set_local_description(SdpKind::Offer, sdp.clone()).await?;
    self.set_state(peer_id, LinkState::Offering);
    self.signal(peer_id, SignalPayload::Offer { sdp });
    Ok(())
  }

  async fn answer_offer(&mut self, peer_id: &str, sdp: String) -> Result<(), TransportError> {
    match self.links.get(peer_id) {
      Some(link) if link.role == Role::Responder && link.state == LinkState::AwaitingOffer => {}
      Some(link) => {
        warn!(peer = peer_id, role = ?link.role, state = ?link.state, "unexpected offer ignored");
        return Ok(());
      }
      None => return Ok(()),
    }
    let transport = self.transport(peer_id)?;
    transport.set_remote_description(SdpKind::Offer, sdp).await?;
    self.remote_description_applied(peer_id).await;
    let answer = transport.create_answer().await?;
    transport.set_local_description(SdpKind::Answer, answer.clone()).await?;
    self.set_state(peer_id, LinkState::Negotiating);
    self.signal(peer_id, SignalPayload::Answer { sdp: answer });
    Ok(())
  }

  async fn accept_answer(&mut self, peer_id: &str, sdp: String) -> Result<(), TransportError> {
    match self.links.get(peer_id) {
      Some(link) if link.role == Role::Initiator && link.state == LinkState::Offering => {}
      Some(link) => {
        warn!(peer = peer_id, role = ?link.role, state = ?link.state, "unexpected answer ignored");
        return Ok(());
      }
      None => {
        debug!(peer = peer_id, "answer for unknown link ignored");
        return Ok(());
      }
    }
    let transport = self.transport(peer_id)?;
    transport.set_remote_description(SdpKind::Answer, sdp).await?;
    self.set_state(peer_id, LinkState::Negotiating);
    self.remote_description_applied(peer_id).await;
    Ok(())
  }

  async fn on_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
    let Some(link) = self.links.get_mut(peer_id) else {
      debug!(peer = peer_id, "candidate for unknown link ignored");
      return;
    };
    if !link.remote_description_set {
      link.pending_candidates.push(candidate);
      return;
    }
    let transport = link.transport.clone();
    if let Err(err) = transport.add_ice_candidate(candidate).await {
      warn!(peer = peer_id, error = %err, "remote candidate rejected");
    }
  }

  // Replays candidates that arrived before the remote description.
  async fn remote_description_applied(&mut self, peer_id: &str) {
    let Some(link) = self.links.get_mut(peer_id) else {
      return;
    };
    link.remote_description_set = true;
    let pending = std::mem::take(&mut link.pending_candidates);
    let transport = link.transport.clone();
    for candidate in pending {
      if let Err(err) = transport.add_ice_candidate(candidate).await {
        warn!(peer = peer_id, error = %err, "queued candidate rejected");
      }
    }
  }

  fn transport(&self, peer_id: &str) -> Result<Arc<dyn PeerTransport>, TransportError> {
    self
      .links
      .get(peer_id)
      .map(|link| link.transport.clone())
      .ok_or_else(|| TransportError::Negotiation(format!("no link for {peer_id}")))
  }

  fn set_state(&mut self, peer_id: &str, state: LinkState) {
    if let Some(link) = self.links.get_mut(peer_id) {
      // The channel may have opened while negotiation was still settling.
      if link.state != LinkState::Connected {
        link.state = state;
      }
    }
  }

  fn signal(&self, peer_id: &str, payload: SignalPayload) {
    let payload = match serde_json::to_value(&payload) {
      Ok(value) => value,
      Err(err) => {
        warn!(peer = peer_id, error = %err, "could not encode signal");
        return;
      }
    };
    let _ = self.signal_tx.send(ClientEvent::Signal {
      room_id: self.room_id.clone(),
      to: peer_id.to_string(),
      payload,
    });
  }
}

//! In-memory transport for exercising the mesh session without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meshlane_proto::IceCandidate;

use super::{Connector, LinkEvent, LinkEventSender, PeerTransport, Role, SdpKind, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  CreateOffer,
  CreateAnswer,
  SetLocal(SdpKind, String),
  SetRemote(SdpKind, String),
  AddCandidate(String),
  Close,
}

#[derive(Debug)]
pub struct MockLink {
  pub role: Role,
  peer_id: String,
  events: LinkEventSender,
  calls: Mutex<Vec<Call>>,
  sent: Mutex<Vec<String>>,
  open: AtomicBool,
  reject_candidates: AtomicBool,
  reject_remote: AtomicBool,
  reject_sends: AtomicBool,
  send_delay_ms: AtomicU64,
  attempts: AtomicUsize,
}

impl MockLink {
  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn sent(&self) -> Vec<String> {
    self.sent.lock().unwrap().clone()
  }

  pub fn closed(&self) -> bool {
    self.calls().contains(&Call::Close)
  }

  /// Marks the channel open and reports it the way a real transport would.
  pub fn open_channel(&self) {
    self.open.store(true, Ordering::SeqCst);
    let _ = self.events.send((self.peer_id.clone(), LinkEvent::ChannelOpen));
  }

  pub fn emit(&self, event: LinkEvent) {
    let _ = self.events.send((self.peer_id.clone(), event));
  }

  pub fn reject_candidates(&self) {
    self.reject_candidates.store(true, Ordering::SeqCst);
  }

  pub fn reject_remote_descriptions(&self) {
    self.reject_remote.store(true, Ordering::SeqCst);
  }

  pub fn reject_sends(&self) {
    self.reject_sends.store(true, Ordering::SeqCst);
  }

  /// Makes every send take this long, like a congested channel.
  pub fn delay_sends(&self, delay: Duration) {
    self.send_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  /// Sends tried on this link, failed ones included.
  pub fn attempts(&self) -> usize {
    self.attempts.load(Ordering::SeqCst)
  }

  fn record(&self, call: Call) {
    self.calls.lock().unwrap().push(call);
  }
}

#[async_trait]
impl PeerTransport for MockLink {
  async fn create_offer(&self) -> Result<String, TransportError> {
    self.record(Call::CreateOffer);
    Ok(format!("offer-for-{}", self.peer_id))
  }

  async fn create_answer(&self) -> Result<String, TransportError> {
    self.record(Call::CreateAnswer);
    Ok(format!("answer-for-{}", self.peer_id))
  }

  async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError> {
    self.record(Call::SetLocal(kind, sdp));
    Ok(())
  }

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError> {
    if self.reject_remote.load(Ordering::SeqCst) {
      return Err(TransportError::Negotiation("malformed sdp".into()));
    }
    self.record(Call::SetRemote(kind, sdp));
    Ok(())
  }

  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
    if self.reject_candidates.load(Ordering::SeqCst) {
      return Err(TransportError::Candidate("rejected".into()));
    }
    self.record(Call::AddCandidate(candidate.candidate));
    Ok(())
  }

  async fn send_text(&self, text: String) -> Result<(), TransportError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    let delay = self.send_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if !self.is_channel_open() {
      return Err(TransportError::ChannelNotOpen);
    }
    if self.reject_sends.load(Ordering::SeqCst) {
      return Err(TransportError::Send("outgoing message too large".into()));
    }
    self.sent.lock().unwrap().push(text);
    Ok(())
  }

  fn is_channel_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  async fn close(&self) {
    self.open.store(false, Ordering::SeqCst);
    self.record(Call::Close);
  }
}

#[derive(Debug, Default, Clone)]
pub struct MockConnector {
  links: Arc<Mutex<HashMap<String, Arc<MockLink>>>>,
  fail_open: Arc<AtomicBool>,
}

impl MockConnector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn link(&self, peer_id: &str) -> Option<Arc<MockLink>> {
    self.links.lock().unwrap().get(peer_id).cloned()
  }

  pub fn links(&self) -> Vec<Arc<MockLink>> {
    self.links.lock().unwrap().values().cloned().collect()
  }

  pub fn opened(&self) -> usize {
    self.links.lock().unwrap().len()
  }

  pub fn fail_open(&self) {
    self.fail_open.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl Connector for MockConnector {
  async fn open(
    &self,
    peer_id: &str,
    role: Role,
    events: LinkEventSender,
  ) -> Result<Arc<dyn PeerTransport>, TransportError> {
    if self.fail_open.load(Ordering::SeqCst) {
      return Err(TransportError::Setup("no transport".into()));
    }
    let link = Arc::new(MockLink {
      role,
      peer_id: peer_id.to_string(),
      events,
      calls: Mutex::new(Vec::new()),
      sent: Mutex::new(Vec::new()),
      open: AtomicBool::new(false),
      reject_candidates: AtomicBool::new(false),
      reject_remote: AtomicBool::new(false),
      reject_sends: AtomicBool::new(false),
      send_delay_ms: AtomicU64::new(0),
      attempts: AtomicUsize::new(0),
    });
    self.links.lock().unwrap().insert(peer_id.to_string(), link.clone());
    Ok(link)
  }
}

//! Peer transport seam used by the mesh session.
//!
//! A [`Connector`] opens one [`PeerTransport`] per remote peer. Asynchronous
//! happenings on a transport (local candidates, channel open/close, inbound
//! frames) are reported as [`LinkEvent`]s on a channel owned by the session,
//! so all link state is mutated from the session's own task.

#[cfg(test)]
pub mod mock;
mod rtc;

pub use self::rtc::WebRtcConnector;

use std::sync::Arc;

use async_trait::async_trait;
use meshlane_proto::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Opens the data channel and sends the offer.
  Initiator,
  /// Waits for the offer and receives the data channel.
  Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
  Offer,
  Answer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
  LocalCandidate(IceCandidate),
  ChannelOpen,
  Message(String),
  ChannelClosed,
  Failed(String),
}

pub type LinkEventSender = mpsc::UnboundedSender<(String, LinkEvent)>;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("transport setup failed: {0}")]
  Setup(String),

  #[error("negotiation failed: {0}")]
  Negotiation(String),

  #[error("candidate rejected: {0}")]
  Candidate(String),

  #[error("data channel is not open")]
  ChannelNotOpen,

  #[error("send failed: {0}")]
  Send(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
  async fn create_offer(&self) -> Result<String, TransportError>;

  async fn create_answer(&self) -> Result<String, TransportError>;

  async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError>;

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError>;

  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

  /// Queues one text frame on the data channel.
  async fn send_text(&self, text: String) -> Result<(), TransportError>;

  fn is_channel_open(&self) -> bool;

  /// Releases the connection and its channel. Safe to call more than once.
  async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
  async fn open(
    &self,
    peer_id: &str,
    role: Role,
    events: LinkEventSender,
  ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

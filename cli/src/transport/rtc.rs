use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use meshlane_proto::IceCandidate;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Connector, LinkEvent, LinkEventSender, PeerTransport, Role, SdpKind, TransportError};

const CHANNEL_LABEL: &str = "chat";
const BUFFERED_HIGH_WATER: usize = 1024 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_MAX_POLLS: usize = 500;

pub struct WebRtcConnector {
  ice_servers: Vec<String>,
}

impl WebRtcConnector {
  pub fn new(ice_servers: Vec<String>) -> Self {
    Self { ice_servers }
  }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

struct WebRtcLink {
  pc: Arc<RTCPeerConnection>,
  channel: ChannelSlot,
}

#[async_trait]
impl Connector for WebRtcConnector {
  async fn open(
    &self,
    peer_id: &str,
    role: Role,
    events: LinkEventSender,
  ) -> Result<Arc<dyn PeerTransport>, TransportError> {
    let pc = create_peer_connection(&self.ice_servers)
      .await
      .map_err(|err| TransportError::Setup(err.to_string()))?;
    let channel: ChannelSlot = Arc::new(Mutex::new(None));

    let tx = events.clone();
    let ice_peer = peer_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate| {
      let tx = tx.clone();
      let peer_id = ice_peer.clone();
      Box::pin(async move {
        let Some(candidate) = candidate else {
          return;
        };
        match candidate.to_json() {
          Ok(init) => {
            let _ = tx.send((peer_id, LinkEvent::LocalCandidate(from_rtc_candidate(init))));
          }
          Err(err) => debug!(peer = %peer_id, error = %err, "unserializable local candidate"),
        }
      })
    }));

    let tx = events.clone();
    let state_peer = peer_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
      let tx = tx.clone();
      let peer_id = state_peer.clone();
      Box::pin(async move {
        debug!(peer = %peer_id, ?state, "connection state");
        if state == RTCPeerConnectionState::Failed {
          let _ = tx.send((peer_id, LinkEvent::Failed("peer connection failed".into())));
        }
      })
    }));

    match role {
      Role::Initiator => {
        let dc = pc
          .create_data_channel(
            CHANNEL_LABEL,
            Some(RTCDataChannelInit {
              ordered: Some(true),
              ..Default::default()
            }),
          )
          .await
          .map_err(|err| TransportError::Setup(err.to_string()))?;
        wire_channel(dc, peer_id.to_string(), events, channel.clone()).await;
      }
      Role::Responder => {
        let slot = channel.clone();
        let dc_peer = peer_id.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
          let slot = slot.clone();
          let events = events.clone();
          let peer_id = dc_peer.clone();
          Box::pin(async move {
            debug!(peer = %peer_id, label = dc.label(), "data channel received");
            wire_channel(dc, peer_id, events, slot).await;
          })
        }));
      }
    }

    Ok(Arc::new(WebRtcLink { pc, channel }))
  }
}

async fn wire_channel(dc: Arc<RTCDataChannel>, peer_id: String, events: LinkEventSender, slot: ChannelSlot) {
  if let Ok(mut guard) = slot.lock() {
    *guard = Some(dc.clone());
  }

  let tx = events.clone();
  let open_peer = peer_id.clone();
  dc.on_open(Box::new(move || {
    Box::pin(async move {
      let _ = tx.send((open_peer, LinkEvent::ChannelOpen));
    })
  }));

  let tx = events.clone();
  let close_peer = peer_id.clone();
  dc.on_close(Box::new(move || {
    let tx = tx.clone();
    let peer_id = close_peer.clone();
    Box::pin(async move {
      let _ = tx.send((peer_id, LinkEvent::ChannelClosed));
    })
  }));

  let tx = events.clone();
  let message_peer = peer_id.clone();
  dc.on_message(Box::new(move |msg: DataChannelMessage| {
    let tx = tx.clone();
    let peer_id = message_peer.clone();
    Box::pin(async move {
      if !msg.is_string {
        debug!(peer = %peer_id, "binary frame ignored");
        return;
      }
      match String::from_utf8(msg.data.to_vec()) {
        Ok(text) => {
          let _ = tx.send((peer_id, LinkEvent::Message(text)));
        }
        Err(_) => debug!(peer = %peer_id, "non-utf8 text frame ignored"),
      }
    })
  }));

  // A channel surfaced by the remote side may already be open.
  if dc.ready_state() == RTCDataChannelState::Open {
    let _ = events.send((peer_id, LinkEvent::ChannelOpen));
  }
}

#[async_trait]
impl PeerTransport for WebRtcLink {
  async fn create_offer(&self) -> Result<String, TransportError> {
    let offer = self
      .pc
      .create_offer(None)
      .await
      .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    Ok(offer.sdp)
  }

  async fn create_answer(&self) -> Result<String, TransportError> {
    let answer = self
      .pc
      .create_answer(None)
      .await
      .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    Ok(answer.sdp)
  }

  async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError> {
    let desc = to_rtc_description(kind, sdp)?;
    self
      .pc
      .set_local_description(desc)
      .await
      .map_err(|err| TransportError::Negotiation(err.to_string()))
  }

  async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), TransportError> {
    let desc = to_rtc_description(kind, sdp)?;
    self
      .pc
      .set_remote_description(desc)
      .await
      .map_err(|err| TransportError::Negotiation(err.to_string()))
  }

  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
    self
      .pc
      .add_ice_candidate(to_rtc_candidate(candidate))
      .await
      .map_err(|err| TransportError::Candidate(err.to_string()))
  }

  async fn send_text(&self, text: String) -> Result<(), TransportError> {
    let dc = self.open_channel().ok_or(TransportError::ChannelNotOpen)?;
    wait_for_drain(&dc).await;
    dc.send_text(text)
      .await
      .map(|_| ())
      .map_err(|err| TransportError::Send(err.to_string()))
  }

  fn is_channel_open(&self) -> bool {
    self.open_channel().is_some()
  }

  async fn close(&self) {
    let dc = self.channel.lock().ok().and_then(|mut guard| guard.take());
    if let Some(dc) = dc {
      if let Err(err) = dc.close().await {
        debug!(error = %err, "data channel close failed");
      }
    }
    if let Err(err) = self.pc.close().await {
      warn!(error = %err, "peer connection close failed");
    }
  }
}

impl WebRtcLink {
  fn open_channel(&self) -> Option<Arc<RTCDataChannel>> {
    let guard = self.channel.lock().ok()?;
    guard
      .as_ref()
      .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
      .cloned()
  }
}

// Holds back further sends while the channel has a large backlog queued.
async fn wait_for_drain(dc: &RTCDataChannel) {
  for _ in 0..DRAIN_MAX_POLLS {
    if dc.ready_state() != RTCDataChannelState::Open {
      break;
    }
    if dc.buffered_amount().await < BUFFERED_HIGH_WATER {
      break;
    }
    sleep(DRAIN_POLL).await;
  }
}

async fn create_peer_connection(ice_servers: &[String]) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
  let mut media_engine = MediaEngine::default();
  media_engine.register_default_codecs()?;

  let mut registry = Registry::new();
  registry = register_default_interceptors(registry, &mut media_engine)?;

  let api = APIBuilder::new()
    .with_media_engine(media_engine)
    .with_interceptor_registry(registry)
    .build();

  let config = RTCConfiguration {
    ice_servers: if ice_servers.is_empty() {
      Vec::new()
    } else {
      vec![RTCIceServer {
        urls: ice_servers.to_vec(),
        ..Default::default()
      }]
    },
    ..Default::default()
  };

  let pc = api.new_peer_connection(config).await?;
  Ok(Arc::new(pc))
}

fn to_rtc_description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, TransportError> {
  let desc = match kind {
    SdpKind::Offer => RTCSessionDescription::offer(sdp),
    SdpKind::Answer => RTCSessionDescription::answer(sdp),
  };
  desc.map_err(|err| TransportError::Negotiation(err.to_string()))
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
  RTCIceCandidateInit {
    candidate: candidate.candidate,
    sdp_mid: candidate.sdp_mid,
    sdp_mline_index: candidate.sdp_mline_index,
    username_fragment: candidate.username_fragment,
  }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
  IceCandidate {
    candidate: init.candidate,
    sdp_mid: init.sdp_mid,
    sdp_mline_index: init.sdp_mline_index,
    username_fragment: init.username_fragment,
  }
}

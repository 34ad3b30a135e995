//! One participant's lifetime in a room: the signaling connection, the mesh
//! built on top of it, incoming transfers and the user's commands.
//!
//! A lost signaling connection is re-established from scratch under the
//! configured [`ReconnectPolicy`]; nothing from the previous attempt (links,
//! key, partial transfers) survives into the next one.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use futures_util::{SinkExt, StreamExt};
use meshlane_proto::{AccessErrorCode, ClientEvent, Payload, RelayEvent, UserEntry};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::codec::{passphrase_hash, Codec};
use crate::config::{Intent, ReconnectPolicy, SessionConfig};
use crate::console::{log_line, UserCommand, HELP};
use crate::files::{load_file_info, save_received};
use crate::mesh::{MeshEvent, MeshSession};
use crate::outbound::{OutboundTransfer, Progress};
use crate::transfer::TransferInbox;
use crate::transport::Connector;

const WRITER_FLUSH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
  Left,
  Kicked(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
  #[error("{message}")]
  Denied { code: AccessErrorCode, message: String },

  #[error("signaling connection lost, gave up after {0} reconnect attempts")]
  ReconnectExhausted(u32),

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Debug)]
enum Outcome {
  Left,
  Kicked(String),
  Denied { code: AccessErrorCode, message: String },
  Lost { joined: bool },
}

#[derive(Debug)]
enum Step {
  Finish(SessionEnd),
  Retry { intent: Intent, delay: Duration },
  Fail(SessionError),
}

struct Reconnector {
  policy: ReconnectPolicy,
  room_name: Option<String>,
  attempt: u32,
  ever_joined: bool,
}

impl Reconnector {
  fn new(policy: ReconnectPolicy, intent: &Intent) -> Self {
    let room_name = match intent {
      Intent::Create { room_name } => room_name.clone(),
      Intent::Join => None,
    };
    Self {
      policy,
      room_name,
      attempt: 0,
      ever_joined: false,
    }
  }

  fn after(&mut self, intent: &Intent, outcome: Outcome) -> Step {
    match outcome {
      Outcome::Left => Step::Finish(SessionEnd::Left),
      Outcome::Kicked(message) => Step::Finish(SessionEnd::Kicked(message)),
      Outcome::Denied { code, message } => {
        if self.ever_joined {
          match (code, intent) {
            // The room emptied while we were away: bring it back.
            (AccessErrorCode::RoomNotFound, Intent::Join) => {
              return Step::Retry {
                intent: Intent::Create {
                  room_name: self.room_name.clone(),
                },
                delay: Duration::ZERO,
              };
            }
            (AccessErrorCode::RoomExists, Intent::Create { .. }) => return self.retry(),
            _ => {}
          }
        }
        Step::Fail(SessionError::Denied { code, message })
      }
      Outcome::Lost { joined } => {
        if joined {
          self.ever_joined = true;
          self.attempt = 0;
        }
        if !self.ever_joined {
          return Step::Fail(anyhow!("signaling connection closed before the room was joined").into());
        }
        self.retry()
      }
    }
  }

  fn failed(&mut self, err: anyhow::Error) -> Step {
    if !self.ever_joined {
      return Step::Fail(err.into());
    }
    warn!(error = %format!("{err:#}"), attempt = self.attempt, "reconnect attempt failed");
    self.retry()
  }

  fn retry(&mut self) -> Step {
    self.attempt += 1;
    match self.policy.delay_for(self.attempt) {
      Some(delay) => Step::Retry {
        intent: Intent::Join,
        delay,
      },
      None => Step::Fail(SessionError::ReconnectExhausted(self.policy.max_attempts)),
    }
  }
}

/// Runs until the user leaves, is kicked, is refused, or the reconnect
/// budget runs out. Closing `commands` counts as leaving.
pub async fn run(
  config: SessionConfig,
  connector: Arc<dyn Connector>,
  mut commands: mpsc::UnboundedReceiver<UserCommand>,
) -> Result<SessionEnd, SessionError> {
  let mut reconnector = Reconnector::new(config.reconnect, &config.intent);
  let mut intent = config.intent.clone();
  loop {
    let step = match run_once(&config, &intent, connector.clone(), &mut commands).await {
      Ok(outcome) => reconnector.after(&intent, outcome),
      Err(err) => reconnector.failed(err),
    };
    let (next, delay) = match step {
      Step::Finish(end) => return Ok(end),
      Step::Fail(err) => return Err(err),
      Step::Retry { intent, delay } => (intent, delay),
    };
    if let Intent::Create { .. } = next {
      log_line("[room] recreating", &config.room_id);
    } else {
      log_line(
        "[ws] reconnecting",
        format!(
          "attempt {}/{} in {} ms",
          reconnector.attempt,
          config.reconnect.max_attempts,
          delay.as_millis()
        ),
      );
    }
    intent = next;

    let wait = sleep(delay);
    tokio::pin!(wait);
    loop {
      tokio::select! {
        _ = &mut wait => break,
        command = commands.recv() => match command {
          None | Some(UserCommand::Leave) => return Ok(SessionEnd::Left),
          Some(_) => log_line("[ws] offline", "command dropped while reconnecting"),
        },
      }
    }
  }
}

async fn run_once(
  config: &SessionConfig,
  intent: &Intent,
  connector: Arc<dyn Connector>,
  commands: &mut mpsc::UnboundedReceiver<UserCommand>,
) -> anyhow::Result<Outcome> {
  let codec = Codec::from_passphrase(config.passphrase.clone())
    .await
    .context("derive room key")?;
  let gate = passphrase_hash(&config.passphrase);
  let ws_url = config.ws_url()?;

  log_line("[ws] connecting", &ws_url);
  let (ws_stream, _) = connect_async(ws_url.as_str())
    .await
    .context("connect signaling websocket")?;
  let (mut ws_write, mut ws_read) = ws_stream.split();

  let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientEvent>();
  let writer = tokio::spawn(async move {
    while let Some(msg) = signal_rx.recv().await {
      let text = serde_json::to_string(&msg)?;
      ws_write.send(Message::Text(text)).await?;
    }
    ws_write.close().await?;
    Ok::<(), anyhow::Error>(())
  });

  let request = match intent {
    Intent::Create { room_name } => ClientEvent::CreateRoom {
      room_id: config.room_id.clone(),
      room_name: room_name.clone(),
      name: config.name.clone(),
      passphrase_hash: gate,
    },
    Intent::Join => ClientEvent::JoinRoom {
      room_id: config.room_id.clone(),
      name: config.name.clone(),
      passphrase_hash: gate,
    },
  };
  signal_tx
    .send(request)
    .map_err(|_| anyhow!("signaling writer stopped"))?;

  let (link_tx, mut link_rx) = mpsc::unbounded_channel();
  let mut session = Session {
    config,
    mesh: MeshSession::new(config.room_id.clone(), codec, connector, signal_tx.clone(), link_tx),
    inbox: TransferInbox::new(config.max_file_size),
    users: Vec::new(),
    my_id: None,
    signal_tx,
    outbound: None,
  };

  let mut eviction = interval(eviction_period(config.transfer_timeout));
  eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);

  let outcome = loop {
    tokio::select! {
      msg = ws_read.next() => {
        let text = match msg {
          Some(Ok(Message::Text(text))) => text,
          Some(Ok(Message::Close(frame))) => {
            debug!(?frame, "relay closed the connection");
            break Outcome::Lost { joined: session.joined() };
          }
          Some(Ok(_)) => continue,
          Some(Err(err)) => {
            warn!(error = %err, "signaling read failed");
            break Outcome::Lost { joined: session.joined() };
          }
          None => break Outcome::Lost { joined: session.joined() },
        };
        let event = match serde_json::from_str::<RelayEvent>(&text) {
          Ok(event) => event,
          Err(err) => {
            debug!(error = %err, "unrecognized relay message");
            continue;
          }
        };
        if let Some(outcome) = session.on_relay_event(event).await {
          break outcome;
        }
      }
      Some((peer_id, event)) = link_rx.recv() => {
        if let Some(event) = session.mesh.on_link_event(&peer_id, event).await {
          session.on_mesh_event(event).await;
        }
      }
      command = commands.recv() => {
        let Some(command) = command else {
          session.leave().await;
          break Outcome::Left;
        };
        if let Some(outcome) = session.on_command(command).await {
          break outcome;
        }
      }
      _ = eviction.tick(), if config.transfer_timeout.is_some() => session.evict_stale(),
      _ = tokio::task::yield_now(), if session.outbound.is_some() => session.send_next_chunk().await,
    }
  };

  if let Some(transfer) = session.outbound.take() {
    log_line("[send] cancelled", transfer.name());
  }
  session.mesh.shutdown().await;
  session.inbox.clear();
  drop(session);
  if let Outcome::Lost { .. } = outcome {
    writer.abort();
  } else if timeout(WRITER_FLUSH, writer).await.is_err() {
    debug!("signaling writer did not flush in time");
  }
  Ok(outcome)
}

fn eviction_period(transfer_timeout: Option<Duration>) -> Duration {
  transfer_timeout
    .map(|max_idle| (max_idle / 2).max(Duration::from_secs(1)))
    .unwrap_or(Duration::from_secs(60))
}

/// Picks the peer id for `/kick <target>`: an exact peer id, otherwise a
/// unique case-insensitive name.
fn resolve_member(members: &[(String, String)], target: &str) -> Result<String, String> {
  if let Some((peer_id, _)) = members.iter().find(|(peer_id, _)| peer_id == target) {
    return Ok(peer_id.clone());
  }
  let matches: Vec<&String> = members
    .iter()
    .filter(|(_, name)| name.eq_ignore_ascii_case(target))
    .map(|(peer_id, _)| peer_id)
    .collect();
  match matches.as_slice() {
    [peer_id] => Ok((*peer_id).clone()),
    [] => Err(format!("no member named {target}")),
    _ => Err(format!("{target} is ambiguous, use the peer id")),
  }
}

struct Session<'a> {
  config: &'a SessionConfig,
  mesh: MeshSession,
  inbox: TransferInbox,
  users: Vec<UserEntry>,
  my_id: Option<String>,
  signal_tx: mpsc::UnboundedSender<ClientEvent>,
  outbound: Option<OutboundTransfer>,
}

impl Session<'_> {
  fn joined(&self) -> bool {
    self.my_id.is_some()
  }

  fn is_me(&self, peer_id: &str) -> bool {
    self.my_id.as_deref() == Some(peer_id)
  }

  fn is_host(&self) -> bool {
    self
      .users
      .iter()
      .any(|user| user.is_host && self.is_me(&user.peer_id))
  }

  fn display_name(&self, peer_id: &str) -> String {
    self
      .users
      .iter()
      .find(|user| user.peer_id == peer_id)
      .map(|user| user.name.clone())
      .or_else(|| self.mesh.peer_name(peer_id).map(str::to_string))
      .unwrap_or_else(|| peer_id.to_string())
  }

  async fn on_relay_event(&mut self, event: RelayEvent) -> Option<Outcome> {
    match event {
      RelayEvent::YourId { peer_id, room_name } => {
        log_line("[room] joined", format!("{room_name} ({})", self.config.room_id));
        info!(peer = %peer_id, room = %self.config.room_id, "joined room");
        self.my_id = Some(peer_id);
      }
      RelayEvent::Peers { peers } => {
        log_line("[room] peers", peers.len());
        self.mesh.connect_to_roster(peers).await;
      }
      RelayEvent::UserList { users } => {
        let names: Vec<String> = users
          .iter()
          .map(|user| {
            if user.is_host {
              format!("{} (host)", user.name)
            } else {
              user.name.clone()
            }
          })
          .collect();
        log_line("[room] members", names.join(", "));
        self.users = users;
      }
      RelayEvent::PeerJoined { peer_id, name } => {
        log_line("[peer] joined", &name);
        self.mesh.on_peer_joined(&peer_id, &name).await;
      }
      RelayEvent::PeerLeft { peer_id, name } => {
        log_line("[peer] left", &name);
        self.mesh.teardown(&peer_id).await;
      }
      RelayEvent::Signal { from, payload } => self.mesh.on_signal(&from, payload).await,
      RelayEvent::CreateError { code, message } | RelayEvent::JoinError { code, message } => {
        log_line("[room] rejected", &message);
        return Some(Outcome::Denied { code, message });
      }
      RelayEvent::Kicked { message } => {
        log_line("[room] kicked", &message);
        return Some(Outcome::Kicked(message));
      }
    }
    None
  }

  async fn on_mesh_event(&mut self, event: MeshEvent) {
    match event {
      MeshEvent::LinkOpened { peer_id } => log_line(
        "[peer] connected",
        format!("{} ({} open)", self.display_name(&peer_id), self.mesh.connected_count()),
      ),
      MeshEvent::LinkClosed { peer_id } => log_line("[peer] disconnected", self.display_name(&peer_id)),
      MeshEvent::Payload { from, payload } => self.on_payload(&from, payload).await,
    }
  }

  async fn on_payload(&mut self, from: &str, payload: Payload) {
    let sender = self.display_name(from);
    match payload {
      Payload::Text { text } => log_line(&format!("[{sender}]"), text),
      Payload::System { text } => log_line("[system]", format!("{sender}: {text}")),
      payload => {
        if let Payload::FileMeta { name, size, .. } = &payload {
          log_line("[file] incoming", format!("{name} ({size} bytes) from {sender}"));
        }
        let Some(file) = self.inbox.handle(from, payload) else {
          return;
        };
        match save_received(&self.config.output_dir, &file).await {
          Ok(path) => log_line(
            "[file] saved",
            format!("{} ({} bytes) from {sender}", path.display(), file.data.len()),
          ),
          Err(err) => log_line("[file] save failed", format!("{err:#}")),
        }
      }
    }
  }

  async fn on_command(&mut self, command: UserCommand) -> Option<Outcome> {
    match command {
      UserCommand::Leave => {
        self.leave().await;
        return Some(Outcome::Left);
      }
      UserCommand::Help => log_line("[help]", HELP),
      UserCommand::Who => self.print_roster(),
      UserCommand::Kick(target) => self.kick(&target),
      UserCommand::Text(text) => match self.mesh.broadcast(&Payload::Text { text }).await {
        Ok(0) => log_line("[chat] not sent", "no connected peers"),
        Ok(peers) => debug!(peers, "text sent"),
        Err(err) => log_line("[chat] failed", err),
      },
      UserCommand::SendFile(path) => {
        if let Err(err) = self.send_file(&path).await {
          log_line("[send] failed", format!("{err:#}"));
        }
      }
    }
    None
  }

  /// Tells the open channels we are going, then leaves through the relay.
  async fn leave(&self) {
    let notice = Payload::System {
      text: format!("{} left the room", self.config.name),
    };
    if let Err(err) = self.mesh.broadcast(&notice).await {
      debug!(error = %err, "departure notice not sent");
    }
    let _ = self.signal_tx.send(ClientEvent::LeaveRoom {
      room_id: self.config.room_id.clone(),
    });
  }

  fn kick(&self, target: &str) {
    if !self.is_host() {
      log_line("[kick] refused", "only the host can remove members");
      return;
    }
    let mut members: Vec<(String, String)> = self
      .users
      .iter()
      .map(|user| (user.peer_id.clone(), user.name.clone()))
      .collect();
    for (peer_id, name) in self.mesh.peers() {
      if !members.iter().any(|(known, _)| *known == peer_id) {
        members.push((peer_id, name));
      }
    }
    match resolve_member(&members, target) {
      Ok(peer_id) if self.is_me(&peer_id) => log_line("[kick] refused", "cannot kick yourself"),
      Ok(peer_id) => {
        log_line("[kick] removing", self.display_name(&peer_id));
        let _ = self.signal_tx.send(ClientEvent::KickUser {
          room_id: self.config.room_id.clone(),
          peer_id,
        });
      }
      Err(reason) => log_line("[kick] refused", reason),
    }
  }

  fn print_roster(&self) {
    for user in &self.users {
      let mut tags = Vec::new();
      if user.is_host {
        tags.push("host".to_string());
      }
      if self.is_me(&user.peer_id) {
        tags.push("you".to_string());
      } else {
        match self.mesh.link_state(&user.peer_id) {
          Some(state) => tags.push(format!("{state:?}").to_lowercase()),
          None => tags.push("no link".to_string()),
        }
      }
      log_line("[who]", format!("{} [{}] {}", user.name, tags.join(", "), user.peer_id));
    }
    log_line(
      "[who] connected",
      format!("{}/{}", self.mesh.connected_count(), self.users.len().saturating_sub(1)),
    );
  }

  async fn send_file(&mut self, path: &Path) -> anyhow::Result<()> {
    if let Some(current) = &self.outbound {
      log_line("[send] busy", format!("{} is still being sent", current.name()));
      return Ok(());
    }
    let info = load_file_info(path).await?;
    let name = info.name.clone();
    match OutboundTransfer::start(&self.mesh, info, self.config.chunk_size).await? {
      Some(transfer) => {
        log_line(
          "[send] start",
          format!("{name} ({} bytes, {} chunks)", transfer.size(), transfer.total_chunks()),
        );
        self.outbound = Some(transfer);
        self.report_dropped();
      }
      None => log_line("[send] skipped", "no connected peers"),
    }
    Ok(())
  }

  async fn send_next_chunk(&mut self) {
    let Some(transfer) = self.outbound.as_mut() else {
      return;
    };
    let progress = transfer.step(&self.mesh).await;
    self.report_dropped();
    if matches!(progress, Ok(Progress::Sent)) {
      return;
    }
    let Some(transfer) = self.outbound.take() else {
      return;
    };
    match progress {
      Ok(Progress::Done { delivered }) => log_line(
        "[send] done",
        format!(
          "{} to {delivered} peer(s) in {} ms",
          transfer.name(),
          transfer.started().elapsed().as_millis()
        ),
      ),
      Ok(_) => log_line("[send] aborted", format!("{}: no peer received every chunk", transfer.name())),
      Err(err) => log_line("[send] failed", format!("{}: {err:#}", transfer.name())),
    }
  }

  fn report_dropped(&mut self) {
    let Some(transfer) = self.outbound.as_mut() else {
      return;
    };
    for peer_id in transfer.take_dropped() {
      log_line("[send] dropped", self.display_name(&peer_id));
    }
  }

  fn evict_stale(&mut self) {
    let Some(max_idle) = self.config.transfer_timeout else {
      return;
    };
    let evicted = self.inbox.evict_stale(Instant::now(), max_idle);
    if evicted > 0 {
      log_line("[file] dropped", format!("{evicted} stalled transfer(s)"));
    }
  }
}

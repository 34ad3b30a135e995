//! Streams one local file into the mesh a chunk at a time. The session loop
//! calls [`OutboundTransfer::step`] between its other events, so relay
//! notices, link events and user commands are never held up by a transfer.

use std::time::Instant;

use anyhow::Context;
use meshlane_proto::Payload;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::files::FileInfo;
use crate::mesh::MeshSession;
use crate::transfer::{OutgoingFile, MAX_CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
  Sent,
  Done { delivered: usize },
  /// Every target missed a frame.
  Aborted,
}

pub struct OutboundTransfer {
  outgoing: OutgoingFile,
  file: File,
  buffer: Vec<u8>,
  next_seq: u64,
  remaining: u64,
  targets: Vec<String>,
  dropped: Vec<String>,
  started: Instant,
}

impl OutboundTransfer {
  /// Opens the file and announces it to every open channel. Returns `None`
  /// when no peer took the announcement.
  pub async fn start(mesh: &MeshSession, info: FileInfo, chunk_size: usize) -> anyhow::Result<Option<Self>> {
    let targets = mesh.open_peers();
    if targets.is_empty() {
      return Ok(None);
    }
    let file = File::open(&info.path)
      .await
      .with_context(|| format!("open {}", info.path.display()))?;
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let mut transfer = Self {
      outgoing: OutgoingFile::new(info.name, info.mime, info.size, chunk_size),
      file,
      buffer: vec![0u8; chunk_size],
      next_seq: 0,
      remaining: info.size,
      targets,
      dropped: Vec::new(),
      started: Instant::now(),
    };
    let meta = transfer.outgoing.meta();
    if !transfer.deliver(mesh, &meta).await? {
      return Ok(None);
    }
    Ok(Some(transfer))
  }

  pub fn name(&self) -> &str {
    &self.outgoing.name
  }

  pub fn size(&self) -> u64 {
    self.outgoing.size
  }

  pub fn total_chunks(&self) -> u64 {
    self.outgoing.total_chunks()
  }

  pub fn started(&self) -> Instant {
    self.started
  }

  /// Peers that missed a frame since the last call.
  pub fn take_dropped(&mut self) -> Vec<String> {
    std::mem::take(&mut self.dropped)
  }

  /// Sends the next chunk, or `file-complete` once all chunks are out.
  pub async fn step(&mut self, mesh: &MeshSession) -> anyhow::Result<Progress> {
    if self.next_seq < self.outgoing.total_chunks() {
      let len = self.remaining.min(self.outgoing.chunk_size as u64) as usize;
      self
        .file
        .read_exact(&mut self.buffer[..len])
        .await
        .context("read file chunk")?;
      let chunk = self.outgoing.chunk(self.next_seq, self.buffer[..len].to_vec());
      self.next_seq += 1;
      self.remaining -= len as u64;
      return Ok(if self.deliver(mesh, &chunk).await? {
        Progress::Sent
      } else {
        Progress::Aborted
      });
    }
    let complete = self.outgoing.complete();
    if !self.deliver(mesh, &complete).await? {
      return Ok(Progress::Aborted);
    }
    Ok(Progress::Done {
      delivered: self.targets.len(),
    })
  }

  /// A peer that misses one frame can never reassemble the file, so it is
  /// dropped from the transfer. `false` once nobody is left.
  async fn deliver(&mut self, mesh: &MeshSession, payload: &Payload) -> anyhow::Result<bool> {
    let missed = mesh.send_to(&self.targets, payload).await?;
    if !missed.is_empty() {
      self.targets.retain(|peer_id| !missed.contains(peer_id));
      self.dropped.extend(missed);
    }
    Ok(!self.targets.is_empty())
  }
}

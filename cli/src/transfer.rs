//! Fragmenting outbound files and reassembling inbound ones.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use meshlane_proto::Payload;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Keeps a sealed `file-chunk` frame under `codec::MAX_FRAME_LEN`.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
  size.div_ceil(chunk_size.max(1) as u64)
}

/// Sender-side description of one file broadcast.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
  pub file_id: String,
  pub name: String,
  pub size: u64,
  pub mime: String,
  pub chunk_size: usize,
}

impl OutgoingFile {
  pub fn new(name: impl Into<String>, mime: impl Into<String>, size: u64, chunk_size: usize) -> Self {
    Self {
      file_id: Uuid::new_v4().to_string(),
      name: name.into(),
      size,
      mime: mime.into(),
      chunk_size: chunk_size.max(1),
    }
  }

  pub fn total_chunks(&self) -> u64 {
    total_chunks(self.size, self.chunk_size)
  }

  pub fn meta(&self) -> Payload {
    Payload::FileMeta {
      file_id: self.file_id.clone(),
      name: self.name.clone(),
      size: self.size,
      mime: self.mime.clone(),
      total_chunks: self.total_chunks(),
    }
  }

  pub fn chunk(&self, seq: u64, data: Vec<u8>) -> Payload {
    Payload::FileChunk {
      file_id: self.file_id.clone(),
      seq,
      data,
    }
  }

  pub fn complete(&self) -> Payload {
    Payload::FileComplete {
      file_id: self.file_id.clone(),
    }
  }

  /// Every message for an in-memory payload, in send order.
  pub fn messages(&self, bytes: &[u8]) -> Vec<Payload> {
    let mut out = Vec::with_capacity(self.total_chunks() as usize + 2);
    out.push(self.meta());
    for (seq, chunk) in bytes.chunks(self.chunk_size).enumerate() {
      out.push(self.chunk(seq as u64, chunk.to_vec()));
    }
    out.push(self.complete());
    out
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
  pub from: String,
  pub file_id: String,
  pub name: String,
  pub mime: String,
  pub data: Vec<u8>,
}

#[derive(Debug)]
struct TransferState {
  name: String,
  size: u64,
  mime: String,
  total_chunks: u64,
  chunks: BTreeMap<u64, Vec<u8>>,
  received_bytes: u64,
  last_activity: Instant,
}

/// Receiver-side reassembly, one state per (sender, file id).
#[derive(Debug)]
pub struct TransferInbox {
  transfers: HashMap<(String, String), TransferState>,
  max_file_size: u64,
}

impl Default for TransferInbox {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_FILE_SIZE)
  }
}

impl TransferInbox {
  pub fn new(max_file_size: u64) -> Self {
    Self {
      transfers: HashMap::new(),
      max_file_size,
    }
  }

  pub fn pending(&self) -> usize {
    self.transfers.len()
  }

  /// Bytes received so far for a pending transfer.
  pub fn progress(&self, from: &str, file_id: &str) -> Option<(u64, u64)> {
    self
      .transfers
      .get(&(from.to_string(), file_id.to_string()))
      .map(|state| (state.received_bytes, state.size))
  }

  /// Feeds one decrypted payload. Returns the file once its `file-complete`
  /// arrives; non-file payloads are ignored.
  pub fn handle(&mut self, from: &str, payload: Payload) -> Option<ReceivedFile> {
    match payload {
      Payload::FileMeta {
        file_id,
        name,
        size,
        mime,
        total_chunks,
      } => {
        if size > self.max_file_size {
          warn!(from, file_id = %file_id, size, "incoming file exceeds size limit, ignored");
          return None;
        }
        debug!(from, file_id = %file_id, size, total_chunks, "transfer started");
        self.transfers.insert(
          (from.to_string(), file_id),
          TransferState {
            name,
            size,
            mime,
            total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            last_activity: Instant::now(),
          },
        );
        None
      }
      Payload::FileChunk { file_id, seq, data } => {
        let key = (from.to_string(), file_id);
        let Some(state) = self.transfers.get_mut(&key) else {
          debug!(from, file_id = %key.1, seq, "chunk for unknown transfer ignored");
          return None;
        };
        if seq >= state.total_chunks {
          warn!(from, file_id = %key.1, seq, "chunk outside announced range ignored");
          return None;
        }
        let len = data.len() as u64;
        if let Some(previous) = state.chunks.insert(seq, data) {
          state.received_bytes -= previous.len() as u64;
        }
        state.received_bytes += len;
        state.last_activity = Instant::now();
        if state.received_bytes > state.size {
          warn!(from, file_id = %key.1, "transfer exceeded announced size, discarded");
          self.transfers.remove(&key);
        }
        None
      }
      Payload::FileComplete { file_id } => {
        let Some(state) = self.transfers.remove(&(from.to_string(), file_id.clone())) else {
          debug!(from, file_id = %file_id, "completion for unknown transfer ignored");
          return None;
        };
        if state.chunks.len() as u64 != state.total_chunks || state.received_bytes != state.size {
          warn!(
            from,
            file_id = %file_id,
            chunks = state.chunks.len(),
            expected = state.total_chunks,
            "incomplete transfer discarded"
          );
          return None;
        }
        let mut data = Vec::with_capacity(state.size as usize);
        for chunk in state.chunks.into_values() {
          data.extend_from_slice(&chunk);
        }
        Some(ReceivedFile {
          from: from.to_string(),
          file_id,
          name: state.name,
          mime: state.mime,
          data,
        })
      }
      Payload::Text { .. } | Payload::System { .. } => None,
    }
  }

  /// Drops transfers that have not seen a chunk for `max_idle`.
  pub fn evict_stale(&mut self, now: Instant, max_idle: Duration) -> usize {
    let before = self.transfers.len();
    self.transfers.retain(|(from, file_id), state| {
      let keep = now.saturating_duration_since(state.last_activity) < max_idle;
      if !keep {
        warn!(from = %from, file_id = %file_id, "stale transfer evicted");
      }
      keep
    });
    before - self.transfers.len()
  }

  pub fn clear(&mut self) {
    self.transfers.clear();
  }
}

use meshlane_proto::AccessErrorCode;
use thiserror::Error;

/// Access errors surfaced to the client that issued `create-room` or
/// `join-room`. Room state is never modified when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
  #[error("room {0} already exists")]
  RoomExists(String),

  #[error("room {0} not found")]
  RoomNotFound(String),

  #[error("passphrase does not match room {0}")]
  PassphraseMismatch(String),

  #[error("already a member of room {0}")]
  AlreadyMember(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl RegistryError {
  pub fn code(&self) -> AccessErrorCode {
    match self {
      RegistryError::RoomExists(_) => AccessErrorCode::RoomExists,
      RegistryError::RoomNotFound(_) => AccessErrorCode::RoomNotFound,
      RegistryError::PassphraseMismatch(_) => AccessErrorCode::PassphraseMismatch,
      RegistryError::AlreadyMember(_) => AccessErrorCode::AlreadyMember,
      RegistryError::InvalidRequest(_) => AccessErrorCode::InvalidRequest,
    }
  }
}

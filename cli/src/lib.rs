//! Client side of meshlane: a passphrase-keyed mesh of WebRTC data channels
//! bootstrapped through the signaling relay.

pub mod codec;
pub mod config;
pub mod console;
pub mod files;
pub mod mesh;
pub mod outbound;
pub mod session;
pub mod transfer;
pub mod transport;

pub use codec::Codec;
pub use config::{Intent, ReconnectPolicy, SessionConfig};
pub use mesh::{MeshEvent, MeshSession};
pub use session::{run, SessionEnd, SessionError};
pub use transport::WebRtcConnector;

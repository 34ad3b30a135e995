//! Signaling relay for meshlane rooms.
//!
//! The relay keeps room membership in memory, gates joins on a passphrase
//! digest and forwards negotiation messages between members. It never sees
//! data-channel traffic or the room key.

pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod server;

pub use config::RelayConfig;
pub use error::RegistryError;
pub use hub::SignalingHub;
pub use registry::{Delivery, Registry};
pub use server::{router, serve, AppState};

//! Publish the track playing in a desktop media session as rich presence
//! over a local IPC socket.

pub mod artwork;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod presence;
pub mod probe;
pub mod session;
pub mod sidecar;
pub mod state;
pub mod transport;
pub mod types;

pub use bridge::{Bridge, BridgeHandle, Command};
pub use config::BridgeConfig;
pub use session::{SessionMonitor, SessionSource};
pub use transport::TransportClient;
pub use types::{BridgeState, ForceUpdateFlags, PlaybackStatus, TrackInfo};

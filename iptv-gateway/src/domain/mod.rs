//! Channel source domain logic: protocol classification and bridge resolution.

pub mod bridge;
pub mod protocol;

pub use bridge::{BridgeConfig, BridgeUnavailable, resolve_playback_url};
pub use protocol::{DEFAULT_MULTICAST_PORT, ProtocolInfo, StreamProtocol, classify};

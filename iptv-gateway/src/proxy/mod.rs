//! Stream proxy: playback authorization, upstream relay and session lifecycle.

mod error;
pub mod gateway;
pub mod relay;
pub mod session;

pub use error::StreamError;
pub use gateway::{
    DEFAULT_CONTENT_TYPE, GatewayDeps, GatewayOptions, StreamGateway, StreamResponse,
};
pub use relay::{RelayEnd, RelayStream};
pub use session::{SessionFinalizer, SessionLease};

pub mod clock;
pub mod http_client;

pub use clock::{Clock, ManualClock, SystemClock};

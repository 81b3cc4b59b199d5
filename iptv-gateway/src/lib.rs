//! iptv-gateway library crate.
//!
//! Live-stream proxy for an IPTV catalog: authorizes playback, relays the
//! upstream source, accounts watch time per viewer, and probes channel
//! health in the background.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod health;
pub mod logging;
pub mod proxy;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod utils;

pub use error::{Error, Result};

//! Configuration.
//!
//! Two layers:
//! - [`AppConfig`]: process configuration read once from the environment at startup.
//! - [`LiveSettings`]: operator-tunable values produced by a [`LiveConfig`] on
//!   every call, so changes apply without a restart.

mod live;

pub use live::{
    LiveConfig, LiveSettings, MAX_BUFFER_SIZE, MAX_PROBE_RETRIES, MAX_PROBE_TIMEOUT,
    MAX_PROBE_WORKERS, SettingsService, StaticLiveConfig, keys,
};

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default database location.
const DEFAULT_DATABASE_URL: &str = "sqlite:data/iptv.db?mode=rwc";

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    /// Start the recurring channel probe job.
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub watch_flush_interval: Duration,
    /// Elapsed time after which an open session is reported as a probable zombie.
    pub zombie_threshold: Duration,
    pub upstream_connect_timeout: Duration,
    pub upstream_read_timeout: Duration,
    /// Budget for the best-effort upstream content-type lookup.
    pub content_type_timeout: Duration,
    /// Fallback values for [`LiveSettings`] when the settings table has no override.
    pub live_defaults: LiveSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 5000,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(1800),
            watch_flush_interval: Duration::from_secs(60),
            zombie_threshold: Duration::from_secs(2 * 60 * 60),
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_read_timeout: Duration::from_secs(30),
            content_type_timeout: Duration::from_secs(3),
            live_defaults: LiveSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("SERVER_HOST") {
            config.server_host = host;
        }
        parse_into(&get, "SERVER_PORT", &mut config.server_port);
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        parse_bool_into(&get, "HEALTH_CHECK_ENABLED", &mut config.health_check_enabled);
        parse_secs_into(&get, "HEALTH_CHECK_INTERVAL", &mut config.health_check_interval);
        parse_secs_into(&get, "WATCH_HISTORY_SAVE_INTERVAL", &mut config.watch_flush_interval);
        parse_secs_into(&get, "ZOMBIE_SESSION_THRESHOLD", &mut config.zombie_threshold);
        parse_secs_into(&get, "UPSTREAM_CONNECT_TIMEOUT", &mut config.upstream_connect_timeout);
        parse_secs_into(&get, "UPSTREAM_READ_TIMEOUT", &mut config.upstream_read_timeout);
        parse_secs_into(&get, "CONTENT_TYPE_TIMEOUT", &mut config.content_type_timeout);

        let live = &mut config.live_defaults;
        parse_into(&get, "PROXY_BUFFER_SIZE", &mut live.buffer_size);
        parse_secs_into(&get, "HEALTH_CHECK_TIMEOUT", &mut live.probe_timeout);
        parse_into(&get, "HEALTH_CHECK_MAX_RETRIES", &mut live.probe_max_retries);
        parse_into(&get, "HEALTH_CHECK_WORKERS", &mut live.probe_workers);
        parse_bool_into(&get, "UDPXY_ENABLED", &mut live.bridge_enabled);
        if let Some(url) = get("UDPXY_URL") {
            live.bridge_url = url;
        }
        *live = live.clone().sanitized();

        config
    }

    /// Socket address the API server binds to.
    pub fn bind_address(&self) -> crate::Result<SocketAddr> {
        socket_addr(&self.server_host, self.server_port)
    }
}

/// Build a socket address from an IPv4 or IPv6 host literal and a port.
///
/// IPv6 hosts may be bracketed (`[::1]`).
pub fn socket_addr(host: &str, port: u16) -> crate::Result<SocketAddr> {
    let host = host.trim();
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = literal
        .parse()
        .map_err(|e| crate::Error::config(format!("Invalid bind host '{host}': {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

fn parse_into<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment value"),
        }
    }
}

fn parse_secs_into(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(get, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

fn parse_bool_into(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(raw) = get(key) {
        match parse_bool(&raw) {
            Some(value) => *slot = value,
            None => warn!(key, value = %raw, "Ignoring unparsable boolean"),
        }
    }
}

/// Parse the boolean spellings accepted in env files and the settings table.
pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.server_port, 5000);
        assert_eq!(config.health_check_interval, Duration::from_secs(1800));
        assert_eq!(config.watch_flush_interval, Duration::from_secs(60));
        assert_eq!(config.zombie_threshold, Duration::from_secs(7200));
        assert_eq!(config.live_defaults.buffer_size, 8192);
        assert_eq!(config.live_defaults.probe_max_retries, 1);
        assert!(!config.live_defaults.bridge_enabled);
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("SERVER_PORT", "8080"),
            ("HEALTH_CHECK_ENABLED", "false"),
            ("HEALTH_CHECK_INTERVAL", "600"),
            ("PROXY_BUFFER_SIZE", "65536"),
            ("UDPXY_ENABLED", "TRUE"),
            ("UDPXY_URL", "http://10.0.0.2:4022"),
        ]));
        assert_eq!(config.bind_address().unwrap().to_string(), "0.0.0.0:8080");
        assert!(!config.health_check_enabled);
        assert_eq!(config.health_check_interval, Duration::from_secs(600));
        assert_eq!(config.live_defaults.buffer_size, 65536);
        assert!(config.live_defaults.bridge_enabled);
        assert_eq!(config.live_defaults.bridge_url, "http://10.0.0.2:4022");
    }

    #[test]
    fn test_ipv6_bind_hosts() {
        let any = AppConfig::from_lookup(lookup(&[("SERVER_HOST", "::"), ("SERVER_PORT", "5000")]));
        assert_eq!(any.bind_address().unwrap().to_string(), "[::]:5000");

        let loopback = socket_addr("[::1]", 8080).unwrap();
        assert!(loopback.is_ipv6());
        assert_eq!(loopback.port(), 8080);

        assert!(socket_addr("localhost", 80).is_err());
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("SERVER_PORT", "not-a-port"),
            ("UDPXY_ENABLED", "maybe"),
            ("PROXY_BUFFER_SIZE", "0"),
        ]));
        assert_eq!(config.server_port, 5000);
        assert!(!config.live_defaults.bridge_enabled);
        assert_eq!(config.live_defaults.buffer_size, 8192);
    }
}

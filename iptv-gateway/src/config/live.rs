//! Hot-reloadable settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use super::parse_bool;
use crate::database::repositories::SettingsRepository;
use crate::domain::BridgeConfig;

/// Keys of the `settings` table that override [`LiveSettings`].
pub mod keys {
    pub const PROXY_BUFFER_SIZE: &str = "proxy_buffer_size";
    pub const HEALTH_CHECK_TIMEOUT: &str = "health_check_timeout";
    pub const HEALTH_CHECK_MAX_RETRIES: &str = "health_check_max_retries";
    pub const HEALTH_CHECK_WORKERS: &str = "health_check_workers";
    pub const UDPXY_ENABLED: &str = "udpxy_enabled";
    pub const UDPXY_URL: &str = "udpxy_url";
}

/// Largest relay chunk size accepted from settings.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Largest per-attempt probe timeout accepted from settings.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(300);
pub const MAX_PROBE_RETRIES: u32 = 10;
/// Largest probe worker pool accepted from settings.
pub const MAX_PROBE_WORKERS: usize = 256;

/// Settings that are re-read on every use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSettings {
    /// Relay chunk size in bytes.
    pub buffer_size: usize,
    /// Per-attempt probe timeout.
    pub probe_timeout: Duration,
    /// Extra attempts after the first failed probe.
    pub probe_max_retries: u32,
    /// Width of the probe worker pool.
    pub probe_workers: usize,
    pub bridge_enabled: bool,
    pub bridge_url: String,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            probe_timeout: Duration::from_secs(10),
            probe_max_retries: 1,
            probe_workers: 8,
            bridge_enabled: false,
            bridge_url: "http://localhost:3680".to_string(),
        }
    }
}

impl LiveSettings {
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            enabled: self.bridge_enabled,
            base_url: self.bridge_url.clone(),
        }
    }

    /// Replace zero sizes and timeouts with defaults and clamp oversized
    /// values to their upper bounds.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.buffer_size == 0 {
            self.buffer_size = defaults.buffer_size;
        }
        if self.probe_timeout.is_zero() {
            self.probe_timeout = defaults.probe_timeout;
        }
        if self.probe_workers == 0 {
            self.probe_workers = defaults.probe_workers;
        }

        if self.buffer_size > MAX_BUFFER_SIZE {
            warn!(requested = self.buffer_size, max = MAX_BUFFER_SIZE, "Clamping relay buffer size");
            self.buffer_size = MAX_BUFFER_SIZE;
        }
        if self.probe_timeout > MAX_PROBE_TIMEOUT {
            warn!(
                requested_secs = self.probe_timeout.as_secs(),
                max_secs = MAX_PROBE_TIMEOUT.as_secs(),
                "Clamping probe timeout"
            );
            self.probe_timeout = MAX_PROBE_TIMEOUT;
        }
        if self.probe_max_retries > MAX_PROBE_RETRIES {
            warn!(requested = self.probe_max_retries, max = MAX_PROBE_RETRIES, "Clamping probe retries");
            self.probe_max_retries = MAX_PROBE_RETRIES;
        }
        if self.probe_workers > MAX_PROBE_WORKERS {
            warn!(requested = self.probe_workers, max = MAX_PROBE_WORKERS, "Clamping probe workers");
            self.probe_workers = MAX_PROBE_WORKERS;
        }
        self
    }

    /// Overlay stored settings on top of `self`. Unparsable values are skipped.
    pub fn overlay(mut self, stored: &HashMap<String, String>) -> Self {
        fn parsed<T: std::str::FromStr>(stored: &HashMap<String, String>, key: &str) -> Option<T> {
            let raw = stored.get(key)?;
            let value = raw.trim().parse::<T>().ok();
            if value.is_none() {
                warn!(key, value = %raw, "Ignoring unparsable setting");
            }
            value
        }

        if let Some(v) = parsed(stored, keys::PROXY_BUFFER_SIZE) {
            self.buffer_size = v;
        }
        if let Some(v) = parsed::<u64>(stored, keys::HEALTH_CHECK_TIMEOUT) {
            self.probe_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed(stored, keys::HEALTH_CHECK_MAX_RETRIES) {
            self.probe_max_retries = v;
        }
        if let Some(v) = parsed(stored, keys::HEALTH_CHECK_WORKERS) {
            self.probe_workers = v;
        }
        if let Some(raw) = stored.get(keys::UDPXY_ENABLED) {
            match parse_bool(raw) {
                Some(v) => self.bridge_enabled = v,
                None => warn!(key = keys::UDPXY_ENABLED, value = %raw, "Ignoring unparsable setting"),
            }
        }
        if let Some(url) = stored.get(keys::UDPXY_URL).filter(|u| !u.trim().is_empty()) {
            self.bridge_url = url.trim().to_string();
        }
        self.sanitized()
    }
}

/// Source of [`LiveSettings`]. Implementations must not cache across calls.
#[async_trait]
pub trait LiveConfig: Send + Sync {
    async fn current(&self) -> LiveSettings;
}

/// Settings backed by the `settings` table with environment defaults.
pub struct SettingsService {
    repository: Arc<dyn SettingsRepository>,
    defaults: LiveSettings,
}

impl SettingsService {
    pub fn new(repository: Arc<dyn SettingsRepository>, defaults: LiveSettings) -> Self {
        Self {
            repository,
            defaults,
        }
    }
}

#[async_trait]
impl LiveConfig for SettingsService {
    async fn current(&self) -> LiveSettings {
        match self.repository.get_all().await {
            Ok(stored) => self.defaults.clone().overlay(&stored),
            Err(e) => {
                warn!(error = %e, "Failed to read settings; using defaults");
                self.defaults.clone()
            }
        }
    }
}

/// In-process settings that can be changed at runtime.
#[derive(Default)]
pub struct StaticLiveConfig {
    settings: RwLock<LiveSettings>,
}

impl StaticLiveConfig {
    pub fn new(settings: LiveSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut LiveSettings)) {
        f(&mut *self.settings.write());
    }
}

#[async_trait]
impl LiveConfig for StaticLiveConfig {
    async fn current(&self) -> LiveSettings {
        self.settings.read().clone().sanitized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxSettingsRepository;
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_settings_are_reread_each_call() {
        let repo = Arc::new(SqlxSettingsRepository::new(test_pool().await));
        let service = SettingsService::new(repo.clone(), LiveSettings::default());

        assert_eq!(service.current().await.buffer_size, 8192);

        repo.set(keys::PROXY_BUFFER_SIZE, "1316").await.unwrap();
        repo.set(keys::UDPXY_ENABLED, "true").await.unwrap();
        repo.set(keys::UDPXY_URL, "http://bridge:4022").await.unwrap();

        let live = service.current().await;
        assert_eq!(live.buffer_size, 1316);
        assert!(live.bridge_enabled);
        assert_eq!(live.bridge().base_url, "http://bridge:4022");
    }

    #[test]
    fn test_overlay_skips_bad_values() {
        let stored = HashMap::from([
            (keys::HEALTH_CHECK_MAX_RETRIES.to_string(), "three".to_string()),
            (keys::HEALTH_CHECK_WORKERS.to_string(), "0".to_string()),
            (keys::HEALTH_CHECK_TIMEOUT.to_string(), "2".to_string()),
        ]);
        let live = LiveSettings::default().overlay(&stored);
        assert_eq!(live.probe_max_retries, 1);
        assert_eq!(live.probe_workers, 8);
        assert_eq!(live.probe_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_oversized_stored_values_are_clamped() {
        let repo = Arc::new(SqlxSettingsRepository::new(test_pool().await));
        let service = SettingsService::new(repo.clone(), LiveSettings::default());

        repo.set(keys::PROXY_BUFFER_SIZE, "1152921504606846976").await.unwrap();
        repo.set(keys::HEALTH_CHECK_WORKERS, "18446744073709551615").await.unwrap();
        repo.set(keys::HEALTH_CHECK_MAX_RETRIES, "4000000000").await.unwrap();
        repo.set(keys::HEALTH_CHECK_TIMEOUT, "86400").await.unwrap();

        let live = service.current().await;
        assert_eq!(live.buffer_size, MAX_BUFFER_SIZE);
        assert_eq!(live.probe_workers, MAX_PROBE_WORKERS);
        assert_eq!(live.probe_max_retries, MAX_PROBE_RETRIES);
        assert_eq!(live.probe_timeout, MAX_PROBE_TIMEOUT);
    }

    #[test]
    fn test_values_within_bounds_are_kept() {
        let live = LiveSettings {
            buffer_size: MAX_BUFFER_SIZE,
            probe_workers: 3,
            ..LiveSettings::default()
        }
        .sanitized();
        assert_eq!(live.buffer_size, MAX_BUFFER_SIZE);
        assert_eq!(live.probe_workers, 3);
    }

    #[tokio::test]
    async fn test_static_config_is_sanitized() {
        let config = StaticLiveConfig::default();
        config.update(|s| s.buffer_size = usize::MAX);
        assert_eq!(config.current().await.buffer_size, MAX_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_static_config_update() {
        let config = StaticLiveConfig::default();
        config.update(|s| s.buffer_size = 188 * 7);
        assert_eq!(config.current().await.buffer_size, 1316);
    }
}

use std::{sync::OnceLock, time::Duration};

use tracing::debug;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client for long-lived upstream relays.
///
/// No overall request timeout: a live stream may run for hours. Stalls are
/// bounded by the connect and per-read timeouts instead.
pub fn build_relay_client(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .tcp_nodelay(true)
        .pool_max_idle_per_host(20)
        .build()
}

/// Client for health probes. Timeouts are applied per request because they
/// are live settings.
pub fn build_probe_client() -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .pool_max_idle_per_host(4)
        .build()
}

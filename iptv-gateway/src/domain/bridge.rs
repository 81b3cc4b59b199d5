//! Multicast-to-unicast bridge (udpxy) URL translation.

use thiserror::Error;

use super::protocol::classify;

/// The source is multicast but no bridge is configured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("multicast source '{url}' requires a unicast bridge, but none is enabled")]
pub struct BridgeUnavailable {
    pub url: String,
}

/// Bridge settings relevant to URL translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub base_url: String,
}

/// Map a channel source to the URL a unicast client can actually fetch.
///
/// Unicast URLs pass through untouched. Multicast URLs become
/// `{base}/udp/{host:port}` when the bridge is enabled.
pub fn resolve_playback_url(url: &str, bridge: &BridgeConfig) -> Result<String, BridgeUnavailable> {
    let info = classify(url);
    if !info.multicast {
        return Ok(url.to_string());
    }

    match (&info.address, bridge.enabled) {
        (Some(address), true) => {
            let base = bridge.base_url.trim_end_matches('/');
            Ok(format!("{base}/udp/{address}"))
        }
        _ => Err(BridgeUnavailable {
            url: url.to_string(),
        }),
    }
}

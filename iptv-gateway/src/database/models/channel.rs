//! Channel catalog database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{ProtocolInfo, classify};

/// A playable channel.
///
/// The catalog is owned elsewhere; the gateway only writes `is_healthy` and
/// `last_check`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelDbModel {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Stored protocol family: http, https, rtp or udp.
    pub protocol: String,
    pub is_active: bool,
    pub is_healthy: bool,
    /// Unix epoch milliseconds of the last probe.
    pub last_check: Option<i64>,
}

impl ChannelDbModel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let protocol = classify(&url).protocol.to_string();
        Self {
            id: 0,
            name: name.into(),
            url,
            protocol,
            is_active: true,
            is_healthy: true,
            last_check: None,
        }
    }

    /// Classify the source URL.
    pub fn source(&self) -> ProtocolInfo {
        classify(&self.url)
    }

    /// Last probe time as RFC 3339, if the channel was ever probed.
    pub fn last_check_rfc3339(&self) -> Option<String> {
        self.last_check.map(|ms| ms_to_datetime(ms).to_rfc3339())
    }
}

/// Catalog-wide health counts over active channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelHealthSummary {
    pub total: i64,
    pub healthy: i64,
    pub unhealthy: i64,
    pub unhealthy_channels: Vec<ChannelDbModel>,
}

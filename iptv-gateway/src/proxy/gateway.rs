//! Playback entry point: authorize, resolve, open a session, relay.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use super::error::StreamError;
use super::relay::{RelayStream, spawn_relay};
use super::session::{SessionFinalizer, SessionLease};
use crate::Result;
use crate::config::{AppConfig, LiveConfig};
use crate::database::models::{ChannelDbModel, ViewerDbModel};
use crate::database::repositories::{ChannelRepository, ViewerRepository, WatchRecordRepository};
use crate::domain::resolve_playback_url;
use crate::session::{LiveSession, SessionRegistry};
use crate::utils::Clock;
use crate::utils::http_client::build_relay_client;

/// Media type reported when the upstream does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp2t";

/// Upstream timeouts used by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct GatewayOptions {
    pub connect_timeout: Duration,
    /// Longest silence tolerated between upstream reads.
    pub read_timeout: Duration,
    /// Budget for the secondary content-type lookup.
    pub content_type_timeout: Duration,
}

impl From<&AppConfig> for GatewayOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            connect_timeout: config.upstream_connect_timeout,
            read_timeout: config.upstream_read_timeout,
            content_type_timeout: config.content_type_timeout,
        }
    }
}

/// An authorized, relaying playback stream.
pub struct StreamResponse {
    pub session_key: String,
    pub content_type: String,
    pub body: RelayStream,
}

/// Dependencies of [`StreamGateway`].
pub struct GatewayDeps {
    pub viewers: Arc<dyn ViewerRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub records: Arc<dyn WatchRecordRepository>,
    pub registry: Arc<SessionRegistry>,
    pub live: Arc<dyn LiveConfig>,
    pub clock: Arc<dyn Clock>,
}

pub struct StreamGateway {
    viewers: Arc<dyn ViewerRepository>,
    channels: Arc<dyn ChannelRepository>,
    records: Arc<dyn WatchRecordRepository>,
    registry: Arc<SessionRegistry>,
    live: Arc<dyn LiveConfig>,
    clock: Arc<dyn Clock>,
    finalizer: SessionFinalizer,
    client: reqwest::Client,
    content_type_timeout: Duration,
}

impl StreamGateway {
    pub fn new(deps: GatewayDeps, options: GatewayOptions) -> Result<Self> {
        let client = build_relay_client(options.connect_timeout, options.read_timeout)?;
        let finalizer = SessionFinalizer::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.records),
            Arc::clone(&deps.clock),
        );
        Ok(Self {
            viewers: deps.viewers,
            channels: deps.channels,
            records: deps.records,
            registry: deps.registry,
            live: deps.live,
            clock: deps.clock,
            finalizer,
            client,
            content_type_timeout: options.content_type_timeout,
        })
    }

    /// Authorize a playback request and start relaying the channel.
    ///
    /// Once a session is opened, every failure path finalizes it before
    /// returning, and a successful stream finalizes it when the relay ends.
    pub async fn stream(
        &self,
        token: Option<&str>,
        channel_id: i64,
    ) -> std::result::Result<StreamResponse, StreamError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(StreamError::Unauthorized)?;
        let viewer = self
            .viewers
            .resolve_viewer_by_token(token)
            .await?
            .ok_or(StreamError::Unauthorized)?;

        let channel = self
            .channels
            .get_channel(channel_id)
            .await?
            .ok_or(StreamError::NotFound(channel_id))?;
        if !channel.is_active {
            return Err(StreamError::Forbidden(channel_id));
        }

        // Settings are read per request so retuning applies to the next stream.
        let settings = self.live.current().await;
        let upstream_url = resolve_playback_url(&channel.url, &settings.bridge())?;
        let upstream_url = url::Url::parse(&upstream_url)
            .map_err(|e| StreamError::BadGateway(format!("invalid source url '{upstream_url}': {e}")))?;

        let lease = self.open_session(&viewer, &channel).await?;

        let upstream = match self.connect(upstream_url.clone()).await {
            Ok(upstream) => upstream,
            Err(cause) => {
                warn!(key = lease.key(), upstream = %upstream_url, cause = %cause, "Upstream connect failed");
                lease.release().await;
                return Err(StreamError::BadGateway(cause));
            }
        };

        let content_type = self.content_type(&upstream, &upstream_url).await;
        let session_key = lease.key().to_string();
        info!(
            key = %session_key,
            viewer = %viewer.username,
            channel = %channel.name,
            upstream = %upstream_url,
            chunk_size = settings.buffer_size,
            "Relay started"
        );
        let body = spawn_relay(Box::pin(upstream.bytes_stream()), settings.buffer_size, lease);

        Ok(StreamResponse {
            session_key,
            content_type,
            body,
        })
    }

    /// Close a session by key. Safe to call more than once.
    pub async fn finalize_session(&self, key: &str) -> Option<i64> {
        self.finalizer.finalize(key).await
    }

    /// Close every open session, e.g. on shutdown.
    pub async fn finalize_all(&self) -> usize {
        self.finalizer.finalize_all().await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn open_session(
        &self,
        viewer: &ViewerDbModel,
        channel: &ChannelDbModel,
    ) -> std::result::Result<SessionLease, StreamError> {
        let started_at = self.clock.now();
        let record_id = self
            .records
            .create_open(viewer.id, channel.id, started_at)
            .await?;
        let session = self
            .registry
            .register(LiveSession::new(viewer, channel, record_id, started_at));
        Ok(SessionLease::new(self.finalizer.clone(), session.key.clone()))
    }

    async fn connect(&self, url: url::Url) -> std::result::Result<reqwest::Response, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("upstream returned HTTP {status}"));
        }
        Ok(response)
    }

    /// Declared content type of the upstream, or [`DEFAULT_CONTENT_TYPE`].
    async fn content_type(&self, upstream: &reqwest::Response, url: &url::Url) -> String {
        if let Some(declared) = header_content_type(upstream.headers()) {
            return declared;
        }

        let head = self.client.head(url.clone()).timeout(self.content_type_timeout).send();
        let looked_up = match tokio::time::timeout(self.content_type_timeout, head).await {
            Ok(Ok(response)) => header_content_type(response.headers()),
            Ok(Err(e)) => {
                debug!(upstream = %url, error = %e, "Content type lookup failed");
                None
            }
            Err(_) => {
                debug!(upstream = %url, "Content type lookup timed out");
                None
            }
        };
        looked_up.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }
}

fn header_content_type(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

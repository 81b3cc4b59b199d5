//! Single-attempt, protocol-aware source probes.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::Result;
use crate::config::LiveSettings;
use crate::database::models::ChannelDbModel;
use crate::domain::{ProtocolInfo, resolve_playback_url};
use crate::utils::http_client::build_probe_client;

/// Largest datagram we accept while waiting for multicast traffic.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Outcome of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub healthy: bool,
    /// Why the attempt failed. `None` when healthy.
    pub cause: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            cause: None,
        }
    }

    pub fn unhealthy(cause: impl Into<String>) -> Self {
        Self {
            healthy: false,
            cause: Some(cause.into()),
        }
    }
}

/// One reachability check against a channel source.
///
/// Implementations report transport faults through the returned outcome.
#[async_trait]
pub trait SourceProber: Send + Sync {
    async fn probe_once(&self, channel: &ChannelDbModel, settings: &LiveSettings) -> ProbeOutcome;
}

/// Probes over the network: HTTP HEAD for unicast sources, a bridged GET or
/// a direct multicast join for rtp/udp sources.
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_probe_client()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn probe_http(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(response) if response.status().as_u16() < 400 => ProbeOutcome::healthy(),
            Ok(response) => ProbeOutcome::unhealthy(format!("HTTP {}", response.status())),
            Err(e) => ProbeOutcome::unhealthy(format!("request failed: {e}")),
        }
    }

    async fn probe_bridge(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let attempt = async {
            let mut response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Ok(ProbeOutcome::unhealthy(format!(
                    "bridge returned HTTP {}",
                    response.status()
                )));
            }
            while let Some(chunk) = response.chunk().await? {
                if !chunk.is_empty() {
                    trace!(bytes = chunk.len(), "bridge delivered data");
                    return Ok(ProbeOutcome::healthy());
                }
            }
            Ok::<_, reqwest::Error>(ProbeOutcome::unhealthy("bridge stream ended without data"))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!("bridge request failed: {e}")),
            Err(_) => ProbeOutcome::unhealthy(format!("no data from bridge within {timeout:?}")),
        }
    }

    async fn probe_multicast(&self, source: &ProtocolInfo, timeout: Duration) -> ProbeOutcome {
        let group = match source.multicast_group() {
            Ok(group) => group,
            Err(e) => return ProbeOutcome::unhealthy(e.to_string()),
        };

        // The socket lives only inside this function, so it is closed on every return path.
        let socket = match join_multicast_group(group) {
            Ok(socket) => socket,
            Err(e) => return ProbeOutcome::unhealthy(format!("failed to join {group}: {e}")),
        };

        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if len > 0 => {
                trace!(%group, %from, len, "multicast datagram received");
                ProbeOutcome::healthy()
            }
            Ok(Ok(_)) => ProbeOutcome::unhealthy(format!("empty datagram on {group}")),
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!("receive on {group} failed: {e}")),
            Err(_) => ProbeOutcome::unhealthy(format!("no datagram on {group} within {timeout:?}")),
        }
    }
}

#[async_trait]
impl SourceProber for NetworkProber {
    async fn probe_once(&self, channel: &ChannelDbModel, settings: &LiveSettings) -> ProbeOutcome {
        let source = channel.source();
        let timeout = settings.probe_timeout;

        if !source.multicast {
            return self.probe_http(&channel.url, timeout).await;
        }

        if settings.bridge_enabled {
            match resolve_playback_url(&channel.url, &settings.bridge()) {
                Ok(url) => self.probe_bridge(&url, timeout).await,
                Err(e) => ProbeOutcome::unhealthy(e.to_string()),
            }
        } else {
            self.probe_multicast(&source, timeout).await
        }
    }
}

/// Open a receive-only UDP socket bound to the group's port and joined to it.
///
/// On Unix the socket is bound to the group address itself, so concurrent
/// probes of other groups on the same port never feed this socket.
fn join_multicast_group(group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    socket.bind(&group_bind_addr(group).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[cfg(unix)]
fn group_bind_addr(group: SocketAddrV4) -> SocketAddrV4 {
    group
}

// Windows cannot bind to a multicast address.
#[cfg(not(unix))]
fn group_bind_addr(group: SocketAddrV4) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tokio::net::TcpListener;

    async fn spawn_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn settings(timeout_ms: u64) -> LiveSettings {
        LiveSettings {
            probe_timeout: Duration::from_millis(timeout_ms),
            ..LiveSettings::default()
        }
    }

    #[tokio::test]
    async fn test_http_status_decides_health() {
        let base = spawn_upstream(
            Router::new()
                .route("/ok", get(|| async { "live" }))
                .route("/gone", get(|| async { StatusCode::NOT_FOUND })),
        )
        .await;
        let prober = NetworkProber::new().unwrap();

        let ok = ChannelDbModel::new("ok", format!("{base}/ok"));
        let gone = ChannelDbModel::new("gone", format!("{base}/gone"));

        assert!(prober.probe_once(&ok, &settings(2000)).await.healthy);
        let outcome = prober.probe_once(&gone, &settings(2000)).await;
        assert!(!outcome.healthy);
        assert!(outcome.cause.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_http_redirect_is_followed() {
        let base = spawn_upstream(
            Router::new()
                .route("/ok", get(|| async { "live" }))
                .route(
                    "/moved",
                    get(|| async { axum::response::Redirect::temporary("/ok") }),
                ),
        )
        .await;
        let prober = NetworkProber::new().unwrap();
        let moved = ChannelDbModel::new("moved", format!("{base}/moved"));
        assert!(prober.probe_once(&moved, &settings(2000)).await.healthy);
    }

    #[tokio::test]
    async fn test_unreachable_http_is_unhealthy() {
        let prober = NetworkProber::new().unwrap();
        let channel = ChannelDbModel::new("dead", "http://127.0.0.1:9/stream");
        let outcome = prober.probe_once(&channel, &settings(500)).await;
        assert!(!outcome.healthy);
        assert!(outcome.cause.is_some());
    }

    #[tokio::test]
    async fn test_bridge_probe_needs_data() {
        let base = spawn_upstream(
            Router::new()
                .route("/udp/239.0.0.1:5000", get(|| async { vec![0x47u8; 188] }))
                .route("/udp/239.0.0.2:5000", get(|| async { "" })),
        )
        .await;
        let prober = NetworkProber::new().unwrap();
        let mut live = settings(2000);
        live.bridge_enabled = true;
        live.bridge_url = base;

        let flowing = ChannelDbModel::new("flowing", "udp://@239.0.0.1:5000");
        let silent = ChannelDbModel::new("silent", "rtp://239.0.0.2:5000");

        assert!(prober.probe_once(&flowing, &live).await.healthy);
        assert!(!prober.probe_once(&silent, &live).await.healthy);
    }

    #[tokio::test]
    async fn test_multicast_without_traffic_times_out() {
        let prober = NetworkProber::new().unwrap();
        let channel = ChannelDbModel::new("quiet", "rtp://239.255.42.99:45999");

        let started = std::time::Instant::now();
        let outcome = prober.probe_once(&channel, &settings(300)).await;

        assert!(!outcome.healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Send datagrams to `group` until `stop` fires.
    fn spawn_group_sender(group: SocketAddrV4, stop: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            let sender = UdpSocket::bind("0.0.0.0:0").await.unwrap();
            sender.set_multicast_loop_v4(true).unwrap();
            let packet = [0x47u8; 188];
            while !stop.is_cancelled() {
                let _ = sender.send_to(&packet, group).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_groups_on_shared_port_stay_separate() {
        let prober = NetworkProber::new().unwrap();
        let live = ChannelDbModel::new("live", "udp://@239.77.0.1:46000");
        let silent = ChannelDbModel::new("silent", "udp://@239.77.0.2:46000");

        let stop = tokio_util::sync::CancellationToken::new();
        spawn_group_sender(SocketAddrV4::new(Ipv4Addr::new(239, 77, 0, 1), 46000), stop.clone());

        let settings = settings(1000);
        let (live_outcome, silent_outcome) = tokio::join!(
            prober.probe_once(&live, &settings),
            prober.probe_once(&silent, &settings),
        );
        stop.cancel();

        assert!(live_outcome.healthy, "{live_outcome:?}");
        assert!(!silent_outcome.healthy, "{silent_outcome:?}");
    }

    #[test]
    fn test_group_bind_keeps_port() {
        let group = SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5000);
        assert_eq!(group_bind_addr(group).port(), 5000);
    }

    #[tokio::test]
    async fn test_multicast_bad_address() {
        let prober = NetworkProber::new().unwrap();
        let channel = ChannelDbModel::new("bad", "udp://not-an-ip:5000");
        let outcome = prober.probe_once(&channel, &settings(300)).await;
        assert!(!outcome.healthy);
    }
}

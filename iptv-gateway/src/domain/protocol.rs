//! Source URL classification.

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::Error;

/// Port used when a multicast URL omits one.
pub const DEFAULT_MULTICAST_PORT: u16 = 5000;

/// Transport family of a channel source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StreamProtocol {
    Http,
    Https,
    Rtp,
    Udp,
}

impl StreamProtocol {
    pub fn is_multicast(self) -> bool {
        matches!(self, Self::Rtp | Self::Udp)
    }
}

/// Result of classifying a source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub protocol: StreamProtocol,
    pub multicast: bool,
    /// `host[:port]` of the multicast group, present iff `multicast`.
    pub address: Option<String>,
}

impl ProtocolInfo {
    /// Parse the multicast group into a socket address, filling in the default port.
    pub fn multicast_group(&self) -> crate::Result<SocketAddrV4> {
        let address = self
            .address
            .as_deref()
            .ok_or_else(|| Error::validation("not a multicast source"))?;

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::validation(format!("invalid multicast port in '{address}'")))?;
                (host, port)
            }
            None => (address, DEFAULT_MULTICAST_PORT),
        };

        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::validation(format!("invalid multicast address '{host}'")))?;
        if !ip.is_multicast() {
            return Err(Error::validation(format!("{ip} is not a multicast group")));
        }
        Ok(SocketAddrV4::new(ip, port))
    }
}

/// Classify a source URL.
///
/// The scheme is matched case-insensitively; anything unrecognized is treated
/// as plain http. For `rtp://` and `udp://` the scheme and the optional `@`
/// any-source marker are stripped, so `udp://@239.0.0.1:5000` and
/// `udp://239.0.0.1:5000` yield the same address.
pub fn classify(url: &str) -> ProtocolInfo {
    let url = url.trim();
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("", url),
    };

    let protocol = scheme.parse().unwrap_or(StreamProtocol::Http);
    if !protocol.is_multicast() {
        return ProtocolInfo {
            protocol,
            multicast: false,
            address: None,
        };
    }

    let rest = rest.strip_prefix('@').unwrap_or(rest);
    let address = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_string();

    ProtocolInfo {
        protocol,
        multicast: true,
        address: Some(address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://example.com/live.m3u8", StreamProtocol::Http, false)]
    #[case("https://example.com/live.ts", StreamProtocol::Https, false)]
    #[case("HTTPS://Example.com/live.ts", StreamProtocol::Https, false)]
    #[case("rtp://239.0.0.1:5000", StreamProtocol::Rtp, true)]
    #[case("RTP://239.0.0.1:5000", StreamProtocol::Rtp, true)]
    #[case("udp://@239.0.0.1:5000", StreamProtocol::Udp, true)]
    #[case("rtsp://camera.local/stream", StreamProtocol::Http, false)]
    #[case("example.com/live.ts", StreamProtocol::Http, false)]
    fn test_classify(#[case] url: &str, #[case] protocol: StreamProtocol, #[case] multicast: bool) {
        let info = classify(url);
        assert_eq!(info.protocol, protocol);
        assert_eq!(info.multicast, multicast);
        assert_eq!(info.address.is_some(), multicast);
    }

    #[test]
    fn test_any_source_marker_is_ignored() {
        let with_at = classify("udp://@239.0.0.1:5000");
        let without_at = classify("udp://239.0.0.1:5000");
        assert_eq!(with_at.address.as_deref(), Some("239.0.0.1:5000"));
        assert_eq!(with_at, without_at);
    }

    #[test]
    fn test_multicast_group_default_port() {
        let group = classify("rtp://239.1.2.3").multicast_group().unwrap();
        assert_eq!(group, SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5000));

        let group = classify("udp://@239.1.2.3:1234/").multicast_group().unwrap();
        assert_eq!(group.port(), 1234);
    }

    #[test]
    fn test_multicast_group_rejects_unicast_and_garbage() {
        assert!(classify("udp://10.0.0.1:5000").multicast_group().is_err());
        assert!(classify("udp://tv.local:5000").multicast_group().is_err());
        assert!(classify("udp://239.0.0.1:port").multicast_group().is_err());
        assert!(classify("http://239.0.0.1:5000").multicast_group().is_err());
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(StreamProtocol::Udp.to_string(), "udp");
        assert_eq!("Https".parse::<StreamProtocol>().unwrap(), StreamProtocol::Https);
    }
}

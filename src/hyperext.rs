// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use http::{header, uri, HeaderMap, Request, Uri};

/// Per-request facts about the connecting client, set by the logging
/// middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: IpAddr,

    /// True if the connection came from a trusted proxy, in which case the
    /// forwarding headers may be believed.
    pub via_proxy: bool,
}

pub trait RequestExt {
    /// Gets the scheme and authority the client used to reach us.
    fn base_uri(&self) -> uri::Builder;

    /// The client address recorded for this request, if any.
    fn client_info(&self) -> Option<ClientInfo>;
}

impl<B> RequestExt for Request<B> {
    fn base_uri(&self) -> uri::Builder {
        let via_proxy = self.client_info().is_some_and(|c| c.via_proxy);

        let scheme = self
            .uri()
            .scheme_str()
            .map(String::from)
            .or_else(|| {
                via_proxy
                    .then(|| header_str(self.headers(), "x-forwarded-proto"))
                    .flatten()
                    .map(String::from)
            })
            .unwrap_or_else(|| "http".into());

        let authority = self
            .uri()
            .authority()
            .map(|a| a.as_str().to_owned())
            .or_else(|| {
                via_proxy
                    .then(|| header_str(self.headers(), "x-forwarded-host"))
                    .flatten()
                    .map(String::from)
            })
            .or_else(|| {
                header_str(self.headers(), header::HOST.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| "localhost".into());

        Uri::builder().scheme(scheme.as_str()).authority(authority)
    }

    fn client_info(&self) -> Option<ClientInfo> {
        self.extensions().get::<ClientInfo>().copied()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR block `{0}`")]
pub struct CidrError(String);

/// An IPv4 or IPv6 network such as `10.0.0.0/8`. A bare address is a
/// single-host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix))
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CidrError(s.to_owned());
        let s = s.trim();

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                (addr, Some(prefix.parse::<u8>().map_err(|_| err())?))
            }
            None => (s, None),
        };

        let network: IpAddr = addr.parse().map_err(|_| err())?;
        let network = network.to_canonical();
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);

        if prefix > max {
            return Err(err());
        }

        Ok(Cidr { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Decides which address is the real client when requests may arrive through
/// reverse proxies.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    enabled: bool,
    cidrs: Vec<Cidr>,
}

impl TrustedProxies {
    pub fn new(enabled: bool, cidrs: Vec<Cidr>) -> Self {
        TrustedProxies { enabled, cidrs }
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|c| c.contains(ip))
    }

    /// Resolves the client address. `X-Forwarded-For` is only consulted when
    /// the connecting peer is itself a trusted proxy; the header is then
    /// walked from the right, skipping further trusted hops.
    pub fn client_info(&self, peer: IpAddr, headers: &HeaderMap) -> ClientInfo {
        let peer = peer.to_canonical();

        if !self.enabled || self.cidrs.is_empty() || !self.is_trusted(peer) {
            return ClientInfo {
                ip: peer,
                via_proxy: false,
            };
        }

        let hops = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let mut client = peer;
        for hop in hops.iter().rev() {
            let Ok(ip) = hop.parse::<IpAddr>() else {
                break;
            };
            client = ip.to_canonical();
            if !self.is_trusted(client) {
                break;
            }
        }

        ClientInfo {
            ip: client,
            via_proxy: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[test]
    fn cidr_matching() {
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(net.contains("::ffff:10.0.0.1".parse().unwrap()));

        let v6: Cidr = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("192.168.1.1".parse().unwrap()));

        let host: Cidr = "127.0.0.1".parse().unwrap();
        assert_eq!(host.to_string(), "127.0.0.1/32");

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("banana".parse::<Cidr>().is_err());
    }

    #[test]
    fn no_cidrs_means_peer_address() {
        let proxies = TrustedProxies::new(true, vec![]);
        let info = proxies
            .client_info("10.0.0.1".parse().unwrap(), &xff("1.2.3.4"));
        assert_eq!(info.ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(!info.via_proxy);
    }

    #[test]
    fn untrusted_peer_cannot_spoof() {
        let proxies =
            TrustedProxies::new(true, vec!["10.0.0.0/8".parse().unwrap()]);
        let info = proxies
            .client_info("203.0.113.9".parse().unwrap(), &xff("1.2.3.4"));
        assert_eq!(info.ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn trusted_chain_walked_from_the_right() {
        let proxies =
            TrustedProxies::new(true, vec!["10.0.0.0/8".parse().unwrap()]);
        let info = proxies.client_info(
            "10.0.0.1".parse().unwrap(),
            &xff("6.6.6.6, 1.2.3.4, 10.0.0.7"),
        );
        assert_eq!(info.ip, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert!(info.via_proxy);
    }

    #[test]
    fn disabled_flag_ignores_headers() {
        let proxies =
            TrustedProxies::new(false, vec!["10.0.0.0/8".parse().unwrap()]);
        let info = proxies
            .client_info("10.0.0.1".parse().unwrap(), &xff("1.2.3.4"));
        assert_eq!(info.ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn base_uri_from_host_header() {
        let req = Request::get("/acme/widgets/info/lfs/objects/batch")
            .header(header::HOST, "lfs.example.com")
            .body(())
            .unwrap();

        let uri = req.base_uri().path_and_query("/").build().unwrap();
        assert_eq!(uri.to_string(), "http://lfs.example.com/");
    }

    #[test]
    fn forwarded_proto_needs_trusted_proxy() {
        let mut req = Request::get("/")
            .header(header::HOST, "lfs.example.com")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();

        let uri = req.base_uri().path_and_query("/").build().unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));

        req.extensions_mut().insert(ClientInfo {
            ip: "1.2.3.4".parse().unwrap(),
            via_proxy: true,
        });
        let uri = req.base_uri().path_and_query("/").build().unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
    }
}

// Copyright 2024, The Tari Development Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! LAN classification (§4.5): loopback, link-local, admin-declared local nets, or a local
//! interface address are all considered LAN.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use cidr::AnyIpCidr;

const LOG_TARGET: &str = "connmgr::lan";

/// Provides the set of addresses bound to local interfaces. Implemented as a trait so tests can
/// substitute a fixed interface list instead of touching the real network stack.
pub trait InterfaceAddresses: Send + Sync {
    /// Returns `Err` on enumeration failure; callers fall back to `IpAddr::is_private`-style
    /// heuristics in that case (§4.5).
    fn local_addresses(&self) -> Result<Vec<IpAddr>, std::io::Error>;
}

/// Enumerates interfaces via `local-ip-address`-style OS lookups is out of scope here (no
/// dependency on a platform-specific crate); callers inject a concrete implementation, e.g. one
/// backed by `if_addrs` in a binary that embeds this crate.
pub struct NoInterfaces;

impl InterfaceAddresses for NoInterfaces {
    fn local_addresses(&self) -> Result<Vec<IpAddr>, std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no interface source configured"))
    }
}

pub struct LanClassifier<I: InterfaceAddresses> {
    always_local_nets: Vec<AnyIpCidr>,
    interfaces: I,
}

impl<I: InterfaceAddresses> LanClassifier<I> {
    pub fn new(always_local_nets: &[String], interfaces: I) -> Self {
        let always_local_nets = always_local_nets
            .iter()
            .filter_map(|s| {
                let parsed = s.parse::<AnyIpCidr>().ok();
                if parsed.is_none() {
                    log::warn!(target: LOG_TARGET, "ignoring unparsable alwaysLocalNets entry '{}'", s);
                }
                parsed
            })
            .collect();
        Self {
            always_local_nets,
            interfaces,
        }
    }

    /// `isLAN(addr)` (§4.5): loopback, link-local unicast, in a configured `alwaysLocalNets` CIDR,
    /// or matches a local interface address.
    pub fn is_lan(&self, addr: &IpAddr) -> bool {
        if addr.is_loopback() {
            return true;
        }
        if is_link_local_unicast(addr) {
            return true;
        }
        if self.always_local_nets.iter().any(|net| net.contains(addr)) {
            return true;
        }
        match self.interfaces.local_addresses() {
            Ok(locals) => locals.contains(addr),
            Err(err) => {
                log::debug!(
                    target: LOG_TARGET,
                    "interface enumeration failed ({}), falling back to is_private()",
                    err
                );
                is_private_fallback(addr)
            },
        }
    }

    /// `isLANHost(host)` (§4.5): resolves `host` first as a `host:port`-style TCP address, then as
    /// a plain IP literal, then applies [`LanClassifier::is_lan`].
    pub fn is_lan_host(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.is_lan(&ip);
        }
        // Try resolving as `host:0` via the std resolver (DNS or hosts file).
        let candidate = format!("{}:0", host);
        if let Ok(mut addrs) = candidate.to_socket_addrs() {
            if let Some(addr) = addrs.next() {
                return self.is_lan(&addr.ip());
            }
        }
        false
    }
}

fn is_link_local_unicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_private_fallback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// Helper for call sites that already have a resolved [`SocketAddr`] and just want the LAN flag.
pub fn classify_socket_addr<I: InterfaceAddresses>(classifier: &LanClassifier<I>, addr: &SocketAddr) -> bool {
    classifier.is_lan(&addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInterfaces(Vec<IpAddr>);
    impl InterfaceAddresses for FixedInterfaces {
        fn local_addresses(&self) -> Result<Vec<IpAddr>, std::io::Error> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn loopback_is_always_lan() {
        let classifier = LanClassifier::new(&[], NoInterfaces);
        assert!(classifier.is_lan(&"127.0.0.1".parse().unwrap()));
        assert!(classifier.is_lan(&"::1".parse().unwrap()));
    }

    #[test]
    fn configured_always_local_net_is_lan() {
        let classifier = LanClassifier::new(&["203.0.113.0/24".to_string()], NoInterfaces);
        assert!(classifier.is_lan(&"203.0.113.42".parse().unwrap()));
        assert!(!classifier.is_lan(&"203.0.114.42".parse().unwrap()));
    }

    #[test]
    fn interface_address_match_is_lan() {
        let mine: IpAddr = "198.51.100.7".parse().unwrap();
        let classifier = LanClassifier::new(&[], FixedInterfaces(vec![mine]));
        assert!(classifier.is_lan(&mine));
        assert!(!classifier.is_lan(&"198.51.100.8".parse().unwrap()));
    }

    #[test]
    fn enumeration_failure_falls_back_to_is_private() {
        let classifier = LanClassifier::new(&[], NoInterfaces);
        assert!(classifier.is_lan(&"192.168.1.5".parse().unwrap()));
        assert!(!classifier.is_lan(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn is_lan_host_resolves_ip_literal() {
        let classifier = LanClassifier::new(&[], NoInterfaces);
        assert!(classifier.is_lan_host("127.0.0.1"));
    }
}

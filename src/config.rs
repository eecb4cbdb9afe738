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

//! Recognised configuration surface (§3, §6): per-device settings, global options, and the URI
//! type dialers/listeners are constructed from.

use std::{net::IpAddr, str::FromStr};

use cidr::AnyIpCidr;
use serde::{Deserialize, Serialize};

use crate::device_id::DeviceID;

/// Literal address value meaning "ask the discoverer" (§3, §4.1.1).
pub const DYNAMIC_ADDRESS: &str = "dynamic";

/// Per-device compression preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Metadata,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceID,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_compression")]
    pub compression: Compression,
    #[serde(default)]
    pub cert_name: String,
    #[serde(default)]
    pub max_recv_kbps: i64,
    #[serde(default)]
    pub max_send_kbps: i64,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
    #[serde(default)]
    pub num_connections: u8,
}

fn default_compression() -> Compression {
    Compression::Metadata
}

impl DeviceConfig {
    /// Number of simultaneous connections desired for this device, §3/§4.1: `0` means "single".
    pub fn desired_connections(&self) -> usize {
        self.num_connections.max(1) as usize
    }

    pub fn recv_limit_bytes_per_sec(&self) -> Option<u32> {
        kbps_to_bytes_per_sec(self.max_recv_kbps)
    }

    pub fn send_limit_bytes_per_sec(&self) -> Option<u32> {
        kbps_to_bytes_per_sec(self.max_send_kbps)
    }

    pub fn effective_cert_name(&self) -> &str {
        if self.cert_name.is_empty() {
            DEFAULT_CERT_NAME
        } else {
            &self.cert_name
        }
    }

    /// True when every configured address is a `"dynamic"` placeholder or a `relay://`/
    /// `dynamic+http(s)` URI, i.e. the device has no stable direct address (§4.1.2: such devices
    /// churn more and sort to the end of the dial queue).
    pub fn is_short_lived(&self) -> bool {
        !self.addresses.is_empty()
            && self.addresses.iter().all(|a| {
                let trimmed = a.trim();
                trimmed == DYNAMIC_ADDRESS || trimmed.starts_with("relay://") || trimmed.starts_with("dynamic+")
            })
    }
}

/// `cert_name` default when a device config leaves the field empty (§4.2 step 4).
pub const DEFAULT_CERT_NAME: &str = "syncthing";

fn kbps_to_bytes_per_sec(kbps: i64) -> Option<u32> {
    if kbps <= 0 {
        None
    } else {
        Some((kbps as u64 * 1024).min(u32::MAX as u64) as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalOptions {
    #[serde(default)]
    pub listen_addresses: Vec<String>,
    #[serde(default = "default_reconnect_interval_s")]
    pub reconnect_interval_s: u64,
    #[serde(default = "default_relay_reconnect_interval_m")]
    pub relay_reconnect_interval_m: u64,
    #[serde(default)]
    pub max_recv_kbps: i64,
    #[serde(default)]
    pub max_send_kbps: i64,
    #[serde(default)]
    pub limit_bandwidth_in_lan: bool,
    #[serde(default)]
    pub always_local_nets: Vec<String>,
    #[serde(default)]
    pub announce_lan_addresses: bool,
    #[serde(default = "default_priority_tcp_lan")]
    pub connection_priority_tcp_lan: i32,
    #[serde(default = "default_priority_tcp_wan")]
    pub connection_priority_tcp_wan: i32,
    #[serde(default = "default_priority_quic_lan")]
    pub connection_priority_quic_lan: i32,
    #[serde(default = "default_priority_quic_wan")]
    pub connection_priority_quic_wan: i32,
    #[serde(default = "default_priority_relay")]
    pub connection_priority_relay: i32,
    #[serde(default = "default_upgrade_threshold")]
    pub connection_priority_upgrade_threshold: i32,
    #[serde(default = "default_connection_limit_max")]
    pub connection_limit_max: usize,
    #[serde(default = "default_connection_limit_enough")]
    pub connection_limit_enough: usize,
    #[serde(default)]
    pub traffic_class: u8,
    #[serde(default)]
    pub nat_enabled: bool,
    #[serde(default = "default_stun_keepalive_min_s")]
    pub stun_keepalive_min_s: u64,
    #[serde(default = "default_stun_keepalive_start_s")]
    pub stun_keepalive_start_s: u64,
}

fn default_reconnect_interval_s() -> u64 {
    60
}
fn default_relay_reconnect_interval_m() -> u64 {
    10
}
fn default_priority_tcp_lan() -> i32 {
    10
}
fn default_priority_tcp_wan() -> i32 {
    30
}
fn default_priority_quic_lan() -> i32 {
    20
}
fn default_priority_quic_wan() -> i32 {
    40
}
fn default_priority_relay() -> i32 {
    200
}
fn default_upgrade_threshold() -> i32 {
    5
}
fn default_connection_limit_max() -> usize {
    crate::connection::MAX_NUM_CONNECTIONS
}
fn default_connection_limit_enough() -> usize {
    0
}
fn default_stun_keepalive_min_s() -> u64 {
    10
}
fn default_stun_keepalive_start_s() -> u64 {
    180
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            listen_addresses: Vec::new(),
            reconnect_interval_s: default_reconnect_interval_s(),
            relay_reconnect_interval_m: default_relay_reconnect_interval_m(),
            max_recv_kbps: 0,
            max_send_kbps: 0,
            limit_bandwidth_in_lan: false,
            always_local_nets: Vec::new(),
            announce_lan_addresses: false,
            connection_priority_tcp_lan: default_priority_tcp_lan(),
            connection_priority_tcp_wan: default_priority_tcp_wan(),
            connection_priority_quic_lan: default_priority_quic_lan(),
            connection_priority_quic_wan: default_priority_quic_wan(),
            connection_priority_relay: default_priority_relay(),
            connection_priority_upgrade_threshold: default_upgrade_threshold(),
            connection_limit_max: default_connection_limit_max(),
            connection_limit_enough: default_connection_limit_enough(),
            traffic_class: 0,
            nat_enabled: true,
            stun_keepalive_min_s: default_stun_keepalive_min_s(),
            stun_keepalive_start_s: default_stun_keepalive_start_s(),
        }
    }
}

/// A full configuration snapshot, as published by the configuration wrapper (§6). `ignored_devices`
/// is the admin-maintained deny-list a device can be placed on without being removed from
/// `devices` entirely (§4.2 step 3's "ignored device list" early-rejection check, §7
/// `DeviceIgnored`).
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub devices: Vec<DeviceConfig>,
    pub options: GlobalOptions,
    pub ignored_devices: std::collections::HashSet<DeviceID>,
}

impl Configuration {
    pub fn device(&self, id: &DeviceID) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| &d.device_id == id)
    }

    pub fn is_ignored(&self, id: &DeviceID) -> bool {
        self.ignored_devices.contains(id)
    }
}

/// Transport scheme parsed out of a [`Uri`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Tcp4,
    Tcp6,
    Quic,
    Quic4,
    Quic6,
    Relay,
    DynamicHttp,
    DynamicHttps,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp | Scheme::Tcp4 | Scheme::Tcp6 => 22000,
            Scheme::Quic | Scheme::Quic4 | Scheme::Quic6 => 22000,
            Scheme::Relay => 443,
            Scheme::DynamicHttp => 80,
            Scheme::DynamicHttps => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tcp4 => "tcp4",
            Scheme::Tcp6 => "tcp6",
            Scheme::Quic => "quic",
            Scheme::Quic4 => "quic4",
            Scheme::Quic6 => "quic6",
            Scheme::Relay => "relay",
            Scheme::DynamicHttp => "dynamic+http",
            Scheme::DynamicHttps => "dynamic+https",
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Scheme::DynamicHttp | Scheme::DynamicHttps)
    }
}

impl FromStr for Scheme {
    type Err = UriParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "tcp4" => Ok(Scheme::Tcp4),
            "tcp6" => Ok(Scheme::Tcp6),
            "quic" => Ok(Scheme::Quic),
            "quic4" => Ok(Scheme::Quic4),
            "quic6" => Ok(Scheme::Quic6),
            "relay" => Ok(Scheme::Relay),
            "dynamic+http" => Ok(Scheme::DynamicHttp),
            "dynamic+https" => Ok(Scheme::DynamicHttps),
            other => Err(UriParseError::UnknownScheme(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriParseError {
    #[error("unknown scheme '{0}'")]
    UnknownScheme(String),
    #[error("missing '://' separator")]
    MissingSeparator,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// A parsed `scheme://host[:port]` address (§3). Port may be absent; [`Uri::fixup_port`] fills in
/// the scheme's default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
}

impl Uri {
    pub fn parse(s: &str) -> Result<Self, UriParseError> {
        let (scheme_str, rest) = s.split_once("://").ok_or(UriParseError::MissingSeparator)?;
        let scheme: Scheme = scheme_str.parse()?;

        // IPv6 literal: [addr]:port or [addr]
        if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or(UriParseError::EmptyHost)?;
            let host = &stripped[..end];
            if host.is_empty() {
                return Err(UriParseError::EmptyHost);
            }
            let after = &stripped[end + 1..];
            let port = match after.strip_prefix(':') {
                Some("") | None => None,
                Some(p) => Some(p.parse::<u16>().map_err(|_| UriParseError::InvalidPort(p.to_string()))?),
            };
            return Ok(Uri {
                scheme,
                host: host.to_string(),
                port,
            });
        }

        match rest.rsplit_once(':') {
            Some((host, port_str)) if !host.is_empty() => {
                if port_str.is_empty() {
                    Ok(Uri {
                        scheme,
                        host: host.to_string(),
                        port: None,
                    })
                } else {
                    let port = port_str
                        .parse::<u16>()
                        .map_err(|_| UriParseError::InvalidPort(port_str.to_string()))?;
                    Ok(Uri {
                        scheme,
                        host: host.to_string(),
                        port: Some(port),
                    })
                }
            },
            _ => {
                if rest.is_empty() {
                    Err(UriParseError::EmptyHost)
                } else {
                    Ok(Uri {
                        scheme,
                        host: rest.to_string(),
                        port: None,
                    })
                }
            },
        }
    }

    /// Returns a copy with an absent/empty port replaced by `default_port`; a no-op if a port is
    /// already present. Idempotent: `parse(fixup(s)) == fixup(parse(s))` (§8).
    pub fn with_port_fixed_up(&self, default_port: u16) -> Uri {
        Uri {
            scheme: self.scheme,
            host: self.host.clone(),
            port: Some(self.port.unwrap_or(default_port)),
        }
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host_is_v6 = self.host.contains(':');
        match self.port {
            Some(port) if host_is_v6 => write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, port),
            Some(port) => write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, port),
            None if host_is_v6 => write!(f, "{}://[{}]", self.scheme.as_str(), self.host),
            None => write!(f, "{}://{}", self.scheme.as_str(), self.host),
        }
    }
}

/// Fixes up the port on a URI string and default, returning the canonical string form (§8
/// scenario 1). Idempotent and host-identity-preserving.
pub fn fixup_port(uri_str: &str, default_port: u16) -> Result<String, UriParseError> {
    let uri = Uri::parse(uri_str)?;
    Ok(uri.with_port_fixed_up(default_port).to_string())
}

/// One allowed/denied network rule: a CIDR, optionally negated with a leading `!` (§3, §4.1.1).
#[derive(Debug, Clone)]
struct NetworkRule {
    negate: bool,
    cidr: AnyIpCidr,
}

fn parse_rule(raw: &str) -> Option<NetworkRule> {
    let (negate, cidr_str) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let cidr = cidr_str.parse::<AnyIpCidr>().ok()?;
    Some(NetworkRule { negate, cidr })
}

/// Order-sensitive CIDR allow/deny check (§4.1.1, §8): the first matching rule decides. An empty
/// rule list means "no restriction" and always allows.
pub fn is_allowed_network(host: &IpAddr, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    for raw in allowed {
        let Some(rule) = parse_rule(raw) else { continue };
        if rule.cidr.contains(host) {
            return !rule.negate;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixup_port_fills_in_default_and_is_idempotent() {
        let once = fixup_port("tcp://1.2.3.4:", 22000).unwrap();
        assert_eq!(once, "tcp://1.2.3.4:22000");
        let twice = fixup_port(&once, 22000).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn fixup_port_handles_ipv6_zone_literal() {
        let once = fixup_port("tcp://[fe80::1%25abc]", 22000).unwrap();
        assert_eq!(once, "tcp://[fe80::1%25abc]:22000");
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert_eq!(
            Uri::parse("http://example.com"),
            Err(UriParseError::UnknownScheme("http".into()))
        );
    }

    #[test]
    fn allowed_network_order_sensitive() {
        let host: IpAddr = "10.20.30.40".parse().unwrap();
        let deny_first = vec!["!10.20.30.0/24".to_string(), "10.0.0.0/8".to_string()];
        assert!(!is_allowed_network(&host, &deny_first));

        let allow_first = vec!["10.0.0.0/8".to_string(), "!10.20.30.0/24".to_string()];
        assert!(is_allowed_network(&host, &allow_first));
    }

    #[test]
    fn empty_allowed_networks_allows_everything() {
        let host: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(is_allowed_network(&host, &[]));
    }
}

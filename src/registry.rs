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

//! Transport registry (§4.3, §4.3.1): maps a URI scheme to the dialer/listener factory that
//! handles it, and lets dialers/listeners within the same scheme family share an underlying
//! endpoint (a QUIC `quinn::Endpoint`, for instance) rather than each opening their own socket.
//!
//! Modeled as an explicit `TransportTable` built once at startup (Design Notes §9), not a
//! package-init global, so tests can substitute a table per-test.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Duration};

use crate::{
    config::{Scheme, Uri},
    connection::{ConnectionId, DialTarget, IncomingConn, IntermediateConn},
    device_id::DeviceID,
    error::DialError,
};

/// An opaque, scheme-specific shared endpoint (e.g. a bound `quinn::Endpoint`) that both a
/// dialer and a listener in the same family can use (§4.3.1).
pub trait SharedEndpoint: Send + Sync {
    /// The local address this endpoint is bound to, used for the unspecified-address tie-break.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Recovers the concrete endpoint type (e.g. `QuicEndpoint`) so a family-specific dialer can
    /// use it directly instead of working through the opaque trait object.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A dialer for one URI scheme family (§4.3).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, device_id: &DeviceID, target: &DialTarget) -> Result<IntermediateConn, DialError>;

    /// Priority to offer for dialing `host` (lower is better); LAN bonuses are applied by the
    /// caller (§4.1.1), not inside the dialer.
    fn priority(&self, host: &str) -> i32;

    fn redial_frequency(&self) -> Duration;

    fn allows_multiple_connections(&self) -> bool {
        false
    }
}

/// A listener for one URI scheme family (§4.3).
#[async_trait]
pub trait Listener: Send + Sync {
    /// Runs the accept loop until it fails fatally, handing each accepted, post-TLS connection to
    /// `accept_tx` for the handshake pipeline to pick up (§5's accept channel). Takes the sender as
    /// a parameter, mirroring [`Dialer::dial`], rather than storing it at construction: the service
    /// is the channel's sole owner and the sole caller of `serve`.
    async fn serve(self: Arc<Self>, accept_tx: mpsc::Sender<IncomingConn>) -> Result<(), DialError>;

    fn uri(&self) -> Uri;

    fn lan_addresses(&self) -> Vec<Uri>;

    fn wan_addresses(&self) -> Vec<Uri>;

    fn last_error(&self) -> Option<String>;
}

/// Builds a [`Dialer`] for a scheme, validating the family's applicability against current
/// configuration (§4.3's `DialerFactory`).
pub trait DialerFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this family always reports WAN priority (relays never receive the LAN bonus,
    /// §4.1.1).
    fn always_wan(&self) -> bool {
        false
    }

    fn new_dialer(&self, registry: &Registry) -> Result<Arc<dyn Dialer>, DialError>;

    /// This family's best-case priority, used by the connect loop to decide whether a device
    /// already has a connection good enough that dialing it further can't possibly improve things
    /// (§4.1.1's `bestDialerPriority`). Doesn't require instantiating a dialer or knowing a host.
    fn best_possible_priority(&self) -> i32;
}

/// Builds a [`Listener`] for a scheme (§4.3's `ListenerFactory`).
pub trait ListenerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn new_listener(&self, uri: &Uri, registry: &Registry) -> Result<Arc<dyn Listener>, DialError>;
}

/// Process-wide (but owned, not a global) table mapping scheme → registered factories and shared
/// endpoints (§4.3.1). Constructed once at startup and threaded through the orchestrator and
/// listener supervisors.
#[derive(Default)]
pub struct Registry {
    dialer_factories: HashMap<Scheme, Arc<dyn DialerFactory>>,
    listener_factories: HashMap<Scheme, Arc<dyn ListenerFactory>>,
    endpoints: HashMap<Scheme, Vec<Arc<dyn SharedEndpoint>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_dialer_factory(&mut self, scheme: Scheme, factory: Arc<dyn DialerFactory>) {
        self.dialer_factories.insert(scheme, factory);
    }

    pub fn register_listener_factory(&mut self, scheme: Scheme, factory: Arc<dyn ListenerFactory>) {
        self.listener_factories.insert(scheme, factory);
    }

    pub fn dialer_factory(&self, scheme: Scheme) -> Option<Arc<dyn DialerFactory>> {
        self.dialer_factories.get(&scheme).cloned()
    }

    pub fn listener_factory(&self, scheme: Scheme) -> Option<Arc<dyn ListenerFactory>> {
        self.listener_factories.get(&scheme).cloned()
    }

    /// Registers a shared endpoint under `scheme`, to be discoverable via
    /// [`Registry::shared_endpoint`] by dialers of the same family (§4.3.1).
    pub fn register_endpoint(&mut self, scheme: Scheme, endpoint: Arc<dyn SharedEndpoint>) {
        self.endpoints.entry(scheme).or_default().push(endpoint);
    }

    /// Looks up a shared endpoint for `scheme`: for the QUIC family (`quic`, `quic4`, `quic6`)
    /// the longest scheme-prefix match wins (an exact `quic4`/`quic6` endpoint beats a generic
    /// `quic` one), with ties broken in favour of endpoints bound to an unspecified local address
    /// (§4.3.1, preferable for NAT punching).
    pub fn shared_endpoint(&self, scheme: Scheme) -> Option<Arc<dyn SharedEndpoint>> {
        let candidates = self.candidate_schemes(scheme);
        for candidate in candidates {
            if let Some(endpoints) = self.endpoints.get(&candidate) {
                if let Some(best) = pick_best_endpoint(endpoints) {
                    return Some(best);
                }
            }
        }
        None
    }

    /// The best priority any registered dialer family could possibly offer (§4.1.1's
    /// `bestDialerPriority`), used to decide whether a device's existing connections are already
    /// good enough that no dial attempt could improve on them. `i32::MAX` (worst possible) if no
    /// dialer factories are registered at all.
    pub fn best_dialer_priority(&self) -> i32 {
        self.dialer_factories
            .values()
            .map(|f| f.best_possible_priority())
            .min()
            .unwrap_or(i32::MAX)
    }

    fn candidate_schemes(&self, scheme: Scheme) -> Vec<Scheme> {
        use Scheme::*;
        match scheme {
            Quic4 => vec![Quic4, Quic],
            Quic6 => vec![Quic6, Quic],
            Quic => vec![Quic],
            other => vec![other],
        }
    }
}

fn pick_best_endpoint(endpoints: &[Arc<dyn SharedEndpoint>]) -> Option<Arc<dyn SharedEndpoint>> {
    endpoints
        .iter()
        .max_by_key(|ep| ep.local_addr().map(|a| a.ip().is_unspecified()).unwrap_or(false))
        .cloned()
}

/// A connection's stream paired with the connection ID minted for it; returned by `Dialer::dial`
/// implementations that need to surface the ID alongside the `IntermediateConn` before the
/// handshake pipeline re-derives it (kept for symmetry with the handleConns path, §4.2 step 5).
pub struct DialedConnection {
    pub conn: IntermediateConn,
    pub connection_id: ConnectionId,
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    struct FixedEndpoint(Option<SocketAddr>);
    impl SharedEndpoint for FixedEndpoint {
        fn local_addr(&self) -> Option<SocketAddr> {
            self.0
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn quic4_prefers_exact_family_endpoint_over_generic_quic() {
        let mut registry = Registry::new();
        let specific: Arc<dyn SharedEndpoint> = Arc::new(FixedEndpoint(Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(127, 0, 0, 1),
            1234,
        )))));
        let generic: Arc<dyn SharedEndpoint> = Arc::new(FixedEndpoint(Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(0, 0, 0, 0),
            5678,
        )))));
        registry.register_endpoint(Scheme::Quic, generic);
        registry.register_endpoint(Scheme::Quic4, specific.clone());

        let found = registry.shared_endpoint(Scheme::Quic4).unwrap();
        assert_eq!(found.local_addr(), specific.local_addr());
    }

    #[test]
    fn ties_prefer_unspecified_local_address() {
        let mut registry = Registry::new();
        let specific_bound: Arc<dyn SharedEndpoint> = Arc::new(FixedEndpoint(Some(SocketAddr::V4(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 1111),
        ))));
        let unspecified: Arc<dyn SharedEndpoint> = Arc::new(FixedEndpoint(Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(0, 0, 0, 0),
            2222,
        )))));
        registry.register_endpoint(Scheme::Quic, specific_bound);
        registry.register_endpoint(Scheme::Quic, unspecified.clone());

        let found = registry.shared_endpoint(Scheme::Quic).unwrap();
        assert_eq!(found.local_addr(), unspecified.local_addr());
    }

    #[test]
    fn missing_scheme_returns_none() {
        let registry = Registry::new();
        assert!(registry.shared_endpoint(Scheme::Tcp).is_none());
    }
}

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

//! Relay transport (§4.3 "Per-family specifics", §6's `Relay client` collaborator): dials go via
//! an HTTPS/TLS handshake with a relay controller, which issues an invitation that is then used to
//! join a relayed, TCP-like session; the real peer-to-peer TLS handshake happens over that
//! session, same as the direct transports. `dynamic+http(s)` pseudo-schemes resolve through an
//! external pool (out of scope, §1) to a concrete relay URI.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    config::Uri,
    connection::{ConnectionDirection, ConnectionId, ConnectionType, DialTarget, IncomingConn, IntermediateConn},
    device_id::DeviceID,
    error::DialError,
    registry::{Dialer, DialerFactory, Listener, ListenerFactory, Registry},
    restart_supervisor::{RestartDecision, RestartSupervisor},
};

const LOG_TARGET: &str = "connmgr::transports::relay";
const INVITATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A one-shot relay-issued token authorising two parties to join the same session (§6, glossary).
#[derive(Debug, Clone)]
pub struct Invitation {
    pub session_id: String,
    pub server_socket: bool,
    pub relay_addr: String,
}

/// External relay client collaborator (§6): out of scope to implement the relay protocol itself
/// (§1), this crate only defines the shape it dials against.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn get_invitation(&self, uri: &Uri, device_id: &DeviceID) -> anyhow::Result<Invitation>;

    async fn join_session(&self, invitation: &Invitation) -> anyhow::Result<Box<dyn crate::connection::StreamLike>>;

    /// Blocks until a peer joins a session on this listener's long-lived control connection,
    /// returning the relayed, TCP-like stream for that session (§4.3: listeners "receive
    /// invitations as an async stream").
    async fn accept_session(&self) -> anyhow::Result<Box<dyn crate::connection::StreamLike>>;
}

pub struct RelayDialerFactory {
    relay_client: Arc<dyn RelayClient>,
    connector: TlsConnector,
    priority: i32,
}

impl RelayDialerFactory {
    pub fn new(relay_client: Arc<dyn RelayClient>, connector: TlsConnector, priority: i32) -> Self {
        Self {
            relay_client,
            connector,
            priority,
        }
    }
}

impl DialerFactory for RelayDialerFactory {
    fn name(&self) -> &str {
        "relay"
    }

    /// Relays never receive the LAN priority bonus (§4.1.1: "Relay-type factories that always
    /// report WAN never receive this bonus").
    fn always_wan(&self) -> bool {
        true
    }

    fn new_dialer(&self, _registry: &Registry) -> Result<Arc<dyn Dialer>, DialError> {
        Ok(Arc::new(RelayDialer {
            relay_client: self.relay_client.clone(),
            connector: self.connector.clone(),
            priority: self.priority,
        }))
    }

    fn best_possible_priority(&self) -> i32 {
        self.priority
    }
}

pub struct RelayDialer {
    relay_client: Arc<dyn RelayClient>,
    connector: TlsConnector,
    priority: i32,
}

#[async_trait]
impl Dialer for RelayDialer {
    async fn dial(&self, device_id: &DeviceID, target: &DialTarget) -> Result<IntermediateConn, DialError> {
        let invitation = tokio::time::timeout(INVITATION_TIMEOUT, self.relay_client.get_invitation(&target.uri, device_id))
            .await
            .map_err(|_| DialError::Timeout(target.address.clone()))?
            .map_err(|e| DialError::Io(target.address.clone(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let relayed_stream = self
            .relay_client
            .join_session(&invitation)
            .await
            .map_err(|e| DialError::Io(target.address.clone(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        // The peer-to-peer TLS handshake happens over the relayed, TCP-like stream exactly as it
        // would over a direct socket (§4.3: "resulting in a relayed TCP-like stream over which the
        // peer-to-peer TLS handshake is then performed"), here in the transport layer so every
        // family hands the pipeline an already-secured `IntermediateConn` (§3's invariant).
        let server_name = rustls::ServerName::try_from(invitation.relay_addr.as_str())
            .map_err(|_| DialError::ParseError(invitation.relay_addr.clone()))?;
        let tls_stream = self
            .connector
            .connect(server_name, relayed_stream)
            .await
            .map_err(|e| DialError::Io(invitation.relay_addr.clone(), e))?;

        let (_, session) = tls_stream.get_ref();
        let remote_cert_der = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.0.clone())
            .unwrap_or_default();

        Ok(IntermediateConn {
            stream: Box::new(tls_stream),
            conn_type: ConnectionType::RelayClient,
            priority: self.priority,
            is_local: false,
            connection_id: ConnectionId::generate(0, 0),
            remote_cert_der,
            remote_addr: invitation.relay_addr,
        })
    }

    fn priority(&self, _host: &str) -> i32 {
        self.priority
    }

    fn redial_frequency(&self) -> Duration {
        Duration::from_secs(10 * 60) // relayReconnectIntervalM default (§3)
    }
}

/// Long-lived control connection to a relay, receiving invitations as they arrive (§4.3:
/// "Listeners establish a long-lived control connection to the relay and receive invitations as
/// an async stream").
pub struct RelayListenerFactory {
    relay_client: Arc<dyn RelayClient>,
    acceptor: TlsAcceptor,
    priority: i32,
}

impl RelayListenerFactory {
    pub fn new(relay_client: Arc<dyn RelayClient>, acceptor: TlsAcceptor, priority: i32) -> Self {
        Self {
            relay_client,
            acceptor,
            priority,
        }
    }
}

impl ListenerFactory for RelayListenerFactory {
    fn name(&self) -> &str {
        "relay-listener"
    }

    fn new_listener(&self, uri: &Uri, _registry: &Registry) -> Result<Arc<dyn Listener>, DialError> {
        Ok(Arc::new(RelayTransportListener {
            uri: uri.clone(),
            relay_client: self.relay_client.clone(),
            acceptor: self.acceptor.clone(),
            priority: self.priority,
            last_error: Mutex::new(None),
        }))
    }
}

pub struct RelayTransportListener {
    uri: Uri,
    relay_client: Arc<dyn RelayClient>,
    acceptor: TlsAcceptor,
    priority: i32,
    last_error: Mutex<Option<String>>,
}

#[async_trait]
impl Listener for RelayTransportListener {
    async fn serve(self: Arc<Self>, accept_tx: mpsc::Sender<IncomingConn>) -> Result<(), DialError> {
        // The actual invitation stream is supplied by the `RelayClient` collaborator (§6); this
        // listener's job is to accept relayed sessions as they arrive and hand each one, once
        // secured, to the handshake pipeline (§4.3).
        let mut supervisor = RestartSupervisor::new();
        loop {
            match self.relay_client.accept_session().await {
                Ok(relayed_stream) => {
                    supervisor.note_accept_success();
                    let acceptor = self.acceptor.clone();
                    let priority = self.priority;
                    let accept_tx = accept_tx.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(relayed_stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(err) => {
                                log::debug!(target: LOG_TARGET, "relay session TLS accept failed: {}", err);
                                return;
                            },
                        };
                        let (_, session) = tls_stream.get_ref();
                        let remote_cert_der = session
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(|c| c.0.clone())
                            .unwrap_or_default();

                        let conn = IntermediateConn {
                            stream: Box::new(tls_stream),
                            conn_type: ConnectionType::RelayServer,
                            priority,
                            is_local: false,
                            connection_id: ConnectionId::generate(0, 0),
                            remote_cert_der,
                            remote_addr: String::new(),
                        };
                        let _ = accept_tx
                            .send(IncomingConn {
                                conn,
                                direction: ConnectionDirection::Inbound,
                            })
                            .await;
                    });
                },
                Err(err) => {
                    *self.last_error.lock() = Some(err.to_string());
                    log::warn!(target: LOG_TARGET, "relay session accept error: {}", err);
                    if supervisor.note_accept_failure() {
                        match supervisor.on_restart(std::time::Instant::now()) {
                            RestartDecision::RestartNow => {
                                log::warn!(target: LOG_TARGET, "too many consecutive relay accept failures, restarting control connection");
                            },
                            RestartDecision::BackOff { for_ } => {
                                log::warn!(target: LOG_TARGET, "relay listener backing off for {:?} after repeated restarts", for_);
                                tokio::time::sleep(for_).await;
                            },
                        }
                    }
                },
            }
        }
    }

    fn uri(&self) -> Uri {
        self.uri.clone()
    }

    fn lan_addresses(&self) -> Vec<Uri> {
        Vec::new()
    }

    fn wan_addresses(&self) -> Vec<Uri> {
        vec![self.uri.clone()]
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

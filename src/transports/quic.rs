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

//! QUIC transport (§4.3 "Per-family specifics", §4.3.1): one UDP socket per listener, shared
//! between dialer and listener through the [`Registry`] so outgoing QUIC sessions reuse the
//! listen socket (helps NAT punching and keeps a single STUN-mapped external address).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use tokio::sync::mpsc;

use crate::{
    config::Uri,
    connection::{ConnectionDirection, ConnectionId, ConnectionType, DialTarget, IncomingConn, IntermediateConn},
    device_id::DeviceID,
    error::DialError,
    lan::{InterfaceAddresses, LanClassifier},
    registry::{Dialer, DialerFactory, Listener, ListenerFactory, Registry, SharedEndpoint},
    restart_supervisor::{RestartDecision, RestartSupervisor},
};

const LOG_TARGET: &str = "connmgr::transports::quic";
/// Dial timeout for QUIC sessions (§4.3: "Dials operate under a 10-second timeout").
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps a bound `quinn::Endpoint` so it can be registered as a [`SharedEndpoint`] (§4.3.1).
pub struct QuicEndpoint {
    pub endpoint: Endpoint,
}

impl SharedEndpoint for QuicEndpoint {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct QuicDialerFactory<I: InterfaceAddresses> {
    lan: Arc<LanClassifier<I>>,
    client_config: ClientConfig,
    priority_lan: i32,
    priority_wan: i32,
    scheme: crate::config::Scheme,
}

impl<I: InterfaceAddresses + 'static> QuicDialerFactory<I> {
    pub fn new(
        lan: Arc<LanClassifier<I>>,
        client_config: ClientConfig,
        priority_lan: i32,
        priority_wan: i32,
        scheme: crate::config::Scheme,
    ) -> Self {
        Self {
            lan,
            client_config,
            priority_lan,
            priority_wan,
            scheme,
        }
    }
}

impl<I: InterfaceAddresses + 'static> DialerFactory for QuicDialerFactory<I> {
    fn name(&self) -> &str {
        "quic"
    }

    fn new_dialer(&self, registry: &Registry) -> Result<Arc<dyn Dialer>, DialError> {
        let shared = registry
            .shared_endpoint(self.scheme)
            .ok_or_else(|| DialError::Unsupported("no shared QUIC endpoint registered".to_string()))?;
        Ok(Arc::new(QuicDialer {
            lan: self.lan.clone(),
            client_config: self.client_config.clone(),
            priority_lan: self.priority_lan,
            priority_wan: self.priority_wan,
            shared,
        }))
    }

    fn best_possible_priority(&self) -> i32 {
        self.priority_lan.min(self.priority_wan)
    }
}

pub struct QuicDialer<I: InterfaceAddresses> {
    lan: Arc<LanClassifier<I>>,
    client_config: ClientConfig,
    priority_lan: i32,
    priority_wan: i32,
    shared: Arc<dyn SharedEndpoint>,
}

#[async_trait]
impl<I: InterfaceAddresses + 'static> Dialer for QuicDialer<I> {
    async fn dial(&self, _device_id: &DeviceID, target: &DialTarget) -> Result<IntermediateConn, DialError> {
        let addr = format!("{}:{}", target.uri.host, target.uri.port.unwrap_or(target.uri.scheme.default_port()));
        let socket_addr: SocketAddr = addr.parse().map_err(|_| DialError::ParseError(addr.clone()))?;

        // The shared endpoint lives in the Registry keyed by scheme (§4.3.1); dialers don't open
        // their own UDP socket, they reuse the listener's.
        let endpoint = registry_endpoint(&self.shared)?;

        let connecting = endpoint
            .connect_with(self.client_config.clone(), socket_addr, &target.uri.host)
            .map_err(|e| DialError::ParseError(e.to_string()))?;

        let connection = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| DialError::Timeout(addr.clone()))?
            .map_err(|e| DialError::Io(addr.clone(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| DialError::Io(addr.clone(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let remote_cert_der = connection
            .peer_identity()
            .and_then(|identity| identity.downcast::<Vec<rustls::Certificate>>().ok())
            .and_then(|certs| certs.first().cloned())
            .map(|c| c.0)
            .unwrap_or_default();

        let is_local = self.lan.is_lan(&socket_addr.ip());

        Ok(IntermediateConn {
            stream: Box::new(QuicBiStream { send, recv }),
            conn_type: ConnectionType::QuicClient,
            priority: self.priority(&target.uri.host),
            is_local,
            connection_id: ConnectionId::generate(0, 0),
            remote_cert_der,
            remote_addr: addr,
        })
    }

    fn priority(&self, host: &str) -> i32 {
        if self.lan.is_lan_host(host) {
            self.priority_lan
        } else {
            self.priority_wan
        }
    }

    fn redial_frequency(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn allows_multiple_connections(&self) -> bool {
        true
    }
}

fn registry_endpoint(shared: &Arc<dyn SharedEndpoint>) -> Result<Endpoint, DialError> {
    shared
        .as_any()
        .downcast_ref::<QuicEndpoint>()
        .map(|qe| qe.endpoint.clone())
        .ok_or_else(|| DialError::Unsupported("shared endpoint is not a QUIC endpoint".to_string()))
}

/// A `quinn` bidirectional stream pair wrapped to satisfy [`crate::connection::StreamLike`].
struct QuicBiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

pub struct QuicListenerFactory<I: InterfaceAddresses> {
    server_config: ServerConfig,
    lan: Arc<LanClassifier<I>>,
    priority_lan: i32,
    priority_wan: i32,
}

impl<I: InterfaceAddresses + 'static> QuicListenerFactory<I> {
    pub fn new(server_config: ServerConfig, lan: Arc<LanClassifier<I>>, priority_lan: i32, priority_wan: i32) -> Self {
        Self {
            server_config,
            lan,
            priority_lan,
            priority_wan,
        }
    }
}

impl<I: InterfaceAddresses + 'static> ListenerFactory for QuicListenerFactory<I> {
    fn name(&self) -> &str {
        "quic-listener"
    }

    fn new_listener(&self, uri: &Uri, _registry: &Registry) -> Result<Arc<dyn Listener>, DialError> {
        let bind_addr = format!("{}:{}", uri.host, uri.port.unwrap_or(uri.scheme.default_port()));
        let socket_addr: SocketAddr = bind_addr.parse().map_err(|_| DialError::ParseError(bind_addr.clone()))?;
        let endpoint = Endpoint::server(self.server_config.clone(), socket_addr)
            .map_err(|e| DialError::Io(bind_addr.clone(), e))?;
        Ok(Arc::new(QuicTransportListener {
            uri: uri.clone(),
            endpoint,
            lan: self.lan.clone(),
            priority_lan: self.priority_lan,
            priority_wan: self.priority_wan,
            last_error: Mutex::new(None),
        }))
    }
}

pub struct QuicTransportListener<I: InterfaceAddresses> {
    uri: Uri,
    endpoint: Endpoint,
    lan: Arc<LanClassifier<I>>,
    priority_lan: i32,
    priority_wan: i32,
    last_error: Mutex<Option<String>>,
}

#[async_trait]
impl<I: InterfaceAddresses + 'static> Listener for QuicTransportListener<I> {
    async fn serve(self: Arc<Self>, accept_tx: mpsc::Sender<IncomingConn>) -> Result<(), DialError> {
        let mut supervisor = RestartSupervisor::new();
        while let Some(connecting) = self.endpoint.accept().await {
            match connecting.await {
                Ok(connection) => {
                    supervisor.note_accept_success();
                    let remote_addr = connection.remote_address();
                    let is_local = self.lan.is_lan(&remote_addr.ip());
                    let priority = if is_local { self.priority_lan } else { self.priority_wan };
                    let accept_tx = accept_tx.clone();
                    tokio::spawn(async move {
                        let (send, recv) = match connection.accept_bi().await {
                            Ok(streams) => streams,
                            Err(err) => {
                                log::debug!(target: LOG_TARGET, "QUIC accept_bi from {} failed: {}", remote_addr, err);
                                return;
                            },
                        };
                        let remote_cert_der = connection
                            .peer_identity()
                            .and_then(|identity| identity.downcast::<Vec<rustls::Certificate>>().ok())
                            .and_then(|certs| certs.first().cloned())
                            .map(|c| c.0)
                            .unwrap_or_default();

                        let conn = IntermediateConn {
                            stream: Box::new(QuicBiStream { send, recv }),
                            conn_type: ConnectionType::QuicServer,
                            priority,
                            is_local,
                            connection_id: ConnectionId::generate(0, 0),
                            remote_cert_der,
                            remote_addr: remote_addr.to_string(),
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
                    if supervisor.note_accept_failure() {
                        // The shared QUIC endpoint can't be rebound, so "restart" just resets the
                        // supervisor's counters; a sustained failure run still gets the same
                        // one-minute backoff as TCP/Relay before the accept loop resumes.
                        match supervisor.on_restart(std::time::Instant::now()) {
                            RestartDecision::RestartNow => {
                                log::warn!(target: LOG_TARGET, "too many consecutive QUIC accept failures, restarting listener");
                            },
                            RestartDecision::BackOff { for_ } => {
                                log::warn!(target: LOG_TARGET, "QUIC listener backing off for {:?} after repeated restarts", for_);
                                tokio::time::sleep(for_).await;
                            },
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn uri(&self) -> Uri {
        self.uri.clone()
    }

    fn lan_addresses(&self) -> Vec<Uri> {
        vec![self.uri.clone()]
    }

    fn wan_addresses(&self) -> Vec<Uri> {
        vec![self.uri.clone()]
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

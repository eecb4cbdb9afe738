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

//! Plain TCP transport (§4.3 "Per-family specifics"): `tcp`/`tcp4`/`tcp6`, default port 22000,
//! `SO_REUSEPORT` where available on both the dial and listen sockets (so a later dial out of this
//! process can share the port a listener already bound, which helps NAT punching), and the
//! configured `trafficClass` byte applied as IP TOS (`IP_TOS`/`IPV6_TCLASS`) on every socket this
//! transport opens.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener as TokioTcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    config::Uri,
    connection::{ConnectionDirection, ConnectionId, ConnectionType, DialTarget, IncomingConn, IntermediateConn},
    device_id::DeviceID,
    error::DialError,
    lan::{InterfaceAddresses, LanClassifier},
    registry::{Dialer, DialerFactory, Listener, ListenerFactory, Registry},
    restart_supervisor::{RestartDecision, RestartSupervisor},
};

const LOG_TARGET: &str = "connmgr::transports::tcp";
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a `SOCK_STREAM` socket2 socket with `SO_REUSEADDR`/`SO_REUSEPORT` and the configured
/// traffic-class byte applied, but not yet bound or connected (§4.3, §6 `trafficClass`).
fn new_tcp_socket(domain: Domain, ip: IpAddr, traffic_class: u8) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if traffic_class != 0 {
        if ip.is_ipv6() {
            socket.set_tclass_v6(traffic_class as u32)?;
        } else {
            socket.set_tos(traffic_class as u32)?;
        }
    }
    Ok(socket)
}

/// Connects to `addr` through a `socket2`-configured socket (reuse-port + traffic class, see
/// [`new_tcp_socket`]) instead of `TcpStream::connect`, then hands the result back as an ordinary
/// [`TcpStream`] once the non-blocking connect completes.
async fn connect_with_options(addr: SocketAddr, traffic_class: u8) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = new_tcp_socket(domain, addr.ip(), traffic_class)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {},
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {},
        #[cfg(unix)]
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {},
        Err(err) => return Err(err),
    }
    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    Ok(stream)
}

/// Binds `addr` through a `socket2`-configured socket (reuse-port + traffic class) instead of
/// `TcpListener::bind`, so the listener's accepted connections and any co-located dial socket can
/// share the same local port (§4.3).
fn bind_with_options(addr: SocketAddr, traffic_class: u8) -> io::Result<TokioTcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = new_tcp_socket(domain, addr.ip(), traffic_class)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    TokioTcpListener::from_std(std_listener)
}

/// Resolves a `host:port` string (which may still need DNS resolution, unlike the `SocketAddr`
/// dialing already has in hand) and binds it via [`bind_with_options`].
async fn bind(bind_addr: &str, traffic_class: u8) -> io::Result<TokioTcpListener> {
    let socket_addr = tokio::net::lookup_host(bind_addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("could not resolve {}", bind_addr)))?;
    bind_with_options(socket_addr, traffic_class)
}

pub struct TcpDialerFactory<I: InterfaceAddresses> {
    lan: Arc<LanClassifier<I>>,
    connector: TlsConnector,
    priority_lan: i32,
    priority_wan: i32,
    traffic_class: u8,
}

impl<I: InterfaceAddresses + 'static> TcpDialerFactory<I> {
    pub fn new(
        lan: Arc<LanClassifier<I>>,
        connector: TlsConnector,
        priority_lan: i32,
        priority_wan: i32,
        traffic_class: u8,
    ) -> Self {
        Self {
            lan,
            connector,
            priority_lan,
            priority_wan,
            traffic_class,
        }
    }
}

impl<I: InterfaceAddresses + 'static> DialerFactory for TcpDialerFactory<I> {
    fn name(&self) -> &str {
        "tcp"
    }

    fn new_dialer(&self, _registry: &Registry) -> Result<Arc<dyn Dialer>, DialError> {
        Ok(Arc::new(TcpDialer {
            lan: self.lan.clone(),
            connector: self.connector.clone(),
            priority_lan: self.priority_lan,
            priority_wan: self.priority_wan,
            traffic_class: self.traffic_class,
        }))
    }

    fn best_possible_priority(&self) -> i32 {
        self.priority_lan.min(self.priority_wan)
    }
}

pub struct TcpDialer<I: InterfaceAddresses> {
    lan: Arc<LanClassifier<I>>,
    connector: TlsConnector,
    priority_lan: i32,
    priority_wan: i32,
    traffic_class: u8,
}

#[async_trait]
impl<I: InterfaceAddresses + 'static> Dialer for TcpDialer<I> {
    async fn dial(&self, _device_id: &DeviceID, target: &DialTarget) -> Result<IntermediateConn, DialError> {
        let addr = format!("{}:{}", target.uri.host, target.uri.port.unwrap_or(target.uri.scheme.default_port()));
        let socket_addr: SocketAddr = tokio::time::timeout(DIAL_TIMEOUT, tokio::net::lookup_host(&addr))
            .await
            .map_err(|_| DialError::Timeout(addr.clone()))?
            .map_err(|e| DialError::Io(addr.clone(), e))?
            .next()
            .ok_or_else(|| DialError::ParseError(addr.clone()))?;

        let tcp_stream = tokio::time::timeout(DIAL_TIMEOUT, connect_with_options(socket_addr, self.traffic_class))
            .await
            .map_err(|_| DialError::Timeout(addr.clone()))?
            .map_err(|e| DialError::Io(addr.clone(), e))?;

        let server_name = rustls::ServerName::try_from(target.uri.host.as_str())
            .map_err(|_| DialError::ParseError(target.uri.host.clone()))?;
        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| DialError::Io(addr.clone(), e))?;

        let (_, session) = tls_stream.get_ref();
        let remote_cert_der = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.0.clone())
            .unwrap_or_default();

        let is_local = self.lan.is_lan(&socket_addr.ip());

        Ok(IntermediateConn {
            stream: Box::new(tls_stream),
            conn_type: ConnectionType::TcpClient,
            priority: self.priority(&target.uri.host),
            is_local,
            connection_id: ConnectionId::generate(0, 0), // re-derived once Hello timestamps are known
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
}

/// TCP listener: binds once, accepts forever, applying the shared [`RestartSupervisor`] policy on
/// transient accept failures (§4.3's per-listener supervision). Generic over `I` so accepted
/// connections get the same LAN-bonus priority treatment as outgoing dials (mirrors
/// [`TcpDialerFactory`]).
pub struct TcpListenerFactory<I: InterfaceAddresses> {
    acceptor: TlsAcceptor,
    lan: Arc<LanClassifier<I>>,
    priority_lan: i32,
    priority_wan: i32,
    traffic_class: u8,
}

impl<I: InterfaceAddresses + 'static> TcpListenerFactory<I> {
    pub fn new(
        acceptor: TlsAcceptor,
        lan: Arc<LanClassifier<I>>,
        priority_lan: i32,
        priority_wan: i32,
        traffic_class: u8,
    ) -> Self {
        Self {
            acceptor,
            lan,
            priority_lan,
            priority_wan,
            traffic_class,
        }
    }
}

impl<I: InterfaceAddresses + 'static> ListenerFactory for TcpListenerFactory<I> {
    fn name(&self) -> &str {
        "tcp-listener"
    }

    fn new_listener(&self, uri: &Uri, _registry: &Registry) -> Result<Arc<dyn Listener>, DialError> {
        Ok(Arc::new(TcpTransportListener {
            uri: uri.clone(),
            acceptor: self.acceptor.clone(),
            lan: self.lan.clone(),
            priority_lan: self.priority_lan,
            priority_wan: self.priority_wan,
            traffic_class: self.traffic_class,
            last_error: Mutex::new(None),
        }))
    }
}

pub struct TcpTransportListener<I: InterfaceAddresses> {
    uri: Uri,
    acceptor: TlsAcceptor,
    lan: Arc<LanClassifier<I>>,
    priority_lan: i32,
    priority_wan: i32,
    traffic_class: u8,
    last_error: Mutex<Option<String>>,
}

#[async_trait]
impl<I: InterfaceAddresses + 'static> Listener for TcpTransportListener<I> {
    async fn serve(self: Arc<Self>, accept_tx: mpsc::Sender<IncomingConn>) -> Result<(), DialError> {
        let bind_addr = format!("{}:{}", self.uri.host, self.uri.port.unwrap_or(self.uri.scheme.default_port()));
        let mut supervisor = RestartSupervisor::new();

        loop {
            let listener = match bind(&bind_addr, self.traffic_class).await {
                Ok(listener) => listener,
                Err(err) => {
                    *self.last_error.lock() = Some(err.to_string());
                    match supervisor.on_restart(std::time::Instant::now()) {
                        RestartDecision::RestartNow => continue,
                        RestartDecision::BackOff { for_ } => {
                            tokio::time::sleep(for_).await;
                            continue;
                        },
                    }
                },
            };
            log::info!(target: LOG_TARGET, "listening on {}", bind_addr);

            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        supervisor.note_accept_success();
                        log::debug!(target: LOG_TARGET, "accepted connection from {}", peer);
                        let acceptor = self.acceptor.clone();
                        let is_local = self.lan.is_lan(&peer.ip());
                        let priority = if is_local { self.priority_lan } else { self.priority_wan };
                        let accept_tx = accept_tx.clone();
                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(tls_stream) => tls_stream,
                                Err(err) => {
                                    log::debug!(target: LOG_TARGET, "TLS accept from {} failed: {}", peer, err);
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
                                conn_type: ConnectionType::TcpServer,
                                priority,
                                is_local,
                                connection_id: ConnectionId::generate(0, 0),
                                remote_cert_der,
                                remote_addr: peer.to_string(),
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
                            break;
                        }
                    },
                }
            }
        }
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

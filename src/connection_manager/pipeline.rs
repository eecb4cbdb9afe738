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

//! Assembles stage 1 (`handshake::early_reject`) and stage 2 (Hello exchange, identity validation,
//! Model callback, tracker arbitration) from [`super::handshake`] into the single task spawned per
//! accepted or dialed connection (§4.2, §5's accept channel). One task per connection means a slow
//! or hostile peer only blocks itself, which is the property a literal second worker-pool stage
//! would otherwise exist to provide.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use tokio::sync::{broadcast, watch};

use crate::{
    config::Configuration,
    connection::{Connection, ConnectionDirection, IncomingConn, IntermediateConn, MAX_NUM_CONNECTIONS},
    connection_manager::{
        handshake::{early_reject, exchange_hello, lookup_device_or_removed, promote, validate_certificate_name},
        status::ConnectionStatus,
        tracker::{Arbitration, ConnectionTracker, DISCONNECT_LINGER},
        ConnectionManagerEvent,
    },
    device_id::DeviceID,
    error::HandshakeError,
    limiter::BandwidthLimiter,
    model::Model,
    warn_limiter::WarnRateLimiter,
};

const LOG_TARGET: &str = "connmgr::pipeline";

/// Everything [`handle_incoming`] needs to carry a connection from "freshly accepted/dialed" to
/// "registered with the tracker and handed to the Model" (§4.2 steps 3-7).
pub struct PipelineContext {
    pub local_device_id: DeviceID,
    pub tracker: Arc<ConnectionTracker>,
    pub limiter: Arc<BandwidthLimiter>,
    pub connection_status: Arc<ConnectionStatus>,
    pub events: broadcast::Sender<ConnectionManagerEvent>,
    pub model: Arc<dyn Model>,
    pub config: watch::Receiver<Configuration>,
    pub warn_limiter: Arc<WarnRateLimiter>,
}

/// Runs the full pipeline for one connection and logs (rather than propagates) the outcome: the
/// caller is a fire-and-forget `tokio::spawn`, there's no one left to hand an `Err` to (§4.2).
pub async fn handle_incoming(ctx: Arc<PipelineContext>, incoming: IncomingConn) {
    let IncomingConn { conn, direction } = incoming;
    let remote_addr = conn.remote_addr.clone();
    let remote_device_id = DeviceID::from_cert_der(&conn.remote_cert_der);
    match process_incoming(&ctx, conn, direction).await {
        Ok(()) => {},
        Err(err) => {
            // Version mismatches tend to recur for as long as an operator leaves two
            // incompatible builds paired, so they're worth surfacing above debug — but no more
            // than once per WARN_INTERVAL per device (§4.1.5, §7).
            if err.failure_kind() == crate::hello::HelloFailureKind::VersionMismatch
                && ctx.warn_limiter.should_warn(&remote_device_id, std::time::Instant::now())
            {
                log::warn!(target: LOG_TARGET, "connection from/to {} rejected: {}", remote_addr, err);
            } else {
                log::debug!(target: LOG_TARGET, "connection from/to {} rejected: {}", remote_addr, err);
            }
            if direction == ConnectionDirection::Outbound {
                ctx.connection_status.set(&remote_addr, Some(err.to_string()), false, SystemTime::now());
            }
        },
    }
}

async fn process_incoming(
    ctx: &PipelineContext,
    intermediate: IntermediateConn,
    direction: ConnectionDirection,
) -> Result<(), HandshakeError> {
    let remote_device_id = DeviceID::from_cert_der(&intermediate.remote_cert_der);

    let configuration = ctx.config.borrow().clone();
    let device_config = configuration.device(&remote_device_id).cloned();
    let global_limit_reached = ctx.tracker.num_connections() >= MAX_NUM_CONNECTIONS;
    let remote_ip = intermediate.remote_addr.parse::<SocketAddr>().ok().map(|addr| addr.ip());
    early_reject(
        &remote_device_id,
        &ctx.local_device_id,
        device_config.as_ref(),
        configuration.is_ignored(&remote_device_id),
        global_limit_reached,
        remote_ip,
    )?;

    let local_hello = ctx.model.get_hello(&remote_device_id);

    let IntermediateConn {
        stream,
        conn_type,
        priority,
        is_local,
        remote_cert_der,
        remote_addr,
        ..
    } = intermediate;
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (remote_hello, connection_id) = exchange_hello(&mut read_half, &mut write_half, &local_hello, &remote_device_id).await?;
    let stream = read_half.unsplit(write_half);

    // Re-check against the latest configuration: the Hello exchange can take up to
    // HELLO_TIMEOUT, during which the device may have been removed (§4.2 step 3).
    let configuration = ctx.config.borrow().clone();
    let device_config = lookup_device_or_removed(&configuration, &remote_device_id)?;

    // Only meaningful on the dial side: an inbound accept has no expected hostname to fall back
    // on, so the CN check only ever applies to connections we initiated. The
    // connector's certificate verifier accepts any self-signed peer cert without checking it
    // against the dialed hostname — identity is established by the cert-hash DeviceID, not by
    // CA-backed hostname verification — so `hostname_verification_result` is always `false` here:
    // the dual-check degenerates to a plain equality against the configured `certName`.
    if direction == ConnectionDirection::Outbound {
        let common_name = subject_common_name(&remote_cert_der)?;
        if !validate_certificate_name(&common_name, device_config.effective_cert_name(), false) {
            return Err(HandshakeError::CertificateNameMismatch(remote_device_id));
        }
    }

    ctx.model
        .on_hello(&remote_device_id, &remote_addr, &remote_hello)
        .await
        .map_err(|e| HandshakeError::ModelRejected(remote_device_id, e.to_string()))?;

    let intermediate = IntermediateConn {
        stream,
        conn_type,
        priority,
        is_local,
        connection_id,
        remote_cert_der,
        remote_addr: remote_addr.clone(),
    };
    let connection = promote(intermediate, remote_device_id, remote_hello.clone(), direction, &ctx.limiter);

    let arbitration = ctx.tracker.arbitrate(&connection, device_config.desired_connections());
    if arbitration == Arbitration::RejectIncoming {
        return Err(HandshakeError::DeviceAlreadyConnected(remote_device_id));
    }
    let superseded = match &arbitration {
        Arbitration::AcceptAndSupersede(superseded) => superseded.clone(),
        _ => Vec::new(),
    };

    let registered = Arc::new(connection.clone());
    ctx.tracker.register(registered.clone(), &superseded);
    linger_close_superseded(ctx, superseded);

    if direction == ConnectionDirection::Outbound {
        ctx.connection_status.set(&remote_addr, None, false, SystemTime::now());
    }

    ctx.model.add_connection(connection, remote_hello);

    let _ = ctx.events.send(ConnectionManagerEvent::Connected {
        device_id: remote_device_id,
        connection_id: registered.connection_id,
    });
    log::info!(target: LOG_TARGET, "{} established", registered.short_str());

    Ok(())
}

/// Spawns the linger-then-close task for each connection an upgrade superseded, publishing
/// `Disconnected` once the socket is actually dropped.
fn linger_close_superseded(ctx: &PipelineContext, superseded: Vec<Arc<Connection>>) {
    for old in superseded {
        let events = ctx.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_LINGER).await;
            let device_id = old.device_id;
            let connection_id = old.connection_id;
            drop(old);
            let _ = events.send(ConnectionManagerEvent::Disconnected { device_id, connection_id });
        });
    }
}

/// Extracts the subject common name from a DER-encoded certificate (§4.2 step 4).
fn subject_common_name(der: &[u8]) -> Result<String, HandshakeError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| HandshakeError::Tls(format!("invalid peer certificate: {}", e)))?;
    Ok(cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string())
}

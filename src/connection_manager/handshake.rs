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

//! Two-stage handshake pipeline (§4.2): `handle_conn` performs TLS-state inspection and early
//! rejection (stage 1, "handleConns"); `handle_hello` performs Model validation, cert-name
//! checking, and tracker registration (stage 2, "handleHellos"). Split so a slow or hostile peer
//! blocks only its own short-lived task, never the shared accept pipeline.

use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use crate::{
    config::{is_allowed_network, Configuration, DeviceConfig},
    connection::{Connection, ConnectionDirection, ConnectionId, IntermediateConn},
    device_id::DeviceID,
    error::HandshakeError,
    hello::Hello,
    limiter::{BandwidthLimiter, RateLimitedStream},
};

const LOG_TARGET: &str = "connmgr::handshake";

/// Deadline for the Hello exchange after a socket is accepted/dialed (§4.2 step 4).
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);

/// Stage 1 early rejection checks (§4.2 step 1-3), run against an [`IntermediateConn`] before its
/// Hello exchange is even attempted. `remote_ip` is the address the socket actually connected
/// from/to; like the outbound dial-target resolution (§4.1.1), the `allowedNetworks` check only
/// applies when that address is available — it's unset for transports (e.g. relay) that don't
/// expose a plain IP.
pub fn early_reject(
    remote_id: &DeviceID,
    local_id: &DeviceID,
    device_config: Option<&DeviceConfig>,
    ignored: bool,
    global_limit_reached: bool,
    remote_ip: Option<IpAddr>,
) -> Result<(), HandshakeError> {
    if remote_id == local_id {
        return Err(HandshakeError::SelfConnect);
    }
    if ignored {
        return Err(HandshakeError::DeviceIgnored(*remote_id));
    }
    if global_limit_reached {
        return Err(HandshakeError::GlobalLimitReached);
    }
    if let Some(cfg) = device_config {
        if cfg.paused {
            return Err(HandshakeError::DevicePaused(*remote_id));
        }
        if !cfg.allowed_networks.is_empty() {
            if let Some(ip) = remote_ip {
                if !is_allowed_network(&ip, &cfg.allowed_networks) {
                    return Err(HandshakeError::NetworkNotAllowed(*remote_id));
                }
            }
        }
    }
    Ok(())
}

/// Performs the Hello exchange over an already-TLS-established stream: writes the local Hello,
/// reads the remote's, and derives the [`ConnectionId`] from the summed timestamps plus 8 random
/// bytes (§4.2 step 5, §6's on-wire connection-ID format).
pub async fn exchange_hello(
    stream: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
    writer: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    local_hello: &Hello,
    remote_id: &DeviceID,
) -> Result<(Hello, ConnectionId), HandshakeError> {
    let outgoing = local_hello.marshal();
    let write_fut = writer.write_all(&outgoing);
    let read_fut = read_hello(stream);

    let (write_result, remote_hello) = timeout(HELLO_TIMEOUT, futures::future::join(write_fut, read_fut))
        .await
        .map_err(|_| HandshakeError::HelloTimeout(*remote_id))?;
    write_result.map_err(HandshakeError::HelloIo)?;
    let remote_hello = remote_hello?;

    let connection_id = ConnectionId::generate(local_hello.timestamp, remote_hello.timestamp);
    Ok((remote_hello, connection_id))
}

async fn read_hello(stream: &mut (dyn tokio::io::AsyncRead + Unpin + Send)) -> Result<Hello, HandshakeError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(HandshakeError::HelloIo)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > crate::hello::MAX_HELLO_SIZE {
        return Err(HandshakeError::HelloTooLarge);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(HandshakeError::HelloIo)?;

    let mut full = bytes::BytesMut::with_capacity(4 + len);
    full.extend_from_slice(&len_buf);
    full.extend_from_slice(&body);
    let mut full = full.freeze();
    Hello::unmarshal(&mut full)
}

/// Stage 2 step 4 (§4.2): accept if the certificate's subject common name equals the configured
/// `certName`, otherwise fall back to standard hostname verification. Kept as a deliberate
/// two-case compatibility workaround, not something to simplify to one check.
pub fn validate_certificate_name(
    subject_common_name: &str,
    expected_cert_name: &str,
    hostname_verification_result: bool,
) -> bool {
    subject_common_name == expected_cert_name || hostname_verification_result
}

/// Wraps a freshly validated [`IntermediateConn`] plus negotiated Hello into a full [`Connection`],
/// applying per-connection rate limiting (§4.2 step 5).
pub fn promote(
    intermediate: IntermediateConn,
    device_id: DeviceID,
    hello: Hello,
    direction: ConnectionDirection,
    limiter: &Arc<BandwidthLimiter>,
) -> Connection {
    let connection_id = intermediate.connection_id;
    let limiters = limiter.for_connection(device_id, intermediate.is_local);
    let stream = RateLimitedStream::new(intermediate.stream, limiters);
    Connection {
        device_id,
        connection_id,
        conn_type: intermediate.conn_type,
        direction,
        priority: intermediate.priority,
        is_local: intermediate.is_local,
        hello,
        established_at: std::time::SystemTime::now(),
        stream: Arc::new(tokio::sync::Mutex::new(stream)),
    }
}

/// Looks up `device_id` in the current configuration, returning `Err` if the device was removed
/// while handshaking was underway (§4.2 step 3, "device removed" edge case).
pub fn lookup_device_or_removed<'a>(
    configuration: &'a Configuration,
    device_id: &DeviceID,
) -> Result<&'a DeviceConfig, HandshakeError> {
    configuration.device(device_id).ok_or(HandshakeError::DeviceRemoved(*device_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(byte: u8) -> DeviceID {
        DeviceID::from_bytes([byte; 32])
    }

    #[test]
    fn self_connect_is_rejected() {
        let local = device(1);
        let err = early_reject(&local, &local, None, false, false, None).unwrap_err();
        assert!(matches!(err, HandshakeError::SelfConnect));
    }

    #[test]
    fn paused_device_is_rejected() {
        let local = device(1);
        let remote = device(2);
        let cfg = DeviceConfig {
            device_id: remote,
            addresses: vec![],
            paused: true,
            compression: crate::config::Compression::Metadata,
            cert_name: String::new(),
            max_recv_kbps: 0,
            max_send_kbps: 0,
            allowed_networks: vec![],
            num_connections: 1,
        };
        let err = early_reject(&remote, &local, Some(&cfg), false, false, None).unwrap_err();
        assert!(matches!(err, HandshakeError::DevicePaused(_)));
    }

    #[test]
    fn incoming_address_outside_allowed_networks_is_rejected() {
        let local = device(1);
        let remote = device(2);
        let cfg = DeviceConfig {
            device_id: remote,
            addresses: vec![],
            paused: false,
            compression: crate::config::Compression::Metadata,
            cert_name: String::new(),
            max_recv_kbps: 0,
            max_send_kbps: 0,
            allowed_networks: vec!["10.0.0.0/8".to_string()],
            num_connections: 1,
        };
        let outside: IpAddr = "192.168.1.5".parse().unwrap();
        let err = early_reject(&remote, &local, Some(&cfg), false, false, Some(outside)).unwrap_err();
        assert!(matches!(err, HandshakeError::NetworkNotAllowed(_)));

        let inside: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(early_reject(&remote, &local, Some(&cfg), false, false, Some(inside)).is_ok());
    }

    #[test]
    fn allowed_networks_check_is_skipped_without_a_remote_ip() {
        let local = device(1);
        let remote = device(2);
        let cfg = DeviceConfig {
            device_id: remote,
            addresses: vec![],
            paused: false,
            compression: crate::config::Compression::Metadata,
            cert_name: String::new(),
            max_recv_kbps: 0,
            max_send_kbps: 0,
            allowed_networks: vec!["10.0.0.0/8".to_string()],
            num_connections: 1,
        };
        assert!(early_reject(&remote, &local, Some(&cfg), false, false, None).is_ok());
    }

    #[test]
    fn cert_name_match_short_circuits_hostname_verification() {
        assert!(validate_certificate_name("syncthing", "syncthing", false));
        assert!(!validate_certificate_name("other", "syncthing", false));
        assert!(validate_certificate_name("other", "syncthing", true));
    }
}

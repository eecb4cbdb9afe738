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

//! Drives the handshake pipeline end to end over an in-process duplex stream, the same shape as
//! the reference's `MemoryTransport`-backed manager tests: two independent `PipelineContext`s,
//! each standing in for one side's connection manager, complete a real Hello exchange, tracker
//! arbitration and registration, and event emission without any real transport or TLS.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use connmgr::{
    config::{Configuration, DeviceConfig, GlobalOptions},
    connection::{ConnectionDirection, ConnectionId, ConnectionType, IncomingConn, IntermediateConn},
    connection_manager::{
        pipeline::{handle_incoming, PipelineContext},
        status::ConnectionStatus,
        tracker::ConnectionTracker,
        ConnectionManagerEvent,
    },
    device_id::DeviceID,
    hello::Hello,
    limiter::BandwidthLimiter,
    model::{DeviceStatistics, Model},
    warn_limiter::WarnRateLimiter,
};
use tokio::sync::{broadcast, watch};

/// A `Model` that just records every callback it receives, standing in for the embedding daemon's
/// folder/file layer (out of scope, §1/§6).
struct RecordingModel {
    device_name: String,
    hellos: Mutex<Vec<(DeviceID, String)>>,
    connections: Mutex<Vec<DeviceID>>,
}

impl RecordingModel {
    fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            hellos: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Model for RecordingModel {
    async fn on_hello(&self, device_id: &DeviceID, remote_addr: &str, _hello: &Hello) -> anyhow::Result<()> {
        self.hellos.lock().unwrap().push((*device_id, remote_addr.to_string()));
        Ok(())
    }

    fn get_hello(&self, _device_id: &DeviceID) -> Hello {
        Hello {
            device_name: self.device_name.clone(),
            client_name: "connmgr-test".to_string(),
            client_version: "0.0.0-test".to_string(),
            timestamp: now_nanos(),
            num_connections: 1,
        }
    }

    fn add_connection(&self, conn: connmgr::connection::Connection, _hello: Hello) {
        self.connections.lock().unwrap().push(conn.device_id);
    }

    fn connection(&self, _device_id: &DeviceID) -> Option<()> {
        None
    }

    fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn device_statistics(&self) -> HashMap<DeviceID, DeviceStatistics> {
        HashMap::new()
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

/// Builds a `PipelineContext` standing in for `local_device_id`'s side of the handshake, configured
/// to accept connections from `peer_device_id`.
fn build_context(
    local_device_id: DeviceID,
    peer_device_id: DeviceID,
    num_connections: u8,
    model: Arc<RecordingModel>,
) -> (Arc<PipelineContext>, broadcast::Receiver<ConnectionManagerEvent>) {
    let (events, events_rx) = broadcast::channel(16);
    let configuration = Configuration {
        devices: vec![DeviceConfig {
            device_id: peer_device_id,
            addresses: vec![],
            paused: false,
            compression: connmgr::config::Compression::Metadata,
            cert_name: String::new(),
            max_recv_kbps: 0,
            max_send_kbps: 0,
            allowed_networks: vec![],
            num_connections,
        }],
        options: GlobalOptions::default(),
        ignored_devices: Default::default(),
    };
    let (_config_tx, config_rx) = watch::channel(configuration);
    let ctx = Arc::new(PipelineContext {
        local_device_id,
        tracker: Arc::new(ConnectionTracker::new(local_device_id, 5)),
        limiter: Arc::new(BandwidthLimiter::new()),
        connection_status: Arc::new(ConnectionStatus::new()),
        events,
        model,
        config: config_rx,
        warn_limiter: Arc::new(WarnRateLimiter::new()),
    });
    (ctx, events_rx)
}

fn incoming_conn(stream: Box<dyn connmgr::connection::StreamLike>, remote_cert_der: Vec<u8>, priority: i32, remote_addr: &str) -> IncomingConn {
    IncomingConn {
        conn: IntermediateConn {
            stream,
            conn_type: ConnectionType::TcpServer,
            priority,
            is_local: false,
            connection_id: ConnectionId::generate(0, 0),
            remote_cert_der,
            remote_addr: remote_addr.to_string(),
        },
        direction: ConnectionDirection::Inbound,
    }
}

#[tokio::test]
async fn bidirectional_hello_exchange_registers_both_sides() {
    let cert_a = b"device-a-fake-cert".to_vec();
    let cert_b = b"device-b-fake-cert".to_vec();
    let device_a = DeviceID::from_cert_der(&cert_a);
    let device_b = DeviceID::from_cert_der(&cert_b);

    let model_a = Arc::new(RecordingModel::new("a"));
    let model_b = Arc::new(RecordingModel::new("b"));
    let (ctx_a, mut events_a) = build_context(device_a, device_b, 1, model_a.clone());
    let (ctx_b, mut events_b) = build_context(device_b, device_a, 1, model_b.clone());

    let (stream_a, stream_b) = tokio::io::duplex(4096);

    let conn_a = IncomingConn {
        conn: IntermediateConn {
            stream: Box::new(stream_a),
            conn_type: ConnectionType::TcpServer,
            priority: 10,
            is_local: false,
            connection_id: ConnectionId::generate(0, 0),
            remote_cert_der: cert_b,
            remote_addr: "memory://b".to_string(),
        },
        direction: ConnectionDirection::Inbound,
    };
    let conn_b = IncomingConn {
        conn: IntermediateConn {
            stream: Box::new(stream_b),
            conn_type: ConnectionType::TcpServer,
            priority: 10,
            is_local: false,
            connection_id: ConnectionId::generate(0, 0),
            remote_cert_der: cert_a,
            remote_addr: "memory://a".to_string(),
        },
        direction: ConnectionDirection::Inbound,
    };

    let deadline = Duration::from_secs(5);
    let (a_result, b_result) = tokio::join!(
        tokio::time::timeout(deadline, handle_incoming(ctx_a.clone(), conn_a)),
        tokio::time::timeout(deadline, handle_incoming(ctx_b.clone(), conn_b)),
    );
    a_result.expect("device A's side of the handshake timed out");
    b_result.expect("device B's side of the handshake timed out");

    assert_eq!(ctx_a.tracker.num_connections(), 1);
    assert_eq!(ctx_b.tracker.num_connections(), 1);
    assert_eq!(model_a.connections.lock().unwrap().as_slice(), &[device_b]);
    assert_eq!(model_b.connections.lock().unwrap().as_slice(), &[device_a]);

    let event_a = events_a.try_recv().expect("device A should have emitted Connected");
    match event_a {
        ConnectionManagerEvent::Connected { device_id, .. } => assert_eq!(device_id, device_b),
        other => panic!("expected Connected, got {:?}", other),
    }
    let event_b = events_b.try_recv().expect("device B should have emitted Connected");
    match event_b {
        ConnectionManagerEvent::Connected { device_id, .. } => assert_eq!(device_id, device_a),
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[tokio::test]
async fn higher_priority_connection_supersedes_and_eventually_disconnects_the_old_one() {
    let cert_a = b"device-a-fake-cert-2".to_vec();
    let cert_b = b"device-b-fake-cert-2".to_vec();
    let device_a = DeviceID::from_cert_der(&cert_a);
    let device_b = DeviceID::from_cert_der(&cert_b);

    // Only device A's side is under test here; device B's end of each duplex pair is driven by a
    // second `handle_incoming` call so the Hello exchange completes on both ends, exactly as in
    // the bidirectional test above.
    let model_a = Arc::new(RecordingModel::new("a"));
    let model_b1 = Arc::new(RecordingModel::new("b1"));
    let model_b2 = Arc::new(RecordingModel::new("b2"));
    let (ctx_a, mut events_a) = build_context(device_a, device_b, 1, model_a.clone());
    let (ctx_b1, _events_b1) = build_context(device_b, device_a, 1, model_b1);
    let (ctx_b2, _events_b2) = build_context(device_b, device_a, 1, model_b2);

    let deadline = Duration::from_secs(5);

    // First (worse-priority) connection establishes normally.
    let (stream_a1, stream_b1) = tokio::io::duplex(4096);
    let conn_a1 = incoming_conn(Box::new(stream_a1), cert_b.clone(), 20, "memory://b/1");
    let conn_b1 = incoming_conn(Box::new(stream_b1), cert_a.clone(), 20, "memory://a/1");
    let (r1, r2) = tokio::join!(
        tokio::time::timeout(deadline, handle_incoming(ctx_a.clone(), conn_a1)),
        tokio::time::timeout(deadline, handle_incoming(ctx_b1.clone(), conn_b1)),
    );
    r1.expect("first connection (A side) timed out");
    r2.expect("first connection (B side) timed out");
    assert_eq!(ctx_a.tracker.num_connections(), 1);
    let first_connection_id = ctx_a.tracker.connections(&device_b)[0].connection_id;

    // Second, better-priority connection (priority 5, threshold 5: 5 + 5 <= 20) supersedes it.
    let (stream_a2, stream_b2) = tokio::io::duplex(4096);
    let conn_a2 = incoming_conn(Box::new(stream_a2), cert_b, 5, "memory://b/2");
    let conn_b2 = incoming_conn(Box::new(stream_b2), cert_a, 5, "memory://a/2");
    let (r1, r2) = tokio::join!(
        tokio::time::timeout(deadline, handle_incoming(ctx_a.clone(), conn_a2)),
        tokio::time::timeout(deadline, handle_incoming(ctx_b2.clone(), conn_b2)),
    );
    r1.expect("second connection (A side) timed out");
    r2.expect("second connection (B side) timed out");

    // The supersede replaces the tracked connection immediately; the old socket only closes (and
    // `Disconnected` only fires) after the linger window.
    assert_eq!(ctx_a.tracker.num_connections(), 1);
    let current_connection_id = ctx_a.tracker.connections(&device_b)[0].connection_id;
    assert_ne!(current_connection_id, first_connection_id);

    let mut saw_second_connected = false;
    let mut saw_disconnect_for_first = false;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(4), events_a.recv()).await {
            Ok(Ok(ConnectionManagerEvent::Connected { connection_id, .. })) if connection_id == current_connection_id => {
                saw_second_connected = true;
            },
            Ok(Ok(ConnectionManagerEvent::Disconnected { connection_id, .. })) if connection_id == first_connection_id => {
                saw_disconnect_for_first = true;
            },
            Ok(Ok(_)) => {},
            Ok(Err(err)) => panic!("event channel error: {}", err),
            Err(_) => break,
        }
        if saw_second_connected && saw_disconnect_for_first {
            break;
        }
    }
    assert!(saw_second_connected, "expected a Connected event for the superseding connection");
    assert!(saw_disconnect_for_first, "expected a Disconnected event for the superseded connection after the linger window");
}

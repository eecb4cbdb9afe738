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

//! Device-connection tracker (§4.2 step 6): records live connections per device, decides whether a
//! newly arriving connection supersedes an existing one, and resolves simultaneous-connect ties.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    connection::{Connection, ConnectionDirection},
    device_id::DeviceID,
};

const LOG_TARGET: &str = "connmgr::tracker";

/// Linger window before a superseded connection's socket is actually closed, during which
/// `ConnectionWillClose` is published.
pub const DISCONNECT_LINGER: Duration = Duration::from_secs(3);

/// What the tracker decided to do with an incoming connection.
#[derive(Debug)]
pub enum Arbitration {
    /// Accept; no existing connection is affected.
    Accept,
    /// Accept and supersede the listed existing connections (closed after the linger window).
    AcceptAndSupersede(Vec<Arc<Connection>>),
    /// Reject the incoming connection; an existing one is kept.
    RejectIncoming,
}

/// Compares by variant and, for `AcceptAndSupersede`, by the set of superseded connection IDs —
/// `Connection` itself has no `PartialEq` (its stream isn't comparable), so this is hand-written
/// rather than derived.
impl PartialEq for Arbitration {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Arbitration::Accept, Arbitration::Accept) => true,
            (Arbitration::RejectIncoming, Arbitration::RejectIncoming) => true,
            (Arbitration::AcceptAndSupersede(a), Arbitration::AcceptAndSupersede(b)) => {
                let ids = |conns: &[Arc<Connection>]| -> HashSet<_> { conns.iter().map(|c| c.connection_id).collect() };
                ids(a) == ids(b)
            },
            _ => false,
        }
    }
}

struct TrackedDevice {
    connections: Vec<Arc<Connection>>,
}

/// Tracks live connections per device and arbitrates upgrades (§4.1's priority/upgrade rule, plus
/// the simultaneous-connect tie-break). Guarded by its own mutex; no lock is held while calling
/// out to the Model or sending on a channel (§5 shared-resource policy).
pub struct ConnectionTracker {
    devices: Mutex<HashMap<DeviceID, TrackedDevice>>,
    upgrade_threshold: i32,
    local_device_id: DeviceID,
}

impl ConnectionTracker {
    pub fn new(local_device_id: DeviceID, upgrade_threshold: i32) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            upgrade_threshold,
            local_device_id,
        }
    }

    pub fn num_connections(&self) -> usize {
        self.devices.lock().values().map(|d| d.connections.len()).sum()
    }

    pub fn connections(&self, device_id: &DeviceID) -> Vec<Arc<Connection>> {
        self.devices
            .lock()
            .get(device_id)
            .map(|d| d.connections.clone())
            .unwrap_or_default()
    }

    pub fn worst_priority(&self, device_id: &DeviceID) -> Option<i32> {
        self.devices
            .lock()
            .get(device_id)
            .and_then(|d| d.connections.iter().map(|c| c.priority).max())
    }

    /// Decides whether `incoming` should be accepted, and if so which existing connections it
    /// supersedes (§4.2 step 6, §4.1.3's "first successful connection wins" tie-break for
    /// simultaneous connects).
    pub fn arbitrate(&self, incoming: &Connection, desired_connections: usize) -> Arbitration {
        let mut devices = self.devices.lock();
        let entry = devices.entry(incoming.device_id).or_insert_with(|| TrackedDevice {
            connections: Vec::new(),
        });

        // Simultaneous-connect tie-break: an inbound and outbound connection to the same device
        // completing in the same tick is not a priority difference, just a race. Whichever side's
        // local DeviceID is numerically greater keeps its outbound connection.
        if let Some(existing) = entry
            .connections
            .iter()
            .find(|c| c.priority == incoming.priority && c.direction != incoming.direction)
        {
            let local_wins_as_outbound = self.local_device_id > incoming.device_id;
            let incoming_is_outbound = incoming.direction == ConnectionDirection::Outbound;
            let keep_incoming = incoming_is_outbound == local_wins_as_outbound;
            return if keep_incoming {
                Arbitration::AcceptAndSupersede(vec![existing.clone()])
            } else {
                Arbitration::RejectIncoming
            };
        }

        if entry.connections.len() >= desired_connections.max(1) {
            let worst = entry
                .connections
                .iter()
                .enumerate()
                .max_by_key(|(_, c)| c.priority);
            if let Some((_, worst_conn)) = worst {
                if incoming.priority + self.upgrade_threshold <= worst_conn.priority {
                    log::debug!(
                        target: LOG_TARGET,
                        "{} upgrades over {} (priority {} vs {}, threshold {})",
                        incoming.short_str(),
                        worst_conn.short_str(),
                        incoming.priority,
                        worst_conn.priority,
                        self.upgrade_threshold
                    );
                    return Arbitration::AcceptAndSupersede(vec![worst_conn.clone()]);
                }
                return Arbitration::RejectIncoming;
            }
        }

        Arbitration::Accept
    }

    /// Registers `incoming` and removes any connections the arbitration decided to supersede.
    /// Callers apply [`Arbitration::AcceptAndSupersede`]'s close-after-linger behaviour themselves
    /// (via [`DISCONNECT_LINGER`]) after this call returns.
    pub fn register(&self, incoming: Arc<Connection>, superseded: &[Arc<Connection>]) {
        let mut devices = self.devices.lock();
        let entry = devices.entry(incoming.device_id).or_insert_with(|| TrackedDevice {
            connections: Vec::new(),
        });
        entry.connections.retain(|c| !superseded.iter().any(|s| s.connection_id == c.connection_id));
        entry.connections.push(incoming);
    }

    /// Removes a closed connection from the tracker (§4.2 step 7).
    pub fn remove(&self, device_id: &DeviceID, connection_id: &crate::connection::ConnectionId) {
        let mut devices = self.devices.lock();
        if let Some(entry) = devices.get_mut(device_id) {
            entry.connections.retain(|c| &c.connection_id != connection_id);
            if entry.connections.is_empty() {
                devices.remove(device_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::SystemTime};

    use super::*;
    use crate::{connection::ConnectionType, hello::Hello};

    fn device(byte: u8) -> DeviceID {
        DeviceID::from_bytes([byte; 32])
    }

    fn make_connection(device_id: DeviceID, priority: i32, direction: ConnectionDirection) -> Arc<Connection> {
        Arc::new(Connection {
            device_id,
            connection_id: crate::connection::ConnectionId::generate(1, 2),
            conn_type: ConnectionType::TcpClient,
            direction,
            priority,
            is_local: false,
            hello: Hello {
                device_name: String::new(),
                client_name: String::new(),
                client_version: String::new(),
                timestamp: 0,
                num_connections: 1,
            },
            established_at: SystemTime::now(),
            stream: Arc::new(tokio::sync::Mutex::new(crate::limiter::RateLimitedStream::new(
                Box::new(tokio::io::duplex(1).0),
                dummy_limiters(),
            ))),
        })
    }

    fn dummy_limiters() -> crate::limiter::ConnectionLimiters {
        let bandwidth = Arc::new(crate::limiter::BandwidthLimiter::new());
        bandwidth.for_connection(DeviceID::from_bytes([0; 32]), true)
    }

    #[test]
    fn better_priority_supersedes_worse_connection_beyond_threshold() {
        let tracker = ConnectionTracker::new(device(0), 5);
        let d = device(1);
        let first = make_connection(d, 20, ConnectionDirection::Outbound);
        tracker.register(first.clone(), &[]);

        let better = make_connection(d, 10, ConnectionDirection::Outbound);
        let decision = tracker.arbitrate(&better, 1);
        match decision {
            Arbitration::AcceptAndSupersede(superseded) => {
                assert_eq!(superseded.len(), 1);
                assert_eq!(superseded[0].connection_id, first.connection_id);
            },
            other => panic!("expected AcceptAndSupersede, got {:?}", other),
        }
    }

    #[test]
    fn insufficient_improvement_is_rejected() {
        let tracker = ConnectionTracker::new(device(0), 5);
        let d = device(1);
        let first = make_connection(d, 20, ConnectionDirection::Outbound);
        tracker.register(first, &[]);

        let slightly_better = make_connection(d, 18, ConnectionDirection::Outbound);
        let decision = tracker.arbitrate(&slightly_better, 1);
        assert_eq!(decision, Arbitration::RejectIncoming);
    }

    #[test]
    fn simultaneous_connect_tie_break_is_deterministic_on_device_id_ordering() {
        let local = device(5);
        let remote = device(10); // remote > local
        let tracker = ConnectionTracker::new(local, 5);

        let inbound = make_connection(remote, 10, ConnectionDirection::Inbound);
        tracker.register(inbound.clone(), &[]);

        // local(5) < remote(10), so local does NOT win as outbound; the existing inbound wins.
        let outbound = make_connection(remote, 10, ConnectionDirection::Outbound);
        let decision = tracker.arbitrate(&outbound, 1);
        assert_eq!(decision, Arbitration::RejectIncoming);
    }

    #[test]
    fn remove_drops_empty_device_entries() {
        let tracker = ConnectionTracker::new(device(0), 5);
        let d = device(1);
        let conn = make_connection(d, 10, ConnectionDirection::Outbound);
        tracker.register(conn.clone(), &[]);
        assert_eq!(tracker.num_connections(), 1);

        tracker.remove(&d, &conn.connection_id);
        assert_eq!(tracker.num_connections(), 0);
    }
}

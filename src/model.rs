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

//! Collaborator contracts (§6): the external Model, Discoverer, NAT service and relay client are
//! out of scope (§1), but this crate defines the capability-argument interfaces it calls into, so
//! the cyclic Model↔Service reference is broken by passing the Model in as a trait object rather
//! than holding a mutable graph (Design Notes §9).

use std::{collections::HashMap, time::SystemTime};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{config::Configuration, connection::Connection, device_id::DeviceID, hello::Hello};

/// Per-device statistics the Model tracks and the orchestrator reads for scheduling (§4.1.2's
/// `lastSeen`).
#[derive(Debug, Clone, Copy)]
pub struct DeviceStatistics {
    pub last_seen: Option<SystemTime>,
    pub last_connection_duration_s: f64,
}

/// The external Model (§6): owns folders/files, accepts newly negotiated connections, and answers
/// identity queries. Passed into the service as a capability argument (Design Notes §9) rather
/// than held in a shared mutable struct.
#[async_trait]
pub trait Model: Send + Sync {
    async fn on_hello(&self, device_id: &DeviceID, remote_addr: &str, hello: &Hello) -> anyhow::Result<()>;

    fn get_hello(&self, device_id: &DeviceID) -> Hello;

    fn add_connection(&self, conn: Connection, hello: Hello);

    fn connection(&self, device_id: &DeviceID) -> Option<()>;

    fn num_connections(&self) -> usize;

    fn device_statistics(&self) -> HashMap<DeviceID, DeviceStatistics>;
}

/// Resolves a device identity to candidate dial URIs (§6, used for `"dynamic"` addresses, §4.1.1).
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn lookup(&self, device_id: &DeviceID) -> anyhow::Result<Vec<String>>;
}

/// Subscribe/commit configuration wrapper (§6, A.3): callers observe `Configuration` snapshots via
/// a `tokio::sync::watch` channel rather than polling.
pub struct ConfigHandle {
    sender: watch::Sender<Configuration>,
}

impl ConfigHandle {
    pub fn new(initial: Configuration) -> (Self, watch::Receiver<Configuration>) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> watch::Receiver<Configuration> {
        self.sender.subscribe()
    }

    /// Publishes a new configuration snapshot; subscribers observe it on their next poll/await.
    pub fn commit(&self, configuration: Configuration) {
        // `send` only errors when every receiver has been dropped, which is not actionable here.
        let _ = self.sender.send(configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalOptions;

    #[tokio::test]
    async fn commit_is_observed_by_subscribers() {
        let initial = Configuration {
            devices: vec![],
            options: GlobalOptions::default(),
            ignored_devices: Default::default(),
        };
        let (handle, mut receiver) = ConfigHandle::new(initial);

        let mut updated = Configuration {
            devices: vec![],
            options: GlobalOptions::default(),
            ignored_devices: Default::default(),
        };
        updated.options.reconnect_interval_s = 5;
        handle.commit(updated);

        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().options.reconnect_interval_s, 5);
    }
}

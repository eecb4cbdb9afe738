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

//! Read-only connection/listener status surfaces (§4.1, §6): the sole programmatic read path,
//! safe for concurrent read, guarded by its own mutex separate from the tracker's (§5
//! shared-resource policy).

use std::{collections::HashMap, time::SystemTime};

use parking_lot::Mutex;

use crate::config::Uri;

#[derive(Debug, Clone)]
pub struct AddressStatus {
    pub when: SystemTime,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListenerStatus {
    pub error: Option<String>,
    pub lan: Vec<Uri>,
    pub wan: Vec<Uri>,
}

/// Tracks per-address dial outcomes. A `context.Canceled`-equivalent error never overwrites a
/// previously recorded real error (§8 scenario 5, §4.1.5's "context.Canceled is swallowed");
/// explicitly clearing with `None` does.
#[derive(Default)]
pub struct ConnectionStatus {
    entries: Mutex<HashMap<String, AddressStatus>>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a dial to `address`. `error: None` clears any previously recorded
    /// error; `error: Some(..)` that represents cancellation is ignored if an error is already
    /// recorded (it must not clobber the last real error).
    pub fn set(&self, address: &str, error: Option<String>, is_cancellation: bool, when: SystemTime) {
        let mut entries = self.entries.lock();
        if is_cancellation && error.is_some() {
            if let Some(existing) = entries.get(address) {
                if existing.error.is_some() {
                    return;
                }
            }
        }
        entries.insert(address.to_string(), AddressStatus { when, error });
    }

    pub fn get(&self, address: &str) -> Option<AddressStatus> {
        self.entries.lock().get(address).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, AddressStatus> {
        self.entries.lock().clone()
    }
}

/// Tracks per-listener-URI status, behind a read-write lock so status reads never block for long
/// behind writers (§5).
#[derive(Default)]
pub struct ListenerStatusTable {
    entries: parking_lot::RwLock<HashMap<String, ListenerStatus>>,
}

impl ListenerStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, uri: &str, status: ListenerStatus) {
        self.entries.write().insert(uri.to_string(), status);
    }

    pub fn get(&self, uri: &str) -> Option<ListenerStatus> {
        self.entries.read().get(uri).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, ListenerStatus> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_does_not_clobber_a_recorded_error() {
        let status = ConnectionStatus::new();
        let now = SystemTime::now();
        status.set("addr", Some("boom".to_string()), false, now);
        status.set("addr", Some("canceled".to_string()), true, now);
        assert_eq!(status.get("addr").unwrap().error, Some("boom".to_string()));
    }

    #[test]
    fn explicit_clear_removes_the_error() {
        let status = ConnectionStatus::new();
        let now = SystemTime::now();
        status.set("addr", Some("boom".to_string()), false, now);
        status.set("addr", None, false, now);
        assert_eq!(status.get("addr").unwrap().error, None);
    }
}

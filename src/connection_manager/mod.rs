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

//! The connection manager proper: the connect loop (`orchestrator`), the two-stage handshake
//! pipeline (`handshake`), the single-task assembly of that pipeline (`pipeline`), the
//! device-connection tracker (`tracker`), and the read-only status surfaces (`status`).

pub mod handshake;
pub mod orchestrator;
pub mod pipeline;
pub mod status;
pub mod tracker;

use std::fmt;

use crate::{connection::ConnectionId, device_id::DeviceID};

/// Broadcast alongside the Model/metrics-facing observability surface so an external layer can
/// observe orchestration without polling `connectionStatus()`. Purely additive: does not change
/// §3/§4 semantics.
#[derive(Debug, Clone)]
pub enum ConnectionManagerEvent {
    Connected { device_id: DeviceID, connection_id: ConnectionId },
    Disconnected { device_id: DeviceID, connection_id: ConnectionId },
    ConnectFailed { device_id: DeviceID, error: String },
    Listening { uri: String },
    ListenFailed { uri: String, error: String },
}

impl fmt::Display for ConnectionManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionManagerEvent::Connected { device_id, connection_id } => {
                write!(f, "Connected({}, {})", crate::device_id::short_str(device_id), connection_id)
            },
            ConnectionManagerEvent::Disconnected { device_id, connection_id } => {
                write!(f, "Disconnected({}, {})", crate::device_id::short_str(device_id), connection_id)
            },
            ConnectionManagerEvent::ConnectFailed { device_id, error } => {
                write!(f, "ConnectFailed({}, {})", crate::device_id::short_str(device_id), error)
            },
            ConnectionManagerEvent::Listening { uri } => write!(f, "Listening({})", uri),
            ConnectionManagerEvent::ListenFailed { uri, error } => write!(f, "ListenFailed({}, {})", uri, error),
        }
    }
}

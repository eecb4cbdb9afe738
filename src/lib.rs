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

//! Connection manager for a peer-to-peer file synchronization daemon.
//!
//! This crate owns dialing, listening, handshake validation and bandwidth
//! shaping for authenticated, encrypted byte streams between a local device
//! and a configured set of remote devices. It does not know anything about
//! the application-layer sync protocol carried over those streams.

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod device_id;
pub mod dial_queue;
pub mod error;
pub mod hello;
pub mod lan;
pub mod limiter;
pub mod model;
pub mod nat;
pub mod next_dial;
pub mod registry;
pub mod restart_supervisor;
pub mod service;
pub mod transports;
pub mod warn_limiter;

#[cfg(test)]
pub mod test_utils;

pub use config::{DeviceConfig, GlobalOptions};
pub use device_id::DeviceID;
pub use error::ConnectionManagerError;
pub use service::{ConnectionManagerService, ServiceConfig};

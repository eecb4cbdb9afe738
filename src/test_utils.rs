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

//! Small builder functions shared across this crate's unit tests, cheaper than a full factory
//! hierarchy since every caller just needs a quick, distinguishable value to assert against.

use std::time::SystemTime;

use crate::{config::Uri, connection::DialTarget, device_id::DeviceID, hello::Hello};

/// A `DeviceID` whose bytes are all `byte`, easy to eyeball in test assertions and to compare for
/// ordering (`build_device_id(1) < build_device_id(2)`).
pub fn build_device_id(byte: u8) -> DeviceID {
    DeviceID::from_bytes([byte; 32])
}

/// A `Hello` with innocuous placeholder text fields and a caller-supplied timestamp, since the
/// timestamp is the field most tests actually vary (it feeds `ConnectionId::generate`).
pub fn build_hello(timestamp: i64) -> Hello {
    Hello {
        device_name: "test-device".to_string(),
        client_name: "connmgr-tests".to_string(),
        client_version: "0.1.0".to_string(),
        timestamp,
        num_connections: 1,
    }
}

/// A `DialTarget` for `device_id` at `priority`, addressed at a fixed loopback TCP URI so callers
/// that don't care about the address can ignore it.
pub fn build_dial_target(device_id: DeviceID, priority: i32) -> DialTarget {
    let uri = Uri::parse("tcp://127.0.0.1:22000").expect("constant test URI always parses");
    DialTarget {
        address: "tcp://127.0.0.1:22000".to_string(),
        uri,
        dialer_name: "tcp".to_string(),
        priority,
        device_id,
    }
}

/// `SystemTime` offset `secs_ago` seconds into the past, for dial-queue/next-dial tests that sort
/// or gate on recency.
pub fn seconds_ago(secs_ago: u64) -> SystemTime {
    SystemTime::now() - std::time::Duration::from_secs(secs_ago)
}

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

//! Per-device rate-limited warnings (§4.1.5, §7): a device that's been unreachable for a while
//! would otherwise log a fresh warning every connect-loop tick. Keyed by [`DeviceID`] rather than
//! a single global timestamp, so one noisy device doesn't suppress a first-time warning about a
//! different one.

use std::{collections::HashMap, time::{Duration, Instant}};

use parking_lot::Mutex;

use crate::device_id::DeviceID;

/// How long a device's warning stays suppressed after it fires once (§4.1.5: "one warning per 15
/// minutes per device").
pub const WARN_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct WarnRateLimiter {
    last_warned: Mutex<HashMap<DeviceID, Instant>>,
}

impl WarnRateLimiter {
    pub fn new() -> Self {
        Self {
            last_warned: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` the first time it's called for `device_id`, and then at most once per
    /// [`WARN_INTERVAL`] thereafter. Callers should log at `warn` only when this returns `true`,
    /// and otherwise fall back to a `debug`-level log of the same event.
    pub fn should_warn(&self, device_id: &DeviceID, now: Instant) -> bool {
        let mut last_warned = self.last_warned.lock();
        match last_warned.get(device_id) {
            Some(&last) if now.duration_since(last) < WARN_INTERVAL => false,
            _ => {
                last_warned.insert(*device_id, now);
                true
            },
        }
    }
}

impl Default for WarnRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(byte: u8) -> DeviceID {
        DeviceID::from_bytes([byte; 32])
    }

    #[test]
    fn first_warning_always_fires() {
        let limiter = WarnRateLimiter::new();
        assert!(limiter.should_warn(&device(1), Instant::now()));
    }

    #[test]
    fn repeated_warnings_within_the_interval_are_suppressed() {
        let limiter = WarnRateLimiter::new();
        let now = Instant::now();
        assert!(limiter.should_warn(&device(1), now));
        assert!(!limiter.should_warn(&device(1), now + Duration::from_secs(60)));
        assert!(!limiter.should_warn(&device(1), now + WARN_INTERVAL - Duration::from_secs(1)));
        assert!(limiter.should_warn(&device(1), now + WARN_INTERVAL + Duration::from_secs(1)));
    }

    #[test]
    fn distinct_devices_are_tracked_independently() {
        let limiter = WarnRateLimiter::new();
        let now = Instant::now();
        assert!(limiter.should_warn(&device(1), now));
        assert!(limiter.should_warn(&device(2), now));
    }
}

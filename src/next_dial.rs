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

//! Per-(device, address) redial cool-down (§4.1.4): a device that forces three redials within two
//! minutes is locked out from being dialed again for five minutes, to stop a flapping peer from
//! monopolising the dialer.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::device_id::DeviceID;

const REDIAL_WINDOW: Duration = Duration::from_secs(2 * 60);
const REDIAL_THRESHOLD: u32 = 3;
const COOLDOWN_DURATION: Duration = Duration::from_secs(5 * 60);

struct Entry {
    /// Timestamps of forced redials within the current window, oldest first.
    redials: Vec<Instant>,
    cooldown_until: Option<Instant>,
    /// Earliest time this address may be dialed again (§4.1.1's `nextDialAt`). Set to a short
    /// tentative value the moment a dial is attempted, then replaced with `now +
    /// dialer.redialFrequency()` once the attempt (success or failure) completes, so a second
    /// connect-loop tick can't pile on a dial that's already in flight.
    next_dial_at: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            redials: Vec::new(),
            cooldown_until: None,
            next_dial_at: None,
        }
    }
}

/// Tentative hold placed on an address as soon as a dial for it is attempted (§4.1.1), so a
/// concurrent or immediately-following tick doesn't also dial it while the first attempt is still
/// in flight.
const TENTATIVE_HOLD: Duration = Duration::from_secs(60);

/// Tracks the earliest time each `(DeviceID, address)` pair may next be dialed. Forced redials
/// (a connect attempt triggered before the address's natural next-dial time, e.g. by an
/// operator-initiated reconnect) accumulate towards the cool-down threshold.
pub struct NextDialRegistry {
    entries: Mutex<HashMap<(DeviceID, String), Entry>>,
}

impl NextDialRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `device_id`/`address` is currently in cool-down and must not be dialed.
    pub fn is_cooling_down(&self, device_id: &DeviceID, address: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&(*device_id, address.to_string())) else {
            return false;
        };
        match entry.cooldown_until {
            Some(until) if now < until => true,
            Some(_) => {
                // Cooldown has elapsed; reset state (§4.1.4: counter resets after cool-down).
                entry.cooldown_until = None;
                entry.redials.clear();
                false
            },
            None => false,
        }
    }

    /// Records a forced redial; if this is the third within the window, enters cool-down.
    pub fn record_forced_redial(&self, device_id: &DeviceID, address: &str, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((*device_id, address.to_string()))
            .or_insert_with(Entry::new);

        entry.redials.retain(|&t| now.duration_since(t) < REDIAL_WINDOW);
        entry.redials.push(now);

        if entry.redials.len() as u32 >= REDIAL_THRESHOLD {
            entry.cooldown_until = Some(now + COOLDOWN_DURATION);
            entry.redials.clear();
        }
    }

    /// Drops entries whose cool-down has long since expired and which have no recent redial
    /// activity, run periodically so the map doesn't grow unbounded over the life of the process.
    pub fn garbage_collect(&self, now: Instant) {
        self.entries.lock().retain(|_, entry| {
            let cooldown_active = entry.cooldown_until.map(|until| now < until).unwrap_or(false);
            let has_recent_redials = entry.redials.iter().any(|&t| now.duration_since(t) < REDIAL_WINDOW);
            let hold_active = entry.next_dial_at.map(|at| now < at).unwrap_or(false);
            cooldown_active || has_recent_redials || hold_active
        });
    }

    /// Whether `device_id`/`address` may be dialed now, i.e. its `nextDialAt` has passed or was
    /// never set (§4.1.1 step: "if not in rampup and nextDialAt(device,addr) > now, skip").
    pub fn is_ready(&self, device_id: &DeviceID, address: &str, now: Instant) -> bool {
        let entries = self.entries.lock();
        match entries.get(&(*device_id, address.to_string())) {
            Some(entry) => entry.next_dial_at.map(|at| now >= at).unwrap_or(true),
            None => true,
        }
    }

    /// Places the short tentative hold on `address` the moment a dial attempt for it starts.
    pub fn mark_dial_attempted(&self, device_id: &DeviceID, address: &str, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((*device_id, address.to_string())).or_insert_with(Entry::new);
        entry.next_dial_at = Some(now + TENTATIVE_HOLD);
    }

    /// Replaces the tentative hold with the dialer's actual redial frequency once a dial attempt
    /// (successful or not) has finished.
    pub fn set_next_dial_at(&self, device_id: &DeviceID, address: &str, redial_frequency: Duration, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((*device_id, address.to_string())).or_insert_with(Entry::new);
        entry.next_dial_at = Some(now + redial_frequency);
    }
}

impl Default for NextDialRegistry {
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
    fn three_forced_redials_within_window_triggers_cooldown() {
        let registry = NextDialRegistry::new();
        let d = device(1);
        let now = Instant::now();

        registry.record_forced_redial(&d, "tcp://1.2.3.4:22000", now);
        assert!(!registry.is_cooling_down(&d, "tcp://1.2.3.4:22000", now));

        registry.record_forced_redial(&d, "tcp://1.2.3.4:22000", now + Duration::from_secs(10));
        assert!(!registry.is_cooling_down(&d, "tcp://1.2.3.4:22000", now + Duration::from_secs(10)));

        registry.record_forced_redial(&d, "tcp://1.2.3.4:22000", now + Duration::from_secs(20));
        assert!(registry.is_cooling_down(&d, "tcp://1.2.3.4:22000", now + Duration::from_secs(20)));
    }

    #[test]
    fn cooldown_expires_and_counter_resets() {
        let registry = NextDialRegistry::new();
        let d = device(2);
        let now = Instant::now();

        for i in 0..3 {
            registry.record_forced_redial(&d, "addr", now + Duration::from_secs(i));
        }
        assert!(registry.is_cooling_down(&d, "addr", now + Duration::from_secs(3)));

        let after_cooldown = now + COOLDOWN_DURATION + Duration::from_secs(3 * 60 + 1);
        assert!(!registry.is_cooling_down(&d, "addr", after_cooldown));

        // Counter reset: two more redials shouldn't retrigger cooldown immediately.
        registry.record_forced_redial(&d, "addr", after_cooldown);
        registry.record_forced_redial(&d, "addr", after_cooldown + Duration::from_secs(1));
        assert!(!registry.is_cooling_down(&d, "addr", after_cooldown + Duration::from_secs(1)));
    }

    #[test]
    fn marking_a_dial_attempted_holds_the_address_until_replaced() {
        let registry = NextDialRegistry::new();
        let d = device(4);
        let now = Instant::now();

        assert!(registry.is_ready(&d, "addr", now));
        registry.mark_dial_attempted(&d, "addr", now);
        assert!(!registry.is_ready(&d, "addr", now));
        assert!(!registry.is_ready(&d, "addr", now + Duration::from_secs(30)));

        registry.set_next_dial_at(&d, "addr", Duration::from_secs(60), now);
        assert!(!registry.is_ready(&d, "addr", now + Duration::from_secs(30)));
        assert!(registry.is_ready(&d, "addr", now + Duration::from_secs(61)));
    }

    #[test]
    fn redials_outside_the_window_do_not_accumulate() {
        let registry = NextDialRegistry::new();
        let d = device(3);
        let now = Instant::now();

        registry.record_forced_redial(&d, "addr", now);
        registry.record_forced_redial(&d, "addr", now + REDIAL_WINDOW + Duration::from_secs(1));
        registry.record_forced_redial(&d, "addr", now + REDIAL_WINDOW + Duration::from_secs(2));
        assert!(!registry.is_cooling_down(&d, "addr", now + REDIAL_WINDOW + Duration::from_secs(2)));
    }
}

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

//! Dial queue ordering (§4.1.2): devices that have never connected sort last, the rest by most
//! recently seen first; devices not seen in the last week are shuffled amongst themselves so that
//! a single consistently-unreachable device doesn't permanently starve its neighbours of dial
//! attempts.

use std::time::{Duration, SystemTime};

use rand::seq::SliceRandom;

use crate::device_id::DeviceID;

/// How far back "recently seen" reaches before a device's dial order is randomised (§4.1.2).
pub const RECENTLY_SEEN_CUTOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One candidate device awaiting a dial attempt this connect-loop tick.
#[derive(Debug, Clone)]
pub struct DialQueueEntry {
    pub device_id: DeviceID,
    /// `None` means this device has never had a successful connection (§4.1.2: sorts last).
    pub last_seen: Option<SystemTime>,
    /// `true` for devices with no stable direct address (only `"dynamic"` or `relay://` entries
    /// configured): their connections churn more, so they sort after every stable entry (§4.1.2).
    pub short_lived: bool,
}

/// Sorts `entries` in place per §4.1.2 and §8 scenario 4:
///
/// 1. Entries with `short_lived: true` sort after every stable (`short_lived: false`) entry.
/// 2. Within each of those two groups, devices with `last_seen: None` sort after every device
///    with a known `last_seen`.
/// 3. Amongst devices with a known `last_seen`, those seen within [`RECENTLY_SEEN_CUTOFF`] of
///    `now` sort by `last_seen` descending (most recent first).
/// 4. Devices last seen longer ago than the cutoff are shuffled amongst themselves and placed
///    after the recently-seen group but before the never-seen group.
pub fn sort_dial_queue(entries: &mut Vec<DialQueueEntry>, now: SystemTime) {
    let (short_lived, stable): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.short_lived);

    entries.extend(sort_group(stable, now));
    entries.extend(sort_group(short_lived, now));
}

fn sort_group(group: Vec<DialQueueEntry>, now: SystemTime) -> Vec<DialQueueEntry> {
    let (never_seen, seen): (Vec<_>, Vec<_>) = group.into_iter().partition(|e| e.last_seen.is_none());

    let (mut recent, mut stale): (Vec<_>, Vec<_>) = seen.into_iter().partition(|e| {
        now.duration_since(e.last_seen.expect("partitioned on Some"))
            .map(|age| age < RECENTLY_SEEN_CUTOFF)
            .unwrap_or(true) // clock skew into the future counts as "just seen"
    });

    recent.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    stale.shuffle(&mut rand::thread_rng());

    let mut out = Vec::with_capacity(recent.len() + stale.len() + never_seen.len());
    out.extend(recent);
    out.extend(stale);
    out.extend(never_seen);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(byte: u8) -> DeviceID {
        DeviceID::from_bytes([byte; 32])
    }

    fn ago(now: SystemTime, secs: u64) -> SystemTime {
        now - Duration::from_secs(secs)
    }

    #[test]
    fn recently_seen_devices_sort_most_recent_first_and_never_seen_sorts_last() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let d1 = device(1); // -2h
        let d2 = device(2); // -5h
        let d3 = device(3); // -25h
        let d4 = device(4); // -50h
        let d5 = device(5); // never seen

        let mut entries = vec![
            DialQueueEntry {
                device_id: d4,
                last_seen: Some(ago(now, 50 * 3600)),
                short_lived: false,
            },
            DialQueueEntry {
                device_id: d2,
                last_seen: Some(ago(now, 5 * 3600)),
                short_lived: false,
            },
            DialQueueEntry {
                device_id: d5,
                last_seen: None,
                short_lived: false,
            },
            DialQueueEntry {
                device_id: d1,
                last_seen: Some(ago(now, 2 * 3600)),
                short_lived: false,
            },
            DialQueueEntry {
                device_id: d3,
                last_seen: Some(ago(now, 25 * 3600)),
                short_lived: false,
            },
        ];

        sort_dial_queue(&mut entries, now);
        let order: Vec<DeviceID> = entries.iter().map(|e| e.device_id).collect();
        assert_eq!(order, vec![d1, d2, d3, d4, d5]);
    }

    #[test]
    fn stale_devices_beyond_the_cutoff_are_shuffled_relative_to_each_other() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000_000);
        let d1 = device(1); // -2h, recent
        let d2 = device(2); // -5h, recent
        let d3 = device(3); // -25d, stale
        let d4 = device(4); // -50d, stale

        let mut saw_other_order = false;
        for _ in 0..200 {
            let mut entries = vec![
                DialQueueEntry {
                    device_id: d1,
                    last_seen: Some(ago(now, 2 * 3600)),
                    short_lived: false,
                },
                DialQueueEntry {
                    device_id: d2,
                    last_seen: Some(ago(now, 5 * 3600)),
                    short_lived: false,
                },
                DialQueueEntry {
                    device_id: d3,
                    last_seen: Some(ago(now, 25 * 24 * 3600)),
                    short_lived: false,
                },
                DialQueueEntry {
                    device_id: d4,
                    last_seen: Some(ago(now, 50 * 24 * 3600)),
                    short_lived: false,
                },
            ];
            sort_dial_queue(&mut entries, now);
            let order: Vec<DeviceID> = entries.iter().map(|e| e.device_id).collect();
            // The recently-seen prefix is always d1, d2 in that order.
            assert_eq!(&order[..2], &[d1, d2]);
            // The stale suffix is some permutation of {d3, d4}.
            assert_eq!(order[2..].iter().collect::<std::collections::HashSet<_>>(), [&d3, &d4]
                .into_iter()
                .collect::<std::collections::HashSet<_>>());
            if order[2] == d4 {
                saw_other_order = true;
                break;
            }
        }
        assert!(saw_other_order, "expected to observe both stale orderings over repeated trials");
    }
}

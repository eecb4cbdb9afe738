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

//! The connect loop (§4.1): for every configured, non-paused, non-self device, decides whether
//! anything better than its current connections is reachable, builds a dial queue, and dials in
//! parallel under global and per-device fan-out caps.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use tari_shutdown::ShutdownSignal;
use tokio::sync::Semaphore;

use crate::{
    config::{DeviceConfig, GlobalOptions},
    connection::DialTarget,
    connection_manager::status::ConnectionStatus,
    device_id::DeviceID,
    dial_queue::{sort_dial_queue, DialQueueEntry},
    error::DialError,
    lan::{InterfaceAddresses, LanClassifier},
    next_dial::NextDialRegistry,
    registry::Registry,
};

const LOG_TARGET: &str = "connmgr::orchestrator";

/// Global fan-out cap across all in-flight dials (§4.1, §5).
pub const GLOBAL_DIAL_SEMAPHORE: usize = 64;
/// Per-device fan-out cap (§4.1, §5).
pub const PER_DEVICE_DIAL_SEMAPHORE: usize = 8;

const INITIAL_RAMPUP: Duration = Duration::from_secs(1);
const MAX_RAMPUP: Duration = Duration::from_secs(60);
const MIN_SLEEP: Duration = Duration::from_secs(5);
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Neutral element for "no dialer is better than this" comparisons (§4.1 step 2).
pub const WORST_DIALER_PRIORITY: i32 = i32::MAX;

/// Owns the exponential rampup state used to compute the connect loop's sleep duration (§4.1 step
/// 6) until the first full pass with no new dial targets resets it.
pub struct RampupState {
    current: AtomicI32,
}

impl RampupState {
    pub fn new() -> Self {
        Self {
            current: AtomicI32::new(INITIAL_RAMPUP.as_millis() as i32),
        }
    }

    pub fn next_sleep(&self) -> Duration {
        let current_ms = self.current.load(Ordering::Relaxed);
        let next_ms = (current_ms.saturating_mul(2)).min(MAX_RAMPUP.as_millis() as i32);
        self.current.store(next_ms, Ordering::Relaxed);
        Duration::from_millis(current_ms as u64).clamp(MIN_SLEEP, MAX_SLEEP)
    }

    pub fn reset(&self) {
        self.current.store(INITIAL_RAMPUP.as_millis() as i32, Ordering::Relaxed);
    }
}

impl Default for RampupState {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a device has anything worth dialing for this tick (§4.1 step 3).
pub fn should_skip_device(
    current_conns: usize,
    worst_prio: Option<i32>,
    best_dialer_priority: i32,
    upgrade_threshold: i32,
    desired: usize,
) -> bool {
    match worst_prio {
        Some(worst_prio) if current_conns > 0 => {
            best_dialer_priority.saturating_add(upgrade_threshold) >= worst_prio && current_conns >= desired
        },
        _ => false,
    }
}

/// Resolves the list of [`DialTarget`]s for one device (§4.1.1): expands `"dynamic"` addresses,
/// deduplicates, applies the redial-throttle/allowed-networks/scheme-resolution checks, and
/// assigns a LAN-bonus-adjusted priority per address.
///
/// `priority_cutoff` is `worstExistingPriority - upgradeThreshold` (or [`WORST_DIALER_PRIORITY`]
/// when the device has no connections yet): a target whose priority can't clear this bar isn't
/// worth dialing, since winning it couldn't possibly upgrade what's already connected (§4.1.1).
/// `current_conns`/`desired` gate targets from families that don't support holding more than one
/// connection to the same device once that quota is already met.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_dial_targets<I: InterfaceAddresses>(
    device: &DeviceConfig,
    registry: &Registry,
    lan: &LanClassifier<I>,
    next_dial: &NextDialRegistry,
    connection_status: &ConnectionStatus,
    in_rampup: bool,
    priority_cutoff: i32,
    current_conns: usize,
    forced: bool,
    resolve_dynamic: impl Fn(&DeviceID) -> Vec<String>,
) -> Vec<DialTarget> {
    let mut targets = Vec::new();
    let mut seen_addresses = HashSet::new();
    let now = Instant::now();
    let desired = device.desired_connections();

    let mut addresses = Vec::new();
    for address in &device.addresses {
        let trimmed = address.trim();
        if trimmed == crate::config::DYNAMIC_ADDRESS {
            addresses.extend(resolve_dynamic(&device.device_id));
        } else {
            addresses.push(trimmed.to_string());
        }
    }

    for address in addresses {
        let address = address.trim().to_string();
        if !seen_addresses.insert(address.clone()) {
            continue;
        }

        // A forced redial (dialNow(Some(deviceId)), or §4.2 step 7's post-disconnect signal)
        // bypasses the per-address nextDialAt throttle but never the cool-down registry itself —
        // a device already locked out stays locked out (§4.1.4, §4.1 contract).
        if !in_rampup && next_dial.is_cooling_down(&device.device_id, &address, now) {
            continue;
        }
        if forced {
            next_dial.record_forced_redial(&device.device_id, &address, now);
        } else if !in_rampup && !next_dial.is_ready(&device.device_id, &address, now) {
            continue;
        }

        let uri = match crate::config::Uri::parse(&address) {
            Ok(uri) => uri,
            Err(err) => {
                connection_status.set(
                    &address,
                    Some(err.to_string()),
                    false,
                    SystemTime::now(),
                );
                continue;
            },
        };

        if !device.allowed_networks.is_empty() {
            if let Ok(ip) = uri.host.parse() {
                if !crate::config::is_allowed_network(&ip, &device.allowed_networks) {
                    continue;
                }
            }
        }

        let Some(factory) = registry.dialer_factory(uri.scheme) else {
            log::debug!(target: LOG_TARGET, "no dialer for scheme {:?}, skipping {}", uri.scheme, address);
            continue;
        };

        let dialer = match factory.new_dialer(registry) {
            Ok(dialer) => dialer,
            Err(err) => {
                log::debug!(target: LOG_TARGET, "dialer unavailable for {}: {}", address, err);
                continue;
            },
        };

        if current_conns >= desired.max(1) && !dialer.allows_multiple_connections() {
            continue;
        }

        let mut priority = dialer.priority(&uri.host);
        if !factory.always_wan() && lan.is_lan_host(&uri.host) {
            priority -= 1;
        }

        if current_conns > 0 && priority >= priority_cutoff {
            continue;
        }

        targets.push(DialTarget {
            address: address.clone(),
            uri,
            dialer_name: factory.name().to_string(),
            priority,
            device_id: device.device_id,
        });
    }

    targets
}

/// Groups targets by priority and dials each group's targets concurrently under the two
/// semaphores, stopping at the first successful connection per group (§4.1.3). Places and then
/// replaces each target's `nextDialAt` hold (§4.1.1) around the dial attempt regardless of
/// outcome, so a failed dial still backs off for `redial_frequency` rather than being retried on
/// the very next tick.
pub async fn dial_parallel(
    device_id: DeviceID,
    targets: Vec<DialTarget>,
    global_semaphore: Arc<Semaphore>,
    registry: Arc<Registry>,
    next_dial: Arc<NextDialRegistry>,
) -> Option<crate::connection::IntermediateConn> {
    let per_device_semaphore = Arc::new(Semaphore::new(PER_DEVICE_DIAL_SEMAPHORE));
    let mut by_priority: HashMap<i32, Vec<DialTarget>> = HashMap::new();
    for target in targets {
        by_priority.entry(target.priority).or_default().push(target);
    }
    let mut priorities: Vec<i32> = by_priority.keys().copied().collect();
    priorities.sort();

    for priority in priorities {
        let group = by_priority.remove(&priority).unwrap_or_default();
        let mut handles = Vec::new();
        for target in group {
            let global = global_semaphore.clone();
            let per_device = per_device_semaphore.clone();
            let registry = registry.clone();
            let next_dial = next_dial.clone();
            next_dial.mark_dial_attempted(&device_id, &target.address, Instant::now());
            handles.push(tokio::spawn(async move {
                let _global_permit = global.acquire_owned().await.ok()?;
                let _device_permit = per_device.acquire_owned().await.ok()?;
                let factory = registry.dialer_factory(target.uri.scheme)?;
                let dialer = factory.new_dialer(&registry).ok()?;
                let result = dialer.dial(&device_id, &target).await;
                next_dial.set_next_dial_at(&device_id, &target.address, dialer.redial_frequency(), Instant::now());
                result.ok()
            }));
        }

        let mut winner = None;
        for handle in handles {
            if let Ok(Some(conn)) = handle.await {
                if winner.is_none() {
                    winner = Some(conn);
                } else {
                    // Later winners in the same priority group are superfluous; dropping the
                    // IntermediateConn here closes its underlying stream.
                    drop(conn);
                }
            }
        }
        if winner.is_some() {
            return winner;
        }
    }
    None
}

/// Top-level per-iteration body shared by the connect loop (§4.1 steps 1-7), parameterised so unit
/// tests can drive individual steps without a running listener/tracker stack.
pub struct ConnectLoopConfig {
    pub global_options: GlobalOptions,
    pub devices: Vec<DeviceConfig>,
    pub local_device_id: DeviceID,
}

/// Computes `dial_targets` non-empty devices into sorted [`DialQueueEntry`] values ready for
/// [`dial_parallel`] (§4.1 step 3-4).
pub fn build_and_sort_queue(
    mut entries: Vec<DialQueueEntry>,
    now: SystemTime,
) -> Vec<DialQueueEntry> {
    sort_dial_queue(&mut entries, now);
    entries
}

/// Shutdown-aware sleep: returns early if `shutdown` fires (§4.1 step 7, §5 cancellation
/// semantics).
pub async fn sleep_until_next_tick(duration: Duration, dial_now: &mut tokio::sync::mpsc::Receiver<()>, shutdown: &mut ShutdownSignal) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {},
        _ = dial_now.recv() => {},
        _ = shutdown.wait() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_device_when_current_connections_meet_desired_and_nothing_better_reachable() {
        assert!(should_skip_device(2, Some(10), 8, 5, 2));
    }

    #[test]
    fn does_not_skip_when_below_desired_connections() {
        assert!(!should_skip_device(1, Some(10), 8, 5, 2));
    }

    #[test]
    fn does_not_skip_when_no_current_connections() {
        assert!(!should_skip_device(0, None, 8, 5, 2));
    }

    #[test]
    fn rampup_doubles_until_clamped_at_max() {
        let rampup = RampupState::new();
        let first = rampup.next_sleep();
        assert_eq!(first, MIN_SLEEP); // 1s clamped up to the 5s floor
        for _ in 0..10 {
            rampup.next_sleep();
        }
        let later = rampup.next_sleep();
        assert_eq!(later, MAX_SLEEP);
    }
}

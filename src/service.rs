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

//! Top-level wiring (Design Notes §9): `ConnectionManagerService` owns every subsystem field
//! (registry, tracker, limiter, status tables, next-dial registry) with lifetime tied to the
//! service, and exposes the public contract from §4.1 (`start`, `dial_now`, `addresses`,
//! `connection_status`, `listener_status`).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tari_shutdown::ShutdownSignal;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};

use crate::{
    config::Configuration,
    connection_manager::{
        orchestrator::{build_and_sort_queue, dial_parallel, sleep_until_next_tick, RampupState, GLOBAL_DIAL_SEMAPHORE},
        pipeline::{handle_incoming, PipelineContext},
        status::{ConnectionStatus, ListenerStatus, ListenerStatusTable},
        tracker::ConnectionTracker,
        ConnectionManagerEvent,
    },
    device_id::DeviceID,
    dial_queue::DialQueueEntry,
    error::ConnectionManagerError,
    lan::{InterfaceAddresses, LanClassifier},
    limiter::BandwidthLimiter,
    model::Model,
    next_dial::NextDialRegistry,
    registry::Registry,
    warn_limiter::WarnRateLimiter,
};

const LOG_TARGET: &str = "connmgr::service";

/// Wiring-time configuration for [`ConnectionManagerService::new`] — everything the constructor
/// needs that isn't itself a live configuration snapshot (§6's subscribe/commit Configuration is
/// supplied separately via a `watch::Receiver`).
pub struct ServiceConfig {
    pub local_device_id: DeviceID,
    pub upgrade_threshold: i32,
}

/// Owns the live state of the connection manager: the dial scheduler's rampup/cooldown state, the
/// device-connection tracker, the bandwidth limiter, and the read-only status surfaces. Holds no
/// reference back to the Model beyond the capability argument passed into `start` (Design Notes
/// §9: "break the cycle").
pub struct ConnectionManagerService {
    config: ServiceConfig,
    registry: Arc<Registry>,
    tracker: Arc<ConnectionTracker>,
    limiter: Arc<BandwidthLimiter>,
    connection_status: Arc<ConnectionStatus>,
    listener_status: Arc<ListenerStatusTable>,
    next_dial: Arc<NextDialRegistry>,
    rampup: Arc<RampupState>,
    warn_limiter: Arc<WarnRateLimiter>,
    events: broadcast::Sender<ConnectionManagerEvent>,
    dial_now_tx: mpsc::Sender<()>,
    dial_now_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    /// Devices named in a `dialNow(Some(deviceId))` call since the last connect-loop iteration
    /// started; drained each iteration so those devices bypass their per-address `nextDialAt`
    /// throttle without bypassing the cool-down registry itself (§4.1, §4.1.4).
    forced_devices: parking_lot::Mutex<HashSet<DeviceID>>,
}

impl ConnectionManagerService {
    pub fn new(config: ServiceConfig, registry: Registry) -> Self {
        let (events, _) = broadcast::channel(256);
        let (dial_now_tx, dial_now_rx) = mpsc::channel(1);
        Self {
            tracker: Arc::new(ConnectionTracker::new(config.local_device_id, config.upgrade_threshold)),
            limiter: Arc::new(BandwidthLimiter::new()),
            connection_status: Arc::new(ConnectionStatus::new()),
            listener_status: Arc::new(ListenerStatusTable::new()),
            next_dial: Arc::new(NextDialRegistry::new()),
            rampup: Arc::new(RampupState::new()),
            warn_limiter: Arc::new(WarnRateLimiter::new()),
            registry: Arc::new(registry),
            events,
            dial_now_tx,
            dial_now_rx: tokio::sync::Mutex::new(Some(dial_now_rx)),
            forced_devices: parking_lot::Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionManagerEvent> {
        self.events.subscribe()
    }

    /// `dialNow(optional deviceID)` (§4.1 contract): coalescing hint to re-examine dial decisions
    /// on the next tick, bypassing the per-address `nextDialAt` throttle but not the cool-down
    /// registry itself — a device already in cool-down stays excluded from forced redials
    /// (§4.1.4). `None` just wakes the loop early without forcing any particular device's
    /// throttle. Implemented as a buffered-1 channel send that silently drops if already full,
    /// matching the spec's "buffered 1, coalescing" `dialNow` channel (§5).
    pub fn dial_now(&self, device_id: Option<DeviceID>) {
        if let Some(device_id) = device_id {
            self.forced_devices.lock().insert(device_id);
        }
        let _ = self.dial_now_tx.try_send(());
    }

    /// Called back by the Model (or whatever owns the application-level read/write loop, since
    /// the on-wire sync protocol itself is out of scope here, §1) once it observes a connection's
    /// stream has closed. Removes the connection from the tracker and signals `dialNow` for that
    /// device (§4.2 step 7).
    pub fn connection_closed(&self, device_id: DeviceID, connection_id: crate::connection::ConnectionId) {
        self.tracker.remove(&device_id, &connection_id);
        let _ = self.events.send(ConnectionManagerEvent::Disconnected { device_id, connection_id });
        self.dial_now(Some(device_id));
    }

    pub fn connection_status(&self) -> HashMap<String, crate::connection_manager::status::AddressStatus> {
        self.connection_status.snapshot()
    }

    pub fn listener_status(&self) -> HashMap<String, crate::connection_manager::status::ListenerStatus> {
        self.listener_status.snapshot()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.listener_status
            .snapshot()
            .values()
            .flat_map(|status| status.lan.iter().chain(status.wan.iter()))
            .map(|uri| uri.to_string())
            .collect()
    }

    pub fn num_connections(&self) -> usize {
        self.tracker.num_connections()
    }

    /// Starts one listener per configured listen address (§4.3, §5): looks up the matching
    /// [`crate::registry::ListenerFactory`], spawns its accept loop, and records the initial
    /// status so [`Self::listener_status`] has something to report even before the first accept.
    /// Listeners run for the service's full lifetime; `serve` itself applies the restart/backoff
    /// policy on transient failures, so this only needs to start each one once.
    fn spawn_listeners(&self, addresses: &[String], accept_tx: mpsc::Sender<crate::connection::IncomingConn>) {
        for address in addresses {
            let uri = match crate::config::Uri::parse(address) {
                Ok(uri) => uri,
                Err(err) => {
                    self.listener_status.set(
                        address,
                        ListenerStatus {
                            error: Some(err.to_string()),
                            lan: Vec::new(),
                            wan: Vec::new(),
                        },
                    );
                    continue;
                },
            };
            let Some(factory) = self.registry.listener_factory(uri.scheme) else {
                log::debug!(target: LOG_TARGET, "no listener registered for scheme {:?}", uri.scheme);
                continue;
            };
            let listener = match factory.new_listener(&uri, &self.registry) {
                Ok(listener) => listener,
                Err(err) => {
                    self.listener_status.set(
                        address,
                        ListenerStatus {
                            error: Some(err.to_string()),
                            lan: Vec::new(),
                            wan: Vec::new(),
                        },
                    );
                    continue;
                },
            };
            self.listener_status.set(
                address,
                ListenerStatus {
                    error: None,
                    lan: listener.lan_addresses(),
                    wan: listener.wan_addresses(),
                },
            );
            let accept_tx = accept_tx.clone();
            let address = address.clone();
            tokio::spawn(async move {
                if let Err(err) = listener.serve(accept_tx).await {
                    log::warn!(target: LOG_TARGET, "listener for {} exited: {}", address, err);
                }
            });
        }
    }

    /// Runs the connect loop until `shutdown` fires (§4.1 contract: `start(ctx)`). Each iteration
    /// snapshots configuration, decides which devices are worth dialing, sorts the dial queue so
    /// that dials happen in most-recently-seen-first order, dials in parallel, and sleeps until
    /// the next scheduled event (§4.1 steps 1-7). Also starts the configured listeners and the
    /// accept-side handshake pipeline (§4.2, §4.3, §5's accept channel).
    pub async fn start<I: InterfaceAddresses + 'static>(
        &self,
        mut config_rx: watch::Receiver<Configuration>,
        lan: Arc<LanClassifier<I>>,
        model: Arc<dyn Model>,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ConnectionManagerError> {
        let mut dial_now_rx = self
            .dial_now_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ConnectionManagerError::Configuration("start() called more than once".to_string()))?;
        let global_semaphore = Arc::new(Semaphore::new(GLOBAL_DIAL_SEMAPHORE));

        let initial_configuration = config_rx.borrow().clone();
        let (accept_tx, mut accept_rx) = mpsc::channel(256);
        self.spawn_listeners(&initial_configuration.options.listen_addresses, accept_tx.clone());

        let pipeline_ctx = Arc::new(PipelineContext {
            local_device_id: self.config.local_device_id,
            tracker: self.tracker.clone(),
            limiter: self.limiter.clone(),
            connection_status: self.connection_status.clone(),
            events: self.events.clone(),
            model: model.clone(),
            config: config_rx.clone(),
            warn_limiter: self.warn_limiter.clone(),
        });
        tokio::spawn(async move {
            while let Some(incoming) = accept_rx.recv().await {
                let ctx = pipeline_ctx.clone();
                tokio::spawn(async move { handle_incoming(ctx, incoming).await });
            }
        });

        loop {
            let configuration = config_rx.borrow().clone();
            self.limiter.apply_global_options(
                configuration.options.max_recv_kbps,
                configuration.options.max_send_kbps,
                configuration.options.limit_bandwidth_in_lan,
            );
            self.limiter.reconcile_devices(
                configuration
                    .devices
                    .iter()
                    .map(|d| (&d.device_id, d.max_recv_kbps, d.max_send_kbps)),
            );
            let best_dialer_priority = self.registry.best_dialer_priority();
            let device_stats = model.device_statistics();
            let now = std::time::Instant::now();
            self.next_dial.garbage_collect(now);
            let forced_devices = std::mem::take(&mut *self.forced_devices.lock());

            let mut queue_entries: Vec<DialQueueEntry> = Vec::new();
            let mut pending_targets: HashMap<DeviceID, Vec<crate::connection::DialTarget>> = HashMap::new();
            for device in &configuration.devices {
                if device.device_id == self.config.local_device_id || device.paused {
                    continue;
                }
                let current_conns = self.tracker.connections(&device.device_id).len();
                let worst_prio = self.tracker.worst_priority(&device.device_id);
                if crate::connection_manager::orchestrator::should_skip_device(
                    current_conns,
                    worst_prio,
                    best_dialer_priority,
                    self.config.upgrade_threshold,
                    device.desired_connections(),
                ) {
                    continue;
                }
                let priority_cutoff = worst_prio
                    .map(|p| p.saturating_sub(self.config.upgrade_threshold))
                    .unwrap_or(crate::connection_manager::orchestrator::WORST_DIALER_PRIORITY);

                let targets = crate::connection_manager::orchestrator::resolve_dial_targets(
                    device,
                    &self.registry,
                    &lan,
                    &self.next_dial,
                    &self.connection_status,
                    false,
                    priority_cutoff,
                    current_conns,
                    forced_devices.contains(&device.device_id),
                    |_| Vec::new(), // Discoverer wiring left to the embedding binary (§6).
                )
                .await;

                if !targets.is_empty() {
                    let last_seen = device_stats.get(&device.device_id).and_then(|s| s.last_seen);
                    queue_entries.push(DialQueueEntry {
                        device_id: device.device_id,
                        last_seen,
                        short_lived: device.is_short_lived(),
                    });
                    pending_targets.insert(device.device_id, targets);
                }
            }

            let sorted = build_and_sort_queue(queue_entries, std::time::SystemTime::now());
            // Dial in the sorted (recently-seen-first) order so the global fan-out cap is spent on
            // the devices most likely to still be reachable, rather than on configuration order
            // (§4.1.2, §8 scenario 4).
            for entry in &sorted {
                let Some(targets) = pending_targets.remove(&entry.device_id) else { continue };
                let device_id = entry.device_id;
                let global_semaphore = global_semaphore.clone();
                let registry = self.registry.clone();
                let next_dial = self.next_dial.clone();
                let events = self.events.clone();
                let warn_limiter = self.warn_limiter.clone();
                let accept_tx = accept_tx.clone();
                tokio::spawn(async move {
                    match dial_parallel(device_id, targets, global_semaphore, registry, next_dial).await {
                        Some(conn) => {
                            log::debug!(target: LOG_TARGET, "dial succeeded for {}", crate::device_id::short_str(&device_id));
                            // Hand the winning dial to the shared handshake pipeline exactly like an
                            // accepted inbound socket (§2's "dialers... push onto the same channel").
                            let _ = accept_tx
                                .send(crate::connection::IncomingConn {
                                    conn,
                                    direction: crate::connection::ConnectionDirection::Outbound,
                                })
                                .await;
                        },
                        None => {
                            let _ = events.send(ConnectionManagerEvent::ConnectFailed {
                                device_id,
                                error: "no reachable target".to_string(),
                            });
                            if warn_limiter.should_warn(&device_id, std::time::Instant::now()) {
                                log::warn!(target: LOG_TARGET, "unable to reach {}", crate::device_id::short_str(&device_id));
                            } else {
                                log::debug!(target: LOG_TARGET, "unable to reach {}", crate::device_id::short_str(&device_id));
                            }
                        },
                    }
                });
            }

            let sleep_duration = if sorted.is_empty() {
                self.rampup.next_sleep()
            } else {
                self.rampup.reset();
                std::time::Duration::from_secs(self.nominal_reconnect_interval(&configuration))
            };

            tokio::select! {
                _ = sleep_until_next_tick(sleep_duration, &mut dial_now_rx, &mut shutdown) => {},
                _ = shutdown.wait() => return Ok(()),
            }
            if shutdown.is_triggered() {
                return Ok(());
            }
        }
    }

    fn nominal_reconnect_interval(&self, configuration: &Configuration) -> u64 {
        configuration.options.reconnect_interval_s.max(5)
    }
}

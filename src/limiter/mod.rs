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

//! Global and per-device token-bucket bandwidth shaping (§4.4).

mod token_bucket;

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{connection::StreamLike, device_id::DeviceID};
pub use token_bucket::{TokenBucket, BURST_BYTES};

const LOG_TARGET: &str = "connmgr::limiter";

/// One direction's pair of buckets (global, optional per-device). `None` means unlimited.
#[derive(Clone, Default)]
struct DirectionLimiter {
    global: Option<Arc<TokenBucket>>,
    device: Option<Arc<TokenBucket>>,
}

impl DirectionLimiter {
    fn is_unlimited(&self) -> bool {
        self.global.is_none() && self.device.is_none()
    }

    async fn wait_n(&self, n: u32) {
        // Both buckets are consulted; order doesn't matter since each wait is independent and
        // idempotent to call in sequence (§3 invariant: both buckets are debited on every byte).
        if let Some(global) = &self.global {
            global.wait_n(n).await;
        }
        if let Some(device) = &self.device {
            device.wait_n(n).await;
        }
    }
}

/// Owns the global buckets and a per-device bucket table, reconfigured live on every
/// configuration commit (§4.4). This lives as a field on the owning service, not behind a process
/// global (Design Notes §9).
pub struct BandwidthLimiter {
    global_read: RwLock<Option<Arc<TokenBucket>>>,
    global_write: RwLock<Option<Arc<TokenBucket>>>,
    device_read: RwLock<HashMap<DeviceID, Arc<TokenBucket>>>,
    device_write: RwLock<HashMap<DeviceID, Arc<TokenBucket>>>,
    limit_bandwidth_in_lan: RwLock<bool>,
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Self {
            global_read: RwLock::new(None),
            global_write: RwLock::new(None),
            device_read: RwLock::new(HashMap::new()),
            device_write: RwLock::new(HashMap::new()),
            limit_bandwidth_in_lan: RwLock::new(false),
        }
    }

    /// Applies a global options change: updates (or clears) the global buckets in place.
    pub fn apply_global_options(&self, max_recv_kbps: i64, max_send_kbps: i64, limit_bandwidth_in_lan: bool) {
        *self.global_read.write() = kbps_bucket(max_recv_kbps);
        *self.global_write.write() = kbps_bucket(max_send_kbps);
        *self.limit_bandwidth_in_lan.write() = limit_bandwidth_in_lan;
        log::debug!(
            target: LOG_TARGET,
            "global limits updated: recv={:?} send={:?} limit_in_lan={}",
            max_recv_kbps,
            max_send_kbps,
            limit_bandwidth_in_lan
        );
    }

    /// Reconciles per-device buckets against a configuration snapshot: creates buckets for new
    /// devices, updates rates for changed devices, and removes entries for deleted devices (§4.4,
    /// §8 scenario 6).
    pub fn reconcile_devices<'a>(&self, devices: impl Iterator<Item = (&'a DeviceID, i64, i64)>) {
        let mut seen = std::collections::HashSet::new();
        {
            let mut read_map = self.device_read.write();
            let mut write_map = self.device_write.write();
            for (device_id, max_recv_kbps, max_send_kbps) in devices {
                seen.insert(*device_id);
                match kbps_bucket(max_recv_kbps) {
                    Some(bucket) => {
                        read_map.insert(*device_id, bucket);
                    },
                    None => {
                        read_map.remove(device_id);
                    },
                }
                match kbps_bucket(max_send_kbps) {
                    Some(bucket) => {
                        write_map.insert(*device_id, bucket);
                    },
                    None => {
                        write_map.remove(device_id);
                    },
                }
            }
            read_map.retain(|id, _| seen.contains(id));
            write_map.retain(|id, _| seen.contains(id));
        }
    }

    pub fn device_read_limit(&self, device_id: &DeviceID) -> Option<u32> {
        self.device_read.read().get(device_id).map(|b| b.limit())
    }

    pub fn device_write_limit(&self, device_id: &DeviceID) -> Option<u32> {
        self.device_write.read().get(device_id).map(|b| b.limit())
    }

    fn limit_bandwidth_in_lan(&self) -> bool {
        *self.limit_bandwidth_in_lan.read()
    }

    /// Builds the per-connection read/write limiter pair used to wrap a newly established
    /// connection's stream (§4.2 step 5).
    pub fn for_connection(self: &Arc<Self>, device_id: DeviceID, is_local: bool) -> ConnectionLimiters {
        let bypass_lan = is_local && !self.limit_bandwidth_in_lan();
        ConnectionLimiters {
            read: DirectionLimiter {
                global: self.global_read.read().clone(),
                device: self.device_read.read().get(&device_id).cloned(),
            },
            write: DirectionLimiter {
                global: self.global_write.read().clone(),
                device: self.device_write.read().get(&device_id).cloned(),
            },
            bypass: bypass_lan,
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn kbps_bucket(kbps: i64) -> Option<Arc<TokenBucket>> {
    if kbps <= 0 {
        None
    } else {
        Some(Arc::new(TokenBucket::new((kbps as u64 * 1024).min(u32::MAX as u64) as u32)))
    }
}

/// The read/write limiter pair resolved for one connection at the moment it was wrapped. Later
/// global/device rate changes take effect on the *next* `wait_n` call, not retroactively for
/// in-flight waits (§5 ordering guarantees), since each connection holds a fresh `Arc<TokenBucket>`
/// snapshot resolved only once, at connect time.
#[derive(Clone)]
pub struct ConnectionLimiters {
    read: DirectionLimiter,
    write: DirectionLimiter,
    /// `true` when this is a LAN connection and LAN bypass is in effect: both directions skip
    /// limiting entirely (§4.4 fast path).
    bypass: bool,
}

impl ConnectionLimiters {
    pub fn is_unlimited(&self) -> bool {
        self.bypass || (self.read.is_unlimited() && self.write.is_unlimited())
    }
}

/// Wraps a transport stream so every read/write consumes tokens from the applicable buckets
/// (§4.4). When [`ConnectionLimiters::is_unlimited`] the wrapper degenerates to a thin pass-through
/// (the "fast path" the spec calls out to avoid `WaitN` overhead on unthrottled connections).
type WaitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct RateLimitedStream {
    inner: Box<dyn StreamLike>,
    limiters: ConnectionLimiters,
    /// Debt from the previous successful read, charged against the bucket before the *next* read
    /// is allowed to proceed (§4.4's WaitN-before-transfer contract).
    read_wait: Option<WaitFuture>,
    write_wait: Option<WaitFuture>,
}

impl RateLimitedStream {
    pub fn new(inner: Box<dyn StreamLike>, limiters: ConnectionLimiters) -> Self {
        Self {
            inner,
            limiters,
            read_wait: None,
            write_wait: None,
        }
    }
}

impl AsyncRead for RateLimitedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        // Pay down any debt from the previous read before allowing another one through; this is
        // what actually throttles the stream rather than merely accounting for it after the fact.
        if let Some(wait) = this.read_wait.as_mut() {
            match wait.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.read_wait = None,
            }
        }

        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u32;
            if n > 0 && !this.limiters.bypass && !this.limiters.read.is_unlimited() {
                let limiters = this.limiters.read.clone();
                this.read_wait = Some(Box::pin(async move { limiters.wait_n(n).await }));
            }
        }
        poll
    }
}

impl AsyncWrite for RateLimitedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if let Some(wait) = this.write_wait.as_mut() {
            match wait.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.write_wait = None,
            }
        }

        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 && !this.limiters.bypass && !this.limiters.write.is_unlimited() {
                let limiters = this.limiters.write.clone();
                let n = *n as u32;
                this.write_wait = Some(Box::pin(async move { limiters.wait_n(n).await }));
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(byte: u8) -> DeviceID {
        DeviceID::from_bytes([byte; 32])
    }

    #[test]
    fn reconcile_creates_updates_and_removes_device_limiters() {
        let limiter = BandwidthLimiter::new();
        let d1 = device(1);
        let d2 = device(2);

        limiter.reconcile_devices(vec![(&d1, 100, 0), (&d2, 0, 0)].into_iter());
        assert_eq!(limiter.device_read_limit(&d1), Some(100 * 1024));
        assert_eq!(limiter.device_read_limit(&d2), None);

        // d1 removed, d2 updated.
        limiter.reconcile_devices(vec![(&d2, 50, 0)].into_iter());
        assert_eq!(limiter.device_read_limit(&d1), None);
        assert_eq!(limiter.device_read_limit(&d2), Some(50 * 1024));
    }

    #[test]
    fn unlimited_when_no_buckets_configured() {
        let limiter = Arc::new(BandwidthLimiter::new());
        let limiters = limiter.for_connection(device(9), false);
        assert!(limiters.is_unlimited());
    }

    #[test]
    fn lan_bypass_applies_only_when_limit_bandwidth_in_lan_is_false() {
        let limiter = Arc::new(BandwidthLimiter::new());
        limiter.apply_global_options(100, 100, false);
        let lan = limiter.for_connection(device(3), true);
        assert!(lan.is_unlimited());

        limiter.apply_global_options(100, 100, true);
        let lan_limited = limiter.for_connection(device(3), true);
        assert!(!lan_limited.is_unlimited());
    }
}

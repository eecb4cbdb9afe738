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

//! Listener restart/backoff policy shared by every transport family's accept loop: a listener that
//! keeps failing to accept is restarted a couple of times in quick succession, then backed off,
//! rather than spinning hot or giving up outright.

use std::time::{Duration, Instant};

const RESTART_WINDOW: Duration = Duration::from_secs(60);
const MAX_RESTARTS_IN_WINDOW: u32 = 2;
const BACKOFF_DURATION: Duration = Duration::from_secs(60);
/// Consecutive accept failures (not listener restarts) before escalating to a full listener
/// restart rather than just logging and looping.
pub const MAX_CONSECUTIVE_ACCEPT_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the listener immediately.
    RestartNow,
    /// Wait `for_` before restarting.
    BackOff { for_: Duration },
}

/// Tracks listener restarts within a sliding window and consecutive accept failures for one
/// listener instance.
pub struct RestartSupervisor {
    restarts: Vec<Instant>,
    consecutive_accept_failures: u32,
}

impl RestartSupervisor {
    pub fn new() -> Self {
        Self {
            restarts: Vec::new(),
            consecutive_accept_failures: 0,
        }
    }

    /// Call on every accept failure. Returns `true` once [`MAX_CONSECUTIVE_ACCEPT_FAILURES`] is
    /// reached, meaning the caller should restart the listener via [`RestartSupervisor::on_restart`].
    pub fn note_accept_failure(&mut self) -> bool {
        self.consecutive_accept_failures += 1;
        self.consecutive_accept_failures >= MAX_CONSECUTIVE_ACCEPT_FAILURES
    }

    pub fn note_accept_success(&mut self) {
        self.consecutive_accept_failures = 0;
    }

    /// Call when the listener is about to be restarted (either from an accept-failure escalation
    /// or a bind failure). Returns whether to restart immediately or back off first.
    pub fn on_restart(&mut self, now: Instant) -> RestartDecision {
        self.restarts.retain(|&t| now.duration_since(t) < RESTART_WINDOW);
        self.consecutive_accept_failures = 0;

        if self.restarts.len() as u32 >= MAX_RESTARTS_IN_WINDOW {
            RestartDecision::BackOff { for_: BACKOFF_DURATION }
        } else {
            self.restarts.push(now);
            RestartDecision::RestartNow
        }
    }
}

impl Default for RestartSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_after_consecutive_accept_failures() {
        let mut supervisor = RestartSupervisor::new();
        for _ in 0..MAX_CONSECUTIVE_ACCEPT_FAILURES - 1 {
            assert!(!supervisor.note_accept_failure());
        }
        assert!(supervisor.note_accept_failure());
    }

    #[test]
    fn success_resets_the_consecutive_failure_counter() {
        let mut supervisor = RestartSupervisor::new();
        supervisor.note_accept_failure();
        supervisor.note_accept_failure();
        supervisor.note_accept_success();
        for _ in 0..MAX_CONSECUTIVE_ACCEPT_FAILURES - 1 {
            assert!(!supervisor.note_accept_failure());
        }
    }

    #[test]
    fn restarts_twice_then_backs_off() {
        let mut supervisor = RestartSupervisor::new();
        let now = Instant::now();
        assert_eq!(supervisor.on_restart(now), RestartDecision::RestartNow);
        assert_eq!(
            supervisor.on_restart(now + Duration::from_secs(1)),
            RestartDecision::RestartNow
        );
        assert_eq!(
            supervisor.on_restart(now + Duration::from_secs(2)),
            RestartDecision::BackOff { for_: BACKOFF_DURATION }
        );
    }

    #[test]
    fn restart_window_slides() {
        let mut supervisor = RestartSupervisor::new();
        let now = Instant::now();
        supervisor.on_restart(now);
        supervisor.on_restart(now + Duration::from_secs(1));
        let later = now + RESTART_WINDOW + Duration::from_secs(1);
        assert_eq!(supervisor.on_restart(later), RestartDecision::RestartNow);
    }
}

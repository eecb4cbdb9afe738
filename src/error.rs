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

use std::io;

use thiserror::Error;

use crate::device_id::DeviceID;

/// Error kinds distinguished at the dial/listen boundary (§7). `Unsupported` (and its
/// `Disabled`/`Deprecated` cousins) never escalates past debug-level logging.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("scheme '{0}' is not supported by any registered dialer")]
    Unsupported(String),
    #[error("scheme '{0}' is deprecated and no longer dialled")]
    Deprecated(String),
    #[error("scheme '{0}' is disabled by configuration")]
    Disabled(String),
    #[error("failed to parse URI '{0}'")]
    ParseError(String),
    #[error("remote address for device {0} is not in an allowed network")]
    NetworkNotAllowed(DeviceID),
    #[error("device {0} already has the maximum permitted number of connections")]
    DeviceAlreadyConnected(DeviceID),
    #[error("device {0} is on the ignored device list")]
    DeviceIgnored(DeviceID),
    #[error("device {0} is paused")]
    DevicePaused(DeviceID),
    #[error("io error dialling {0}: {1}")]
    Io(String, #[source] io::Error),
    #[error("dial to {0} timed out")]
    Timeout(String),
    #[error("dial was cancelled")]
    Cancelled,
}

impl DialError {
    /// `true` for the error family that should only ever be debug-logged and never escalate
    /// (§7: Unsupported, Disabled, Deprecated, NotInBuild).
    pub fn is_unsupported_family(&self) -> bool {
        matches!(self, DialError::Unsupported(_) | DialError::Deprecated(_) | DialError::Disabled(_))
    }
}

impl HandshakeError {
    /// Classifies the failure for §7's logging rule: a version mismatch gets a rate-limited
    /// warning (it's usually recurring and operator-actionable), everything else an info/debug
    /// log since it's either expected churn (paused device, network blip) or a one-off.
    pub fn failure_kind(&self) -> crate::hello::HelloFailureKind {
        match self {
            HandshakeError::VersionMismatch(..) => crate::hello::HelloFailureKind::VersionMismatch,
            _ => crate::hello::HelloFailureKind::Other,
        }
    }
}

/// Errors from the post-handshake identity + hello validation pipeline (§4.2, §7).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer presented {0} certificates, expected exactly one")]
    WrongCertificateCount(usize),
    #[error("remote device id is the same as the local device id (NAT hairpin)")]
    SelfConnect,
    #[error("device {0} is ignored")]
    DeviceIgnored(DeviceID),
    #[error("device {0} is paused")]
    DevicePaused(DeviceID),
    #[error("device {0} is not in an allowed network")]
    NetworkNotAllowed(DeviceID),
    #[error("global connection limit reached")]
    GlobalLimitReached,
    #[error("device {0} already has the maximum permitted number of connections at this priority")]
    DeviceAlreadyConnected(DeviceID),
    #[error("hello exchange with {0} timed out")]
    HelloTimeout(DeviceID),
    #[error("hello exchange failed: {0}")]
    HelloIo(#[from] io::Error),
    #[error("hello version mismatch with {0}: local={1} remote={2}")]
    VersionMismatch(DeviceID, u32, u32),
    #[error("hello payload exceeded the maximum size")]
    HelloTooLarge,
    #[error("model rejected hello from {0}: {1}")]
    ModelRejected(DeviceID, String),
    #[error("device {0} was removed from configuration while handshaking")]
    DeviceRemoved(DeviceID),
    #[error("certificate name validation failed for {0}")]
    CertificateNameMismatch(DeviceID),
    #[error("tls error: {0}")]
    Tls(String),
}

/// Top-level error aggregating subsystem errors at the [`crate::service::ConnectionManagerService`]
/// boundary.
#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("dial error: {0}")]
    Dial(#[from] DialError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("listener error: {0}")]
    Listener(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
    #[error("operation cancelled")]
    Cancelled,
}

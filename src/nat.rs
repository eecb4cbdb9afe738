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

//! NAT/STUN interface (§4.3.2): an interface-only boundary, same as `Discoverer`/`Model` in
//! `model.rs` — the actual STUN probing and NAT mapping is an external collaborator (§1 explicit
//! non-goal), this crate only defines the shape UDP-capable listeners call into.

use std::net::SocketAddr;

use async_trait::async_trait;

/// A NAT type as reported by the STUN engine; kept opaque (a label string) since the core does
/// not interpret it beyond logging and forwarding via `onNATTypeChanged`.
pub type NatType = String;

/// A live port mapping obtained from [`NatService::new_mapping`].
#[async_trait]
pub trait Mapping: Send + Sync {
    fn external_addresses(&self) -> Vec<SocketAddr>;

    /// Registers a callback fired whenever the mapped external address changes.
    fn on_changed(&self, callback: Box<dyn Fn(SocketAddr) + Send + Sync>);
}

/// External NAT/STUN mapping service (§4.3.2, §6): each UDP-capable listener supplies it a packet
/// connection and receives a `Mapping` back.
#[async_trait]
pub trait NatService: Send + Sync {
    async fn new_mapping(&self, proto: &str, local_addr: SocketAddr) -> anyhow::Result<Box<dyn Mapping>>;
}

/// Callbacks a UDP-capable listener implements to receive STUN state changes (§4.3.2).
pub trait NatObserver: Send + Sync {
    fn on_nat_type_changed(&self, nat_type: NatType);

    fn on_external_address_changed(&self, addr: SocketAddr, via: &str);
}

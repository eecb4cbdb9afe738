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

//! The first bidirectional application message after the TLS handshake (§3, §6).
//!
//! Wire format is a forward-compatible TLV envelope: a `u32` length prefix, then a sequence of
//! `(field_id: u8, len: u16, bytes)` entries. An unknown `field_id` is skipped rather than
//! rejected, so a peer running a newer protocol version can add fields without breaking older
//! peers mid-rollout.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::HandshakeError;

/// Hard cap on the marshalled size of a [`Hello`] (§6).
pub const MAX_HELLO_SIZE: usize = 4 * 1024;

const FIELD_DEVICE_NAME: u8 = 1;
const FIELD_CLIENT_NAME: u8 = 2;
const FIELD_CLIENT_VERSION: u8 = 3;
const FIELD_TIMESTAMP: u8 = 4;
const FIELD_NUM_CONNECTIONS: u8 = 5;

/// The kind of failure a [`Hello`] exchange produced, distinguished so the caller can apply §7's
/// version-mismatch rate-limited-warning rule versus a plain info log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloFailureKind {
    VersionMismatch,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub device_name: String,
    pub client_name: String,
    pub client_version: String,
    /// Nanoseconds since the Unix epoch, per §3.
    pub timestamp: i64,
    /// 0 means "single connection", matching `DeviceConfig::num_connections`.
    pub num_connections: u8,
}

impl Hello {
    pub fn marshal(&self) -> Bytes {
        let mut body = BytesMut::new();
        write_field(&mut body, FIELD_DEVICE_NAME, self.device_name.as_bytes());
        write_field(&mut body, FIELD_CLIENT_NAME, self.client_name.as_bytes());
        write_field(&mut body, FIELD_CLIENT_VERSION, self.client_version.as_bytes());
        write_field(&mut body, FIELD_TIMESTAMP, &self.timestamp.to_be_bytes());
        write_field(&mut body, FIELD_NUM_CONNECTIONS, &[self.num_connections]);

        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Parses a length-prefixed `Hello` from `buf`, advancing it past the message.
    ///
    /// Unrecognised field ids are skipped (forward compatibility); missing recognised fields fall
    /// back to empty/zero defaults rather than erroring, so older or partial peers still connect.
    pub fn unmarshal(buf: &mut Bytes) -> Result<Self, HandshakeError> {
        if buf.remaining() < 4 {
            return Err(HandshakeError::HelloIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated hello length prefix",
            )));
        }
        let len = buf.get_u32() as usize;
        if len > MAX_HELLO_SIZE {
            return Err(HandshakeError::HelloTooLarge);
        }
        if buf.remaining() < len {
            return Err(HandshakeError::HelloIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated hello body",
            )));
        }
        let mut body = buf.copy_to_bytes(len);

        let mut device_name = String::new();
        let mut client_name = String::new();
        let mut client_version = String::new();
        let mut timestamp: i64 = 0;
        let mut num_connections: u8 = 0;

        while body.has_remaining() {
            if body.remaining() < 3 {
                break;
            }
            let field_id = body.get_u8();
            let field_len = body.get_u16() as usize;
            if body.remaining() < field_len {
                break;
            }
            let field_bytes = body.copy_to_bytes(field_len);
            match field_id {
                FIELD_DEVICE_NAME => device_name = String::from_utf8_lossy(&field_bytes).into_owned(),
                FIELD_CLIENT_NAME => client_name = String::from_utf8_lossy(&field_bytes).into_owned(),
                FIELD_CLIENT_VERSION => client_version = String::from_utf8_lossy(&field_bytes).into_owned(),
                FIELD_TIMESTAMP if field_bytes.len() == 8 => {
                    let mut arr = [0u8; 8];
                    arr.copy_from_slice(&field_bytes);
                    timestamp = i64::from_be_bytes(arr);
                },
                FIELD_NUM_CONNECTIONS if !field_bytes.is_empty() => num_connections = field_bytes[0],
                // Unknown (or malformed-for-its-id) field: skip, forward compatibility.
                _ => {},
            }
        }

        Ok(Hello {
            device_name,
            client_name,
            client_version,
            timestamp,
            num_connections,
        })
    }
}

fn write_field(out: &mut BytesMut, field_id: u8, value: &[u8]) {
    out.put_u8(field_id);
    out.put_u16(value.len() as u16);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Hello {
        Hello {
            device_name: "desktop-1".into(),
            client_name: "connmgr".into(),
            client_version: "1.2.3".into(),
            timestamp: 1_700_000_000_000_000_000,
            num_connections: 2,
        }
    }

    #[test]
    fn round_trips_all_fields() {
        let hello = sample();
        let mut marshalled = hello.marshal();
        let parsed = Hello::unmarshal(&mut marshalled).unwrap();
        assert_eq!(hello, parsed);
    }

    #[test]
    fn unknown_trailing_field_is_skipped() {
        let hello = sample();
        let mut body = BytesMut::new();
        write_field(&mut body, FIELD_DEVICE_NAME, hello.device_name.as_bytes());
        write_field(&mut body, FIELD_CLIENT_NAME, hello.client_name.as_bytes());
        write_field(&mut body, FIELD_CLIENT_VERSION, hello.client_version.as_bytes());
        write_field(&mut body, FIELD_TIMESTAMP, &hello.timestamp.to_be_bytes());
        write_field(&mut body, FIELD_NUM_CONNECTIONS, &[hello.num_connections]);
        // A field from a hypothetical future protocol version.
        write_field(&mut body, 200, b"unrecognised-by-this-build");

        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        let mut framed = out.freeze();

        let parsed = Hello::unmarshal(&mut framed).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn rejects_oversized_hello() {
        let mut out = BytesMut::new();
        out.put_u32((MAX_HELLO_SIZE + 1) as u32);
        let mut framed = out.freeze();
        assert!(Hello::unmarshal(&mut framed).is_err());
    }
}

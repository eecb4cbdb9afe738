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

//! Device identity: a fixed-width hash derived from a peer's TLS certificate DER (§3).

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use data_encoding::BASE32;
use sha2::{Digest, Sha256};

/// Length in bytes of a [`DeviceID`].
pub const DEVICE_ID_LEN: usize = 32;

/// Number of base32 characters a 32-byte hash encodes to, unpadded.
const BASE32_LEN: usize = 52;

/// Check digits are inserted every this many data characters.
const CHECK_DIGIT_STRIDE: usize = 13;

/// A device's identity: `SHA-256(certificate DER)`, 32 bytes, with total equality and ordering.
///
/// Immutable once constructed. Two equal `DeviceID`s always refer to the same peer (§3 invariant).
#[derive(Clone, Copy)]
pub struct DeviceID([u8; DEVICE_ID_LEN]);

impl DeviceID {
    /// Derives a `DeviceID` from the DER encoding of a peer's TLS certificate.
    pub fn from_cert_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; DEVICE_ID_LEN];
        bytes.copy_from_slice(&digest);
        DeviceID(bytes)
    }

    /// Constructs a `DeviceID` directly from its raw bytes, e.g. when parsing a config file.
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        DeviceID(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Parses the canonical grouped base32 form (with Luhn-mod-32 check digits), as produced by
    /// [`DeviceID::to_canonical_string`]. Dashes and whitespace are ignored.
    pub fn from_canonical_str(s: &str) -> Result<Self, DeviceIdParseError> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
        if cleaned.len() != BASE32_LEN + BASE32_LEN.div_ceil(CHECK_DIGIT_STRIDE) {
            return Err(DeviceIdParseError::WrongLength(cleaned.len()));
        }

        let mut data = String::with_capacity(BASE32_LEN);
        for (i, chunk) in cleaned.as_bytes().chunks(CHECK_DIGIT_STRIDE + 1).enumerate() {
            let (body, check) = chunk.split_at(chunk.len() - 1);
            let body_str = std::str::from_utf8(body).expect("ascii input");
            let expected_check = luhn32_check_digit(body_str);
            if check[0] != expected_check {
                return Err(DeviceIdParseError::BadCheckDigit(i));
            }
            data.push_str(body_str);
        }

        let mut padded = data.clone();
        // BASE32 decode requires a multiple-of-8 length; pad with the '=' that encoding would have had.
        while padded.len() % 8 != 0 {
            padded.push('=');
        }
        let decoded = BASE32
            .decode(padded.as_bytes())
            .map_err(|_| DeviceIdParseError::InvalidBase32)?;
        if decoded.len() != DEVICE_ID_LEN {
            return Err(DeviceIdParseError::WrongLength(decoded.len()));
        }
        let mut bytes = [0u8; DEVICE_ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(DeviceID(bytes))
    }

    /// Produces the canonical grouped, check-digited display form (§3, §6).
    ///
    /// 32 bytes base32-encode to 52 characters; a Luhn-mod-32 check digit is inserted after every
    /// 13 data characters (4 check digits total, 56 characters), then the 56 characters are
    /// grouped into 8 dash-separated chunks of 7 for readability.
    pub fn to_canonical_string(&self) -> String {
        let encoded = BASE32.encode(&self.0);
        let data = &encoded[..BASE32_LEN];

        let mut with_checks = String::with_capacity(56);
        for chunk in data.as_bytes().chunks(CHECK_DIGIT_STRIDE) {
            let chunk_str = std::str::from_utf8(chunk).expect("ascii input");
            with_checks.push_str(chunk_str);
            with_checks.push(luhn32_check_digit(chunk_str));
        }

        with_checks
            .as_bytes()
            .chunks(7)
            .map(|c| std::str::from_utf8(c).expect("ascii input"))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// `true` if `self` and `other` are the same device (equivalent to `==`, kept for readability
    /// at call sites that compare against the local device identity).
    pub fn is_same_device(&self, other: &DeviceID) -> bool {
        self == other
    }
}

/// Luhn mod 32 check digit over the base32 alphabet, matching the stride used for `DeviceID`
/// check digits. This is a self-consistent round-trip check, not a claim of bit-for-bit
/// compatibility with any particular external device-identity library (§6 defers the exact digest
/// and formatting to that library).
fn luhn32_check_digit(data: &str) -> u8 {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let factor_base: u32 = 2;
    let n: u32 = ALPHABET.len() as u32;
    let mut sum: u32 = 0;
    let mut factor: u32 = 1;

    for &byte in data.as_bytes().iter().rev() {
        let code_point = ALPHABET.iter().position(|&c| c == byte).unwrap_or(0) as u32;
        let mut addend = factor * code_point;
        addend = (addend / n) + (addend % n);
        sum += addend;
        factor = if factor == factor_base { 1 } else { factor_base };
    }

    let remainder = sum % n;
    let check_code_point = (n - remainder) % n;
    ALPHABET[check_code_point as usize]
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceIdParseError {
    #[error("expected a base32-encoded device id, got {0} characters after stripping separators")]
    WrongLength(usize),
    #[error("invalid base32 encoding")]
    InvalidBase32,
    #[error("check digit mismatch in group {0}")]
    BadCheckDigit(usize),
}

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl fmt::Debug for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceID({})", short_str(self))
    }
}

/// A short, log-friendly prefix of the canonical string (first group only).
pub fn short_str(id: &DeviceID) -> String {
    id.to_canonical_string().split('-').next().unwrap_or_default().to_string()
}

impl PartialEq for DeviceID {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for DeviceID {}

impl PartialOrd for DeviceID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceID {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for DeviceID {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl serde::Serialize for DeviceID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where S: serde::Serializer {
        serializer.serialize_str(&self.to_canonical_string())
    }
}

impl<'de> serde::Deserialize<'de> for DeviceID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        DeviceID::from_canonical_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_canonical_string() {
        let id = DeviceID::from_cert_der(b"a fake certificate DER blob");
        let s = id.to_canonical_string();
        let parsed = DeviceID::from_canonical_str(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn canonical_string_is_56_chars_grouped_with_dashes() {
        let id = DeviceID::from_cert_der(b"another certificate");
        let s = id.to_canonical_string();
        let no_dashes: String = s.chars().filter(|c| *c != '-').collect();
        assert_eq!(no_dashes.len(), 56);
        assert_eq!(s.split('-').count(), 8);
    }

    #[test]
    fn detects_corrupted_check_digit() {
        let id = DeviceID::from_cert_der(b"corrupt me");
        let mut s = id.to_canonical_string();
        // Flip the very first character, which is part of a data group, not (necessarily) a check digit.
        unsafe {
            let bytes = s.as_bytes_mut();
            bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
        }
        assert!(DeviceID::from_canonical_str(&s).is_err());
    }

    #[test]
    fn equality_and_ordering_are_total() {
        let a = DeviceID::from_bytes([1u8; 32]);
        let b = DeviceID::from_bytes([2u8; 32]);
        let a2 = DeviceID::from_bytes([1u8; 32]);
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert!(a < b);
    }
}

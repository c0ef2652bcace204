// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! vTPM attestation types - Common type definitions
//!
//! This crate contains type definitions shared across the vTPM verification
//! crates:
//! - vtpm-eventlog (event log decoding and replay)
//! - vtpm-qvl (verifier side - verifies attestations)

use scale::{Decode, Encode};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// PCR bank hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// TPM algorithm identifier (TPM_ALG_ID).
    pub const fn tpm_alg_id(self) -> u16 {
        match self {
            HashAlg::Sha1 => 0x0004,
            HashAlg::Sha256 => 0x000B,
            HashAlg::Sha384 => 0x000C,
            HashAlg::Sha512 => 0x000D,
        }
    }

    pub const fn from_tpm_alg_id(alg_id: u16) -> Option<Self> {
        match alg_id {
            0x0004 => Some(HashAlg::Sha1),
            0x000B => Some(HashAlg::Sha256),
            0x000C => Some(HashAlg::Sha384),
            0x000D => Some(HashAlg::Sha512),
            _ => None,
        }
    }

    pub const fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
            HashAlg::Sha512 => "sha512",
        }
    }

    /// The initial PCR value for this bank.
    pub fn zero_digest(self) -> Vec<u8> {
        vec![0; self.digest_size()]
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }

    /// One PCR extend step: `H(current || extension)`.
    pub fn extend(self, current: &[u8], extension: &[u8]) -> Vec<u8> {
        self.digest_parts(&[current, extension])
    }

    fn digest_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        fn hash<H: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = H::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashAlg::Sha1 => hash::<Sha1>(parts),
            HashAlg::Sha256 => hash::<Sha256>(parts),
            HashAlg::Sha384 => hash::<Sha384>(parts),
            HashAlg::Sha512 => hash::<Sha512>(parts),
        }
    }
}

impl core::fmt::Display for HashAlg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PCR (Platform Configuration Register) value
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PcrValue {
    /// PCR index (0-23)
    pub index: u32,

    /// PCR value (hash)
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl core::fmt::Debug for PcrValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcrValue")
            .field("index", &self.index)
            .field("value", &hex::encode(&self.value))
            .finish()
    }
}

/// A single signed quote over one PCR bank.
#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Quote {
    /// The PCR bank the quote was taken over
    pub hash_alg: HashAlg,

    /// TPMS_ATTEST message
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,

    /// TPMT_SIGNATURE over the message
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,

    /// PCR values covered by the quote
    pub pcr_values: Vec<PcrValue>,
}

impl core::fmt::Debug for Quote {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Quote")
            .field("hash_alg", &self.hash_alg)
            .field("message", &hex::encode(&self.message))
            .field("signature", &hex::encode(&self.signature))
            .field("pcr_values", &self.pcr_values)
            .finish()
    }
}

/// The attestation bundle presented to the verifier.
///
/// Read-only input; the verifier never mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct Attestation {
    /// Attestation Key public area (TPMT_PUBLIC)
    #[serde(with = "hex_bytes")]
    pub ak_pub: Vec<u8>,

    /// Attestation Key certificate (DER format, empty if absent)
    #[serde(with = "hex_bytes")]
    pub ak_cert: Vec<u8>,

    /// Intermediate CA certificates carried with the bundle (DER format)
    pub intermediate_certs: Vec<Vec<u8>>,

    /// Candidate quotes, at most one per PCR bank
    pub quotes: Vec<Quote>,

    /// Raw firmware event log (binary_bios_measurements format, empty if absent)
    #[serde(with = "hex_bytes")]
    pub event_log: Vec<u8>,

    /// Raw canonical event log (CEL-TLV format, empty if absent)
    #[serde(with = "hex_bytes")]
    pub canonical_event_log: Vec<u8>,
}

impl Attestation {
    pub fn from_scale(mut input: &[u8]) -> Result<Self, scale::Error> {
        Self::decode(&mut input)
    }
}

/// Instance identity decoded from the AK certificate extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct GceInstanceInfo {
    pub zone: String,
    pub project_id: String,
    pub project_number: u64,
    pub instance_name: String,
    pub instance_id: u64,
}

/// Platform identity fragment of the machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PlatformState {
    /// Firmware version measured by the S-CRTM version event
    #[serde(with = "hex_bytes")]
    pub firmware_version: Vec<u8>,

    /// Instance identity from the AK certificate, if present
    pub instance_info: Option<GceInstanceInfo>,
}

impl PlatformState {
    pub fn merge(&mut self, other: PlatformState) {
        if !other.firmware_version.is_empty() {
            self.firmware_version = other.firmware_version;
        }
        if other.instance_info.is_some() {
            self.instance_info = other.instance_info;
        }
    }
}

/// A verified firmware event log entry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MeasuredEvent {
    /// PCR index this event was extended to
    pub pcr_index: u32,
    /// TCG event type
    pub event_type: u32,
    /// Digest of this event in the verified bank
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    /// Raw event data
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Whether the digest equals the bank hash of the event data
    pub digest_verified: bool,
}

impl core::fmt::Debug for MeasuredEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MeasuredEvent")
            .field("pcr_index", &self.pcr_index)
            .field("event_type", &self.event_type)
            .field("digest", &hex::encode(&self.digest))
            .field("data", &hex::encode(&self.data))
            .field("digest_verified", &self.digest_verified)
            .finish()
    }
}

/// A verified canonical event log record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RuntimeEvent {
    pub record_number: u64,
    pub pcr_index: u32,
    /// Digest of this record in the verified bank
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    /// CEL content TLV type
    pub content_type: u8,
    /// Raw content TLV value
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
}

impl core::fmt::Debug for RuntimeEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeEvent")
            .field("record_number", &self.record_number)
            .field("pcr_index", &self.pcr_index)
            .field("digest", &hex::encode(&self.digest))
            .field("content_type", &self.content_type)
            .field("content", &hex::encode(&self.content))
            .finish()
    }
}

/// The verified machine state, returned only after full verification.
///
/// The platform fragment comes from the AK certificate; the event fragments
/// come from the two log replays. Fragments are merged field-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MachineState {
    /// The PCR bank the state was verified against
    pub hash: Option<HashAlg>,

    /// Platform identity fragment
    pub platform: Option<PlatformState>,

    /// Events replayed from the firmware event log
    pub boot_events: Vec<MeasuredEvent>,

    /// Records replayed from the canonical event log
    pub runtime_events: Vec<RuntimeEvent>,
}

impl MachineState {
    /// Field-wise merge of another fragment into this one.
    ///
    /// Scalar fields are overwritten when set on the source side, nested
    /// messages merge recursively, vectors append.
    pub fn merge(&mut self, other: MachineState) {
        if other.hash.is_some() {
            self.hash = other.hash;
        }
        match (self.platform.as_mut(), other.platform) {
            (Some(platform), Some(other)) => platform.merge(other),
            (None, Some(other)) => self.platform = Some(other),
            _ => {}
        }
        self.boot_events.extend(other.boot_events);
        self.runtime_events.extend(other.runtime_events);
    }
}

// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! vTPM Quote Verification Library (QVL)
//!
//! This crate verifies vTPM attestations on the verifier side. Given an
//! [`vtpm_types::Attestation`] and a set of [`VerifyOpts`], it establishes
//! that:
//! - the Attestation Key is trusted, either by an explicit allow-list of
//!   public keys or by chaining the AK certificate to a trusted root,
//! - one of the offered quotes was signed by that key over the expected
//!   nonce,
//! - the claimed event logs replay to the signed PCR values.
//!
//! On success [`verify_attestation`] returns the verified
//! [`vtpm_types::MachineState`]; unverified state is never returned.

use anyhow::{Context, Result};
use pem::parse_many;
use rustls_pki_types::CertificateDer;

pub mod akpub;
pub mod extension;
pub mod quote;
mod trust;
mod verify;

pub use akpub::{ak_from_cert, decode_ak_public, AkPublicKey};
pub use extension::{
    decode_instance_info, encode_instance_info, parse_instance_info, RawInstanceInfo,
    RawSecurityProperties, CLOUD_COMPUTE_INSTANCE_IDENTIFIER,
};
pub use quote::{supported_quotes, verify_quote, PCR_HASH_ALGS};
pub use verify::{verify_attestation, verify_attestation_with_time};

/// Verification options.
///
/// Exactly one trust mechanism must be configured: either `trusted_aks`
/// (allow-listed AK public keys, the highest level of assurance) or
/// `trusted_root_certs` (AK certificates must chain to one of these roots).
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct VerifyOpts {
    /// The nonce the quotes are expected to be generated over
    #[builder(default)]
    pub nonce: Vec<u8>,

    /// Allow-listed AK public keys
    #[builder(default)]
    pub trusted_aks: Vec<AkPublicKey>,

    /// Allow SHA-1 PCR banks. SHA-1 is a weak hash algorithm with known
    /// collision attacks, but older clients only produce the legacy log
    /// format. This never allows SHA-1 signatures, only SHA-1 PCRs.
    #[builder(default = false)]
    pub allow_sha1: bool,

    /// Trusted root CA certificates for AK certificate chains (DER)
    #[builder(default)]
    pub trusted_root_certs: Vec<CertificateDer<'static>>,

    /// Additional intermediate CA certificates (DER)
    #[builder(default)]
    pub intermediate_certs: Vec<CertificateDer<'static>>,
}

/// The verification stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or contradictory options
    Configuration,
    /// Untrusted key, or a malformed or non-chaining certificate
    Identity,
    /// Malformed instance identity certificate extension
    Extension,
    /// Quote signature or freshness mismatch
    Quote,
    /// An event log failed to replay against the claimed PCR values
    LogReplay,
    /// A policy gate rejected an otherwise valid candidate
    Policy,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Identity => "identity",
            ErrorKind::Extension => "extension",
            ErrorKind::Quote => "quote",
            ErrorKind::LogReplay => "log replay",
            ErrorKind::Policy => "policy",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct VerificationError {
    pub kind: ErrorKind,
    pub error: anyhow::Error,
}

impl VerificationError {
    pub(crate) fn new(kind: ErrorKind, error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {:#}", self.kind, self.error)
    }
}

impl std::error::Error for VerificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Parse all certificates from a PEM bundle into DER form.
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let pem_items = parse_many(pem).context("failed to parse PEM")?;
    Ok(pem_items
        .into_iter()
        .map(|item| CertificateDer::from(item.into_contents()))
        .collect())
}

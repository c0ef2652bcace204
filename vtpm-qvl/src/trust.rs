// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! Trust establishment: decide whether the Attestation Key is trusted, via
//! an allow-list of public keys or an AK certificate chaining to a trusted
//! root, and extract the platform fragment carried by the certificate.

use anyhow::{anyhow, bail, Context, Result};
use rustls_pki_types::{CertificateDer, UnixTime};
use tracing::debug;
use webpki::EndEntityCert;
use x509_parser::prelude::*;

use crate::akpub::{ak_from_cert, decode_ak_public, AkPublicKey};
use crate::extension::decode_instance_info;
use crate::{ErrorKind, VerificationError, VerifyOpts};
use vtpm_types::{Attestation, MachineState, PlatformState};

// OID 2.23.133.8.1. AK leaf certificates usually carry no EKU while their
// issuing CA carries this one, so it must be accepted where present.
const TCG_KP_AIK_CERTIFICATE: &[u8] = &[0x67, 0x81, 0x05, 0x08, 0x01];

const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

/// Critical extensions the chain verifier interprets itself. Anything
/// critical outside this set (and outside the SAN quirk) fails validation.
const HANDLED_CRITICAL_EXTENSIONS: &[&str] = &[
    "2.5.29.15", // key usage
    "2.5.29.19", // basic constraints
    "2.5.29.30", // name constraints
    "2.5.29.32", // certificate policies
    "2.5.29.36", // policy constraints
    "2.5.29.37", // extended key usage
];

/// The single trust mechanism selected by [`validate_opts`].
#[derive(Debug)]
pub(crate) enum TrustRoute<'a> {
    /// Allow-listed AK public keys.
    TrustedKeys(&'a [AkPublicKey]),
    /// AK certificates must chain to one of these roots.
    RootCerts {
        roots: &'a [CertificateDer<'static>],
        intermediates: &'a [CertificateDer<'static>],
    },
}

/// Check that exactly one trust mechanism is configured.
pub(crate) fn validate_opts(opts: &VerifyOpts) -> Result<TrustRoute<'_>, VerificationError> {
    let check_pub = !opts.trusted_aks.is_empty();
    let check_cert = !opts.trusted_root_certs.is_empty();
    match (check_pub, check_cert) {
        (false, false) => Err(VerificationError::new(
            ErrorKind::Configuration,
            anyhow!("no trust mechanism provided, use either trusted_aks or trusted_root_certs"),
        )),
        (true, true) => Err(VerificationError::new(
            ErrorKind::Configuration,
            anyhow!(
                "multiple trust mechanisms provided, use only one of trusted_aks or \
                 trusted_root_certs"
            ),
        )),
        (true, false) => Ok(TrustRoute::TrustedKeys(&opts.trusted_aks)),
        (false, true) => Ok(TrustRoute::RootCerts {
            roots: &opts.trusted_root_certs,
            intermediates: &opts.intermediate_certs,
        }),
    }
}

/// Establish that the attestation's AK is trusted.
///
/// Returns the AK public key the quotes must verify against, plus the
/// platform fragment extracted from the AK certificate (empty on the raw
/// key path).
pub(crate) fn establish_trust(
    attestation: &Attestation,
    route: &TrustRoute<'_>,
    time: UnixTime,
) -> Result<(AkPublicKey, MachineState), VerificationError> {
    let identity = |error: anyhow::Error| VerificationError::new(ErrorKind::Identity, error);

    if attestation.ak_cert.is_empty() {
        // No certificate: the AK public area must be on the allow-list.
        let ak = decode_ak_public(&attestation.ak_pub)
            .context("failed to decode AK public area")
            .map_err(identity)?;
        check_allow_list(&ak, route).map_err(identity)?;
        return Ok((ak, MachineState::default()));
    }

    // A certificate takes precedence over the public area.
    let (_, cert) = X509Certificate::from_der(&attestation.ak_cert)
        .map_err(|e| identity(anyhow!("failed to parse AK certificate: {e}")))?;
    let ak = ak_from_cert(&cert).map_err(identity)?;

    let TrustRoute::RootCerts {
        roots,
        intermediates,
    } = route
    else {
        // Allow-listed keys trump the certificate; no chain is attempted and
        // no platform fragment is extracted.
        check_allow_list(&ak, route).map_err(identity)?;
        return Ok((ak, MachineState::default()));
    };

    audit_critical_extensions(&cert).map_err(identity)?;

    let mut pool: Vec<CertificateDer<'static>> = intermediates.to_vec();
    for der in &attestation.intermediate_certs {
        pool.push(CertificateDer::from(der.clone()));
    }
    verify_cert_chain(&attestation.ak_cert, roots, &pool, time).map_err(identity)?;
    debug!("AK certificate chained to a trusted root");

    let instance_info = decode_instance_info(&cert)
        .context("error getting instance info")
        .map_err(|e| VerificationError::new(ErrorKind::Extension, e))?;

    let state = MachineState {
        platform: Some(PlatformState {
            instance_info,
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok((ak, state))
}

fn check_allow_list(ak: &AkPublicKey, route: &TrustRoute<'_>) -> Result<()> {
    let trusted = match route {
        TrustRoute::TrustedKeys(keys) => *keys,
        TrustRoute::RootCerts { .. } => &[],
    };
    if !trusted.contains(ak) {
        bail!("AK public key is not trusted");
    }
    Ok(())
}

/// Fail on critical extensions the chain verifier would not interpret.
///
/// The SAN extension is exempted: AK certificates carry only vendor name
/// forms in it, which generic parsers treat as unhandled even though the
/// names are irrelevant to chain building.
fn audit_critical_extensions(cert: &X509Certificate) -> Result<()> {
    let unhandled = strip_san_quirk(unhandled_critical_extensions(cert));
    if !unhandled.is_empty() {
        bail!("certificate contains unhandled critical extensions: {unhandled:?}");
    }
    Ok(())
}

fn unhandled_critical_extensions(cert: &X509Certificate) -> Vec<String> {
    cert.extensions()
        .iter()
        .filter(|ext| ext.critical)
        .map(|ext| ext.oid.to_id_string())
        .filter(|oid| !HANDLED_CRITICAL_EXTENSIONS.contains(&oid.as_str()))
        .collect()
}

fn strip_san_quirk(oids: Vec<String>) -> Vec<String> {
    oids.into_iter()
        .filter(|oid| oid != OID_SUBJECT_ALT_NAME)
        .collect()
}

fn verify_cert_chain(
    ak_cert_der: &[u8],
    roots: &[CertificateDer<'static>],
    intermediates: &[CertificateDer<'static>],
    time: UnixTime,
) -> Result<()> {
    let cert_der = CertificateDer::from(ak_cert_der.to_vec());
    let end_entity = EndEntityCert::try_from(&cert_der)
        .map_err(|e| anyhow!("failed to parse AK certificate: {e:?}"))?;

    let trust_anchors = roots
        .iter()
        .map(webpki::anchor_from_trusted_cert)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to create trust anchor: {e:?}"))?;

    let key_usage = webpki::KeyUsage::required_if_present(TCG_KP_AIK_CERTIFICATE);
    end_entity
        .verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &trust_anchors,
            intermediates,
            time,
            key_usage,
            None,
            None,
        )
        .map_err(|e| anyhow!("certificate did not chain to a trusted root: {e:?}"))?;
    Ok(())
}

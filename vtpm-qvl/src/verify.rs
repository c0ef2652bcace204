// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! Attestation verification orchestrator.

use anyhow::{anyhow, Context};
use rustls_pki_types::UnixTime;
use tracing::{debug, warn};

use crate::quote::{supported_quotes, verify_quote, PCR_HASH_ALGS};
use crate::trust::{establish_trust, validate_opts};
use crate::{ErrorKind, VerificationError, VerifyOpts};
use vtpm_eventlog::{replay_canonical_log, replay_firmware_log};
use vtpm_types::{Attestation, HashAlg, MachineState};

/// Verify an attestation against the configured options.
///
/// Establishes that the AK is trusted, that one of the offered quotes was
/// signed by that AK over the expected nonce, and that both event logs
/// replay to the quoted PCR values. Candidates are tried in order of hash
/// preference; the error of the last failed candidate is surfaced when all
/// fail. On success the merged [`MachineState`] is returned; unverified
/// state is never returned.
pub fn verify_attestation(
    attestation: &Attestation,
    opts: &VerifyOpts,
) -> Result<MachineState, VerificationError> {
    let now = UnixTime::now();
    verify_attestation_with_time(attestation, opts, now)
}

/// [`verify_attestation`] with an explicit certificate-validation time.
pub fn verify_attestation_with_time(
    attestation: &Attestation,
    opts: &VerifyOpts,
    time: UnixTime,
) -> Result<MachineState, VerificationError> {
    let route = validate_opts(opts)?;
    let (ak, mut machine_state) = establish_trust(attestation, &route, time)?;

    let mut last_err: Option<VerificationError> = None;
    for quote in supported_quotes(&attestation.quotes, &PCR_HASH_ALGS) {
        let alg = quote.hash_alg;
        debug!("trying {alg} quote");

        if let Err(e) = verify_quote(quote, &ak, &opts.nonce) {
            warn!("{alg} quote rejected: {e:#}");
            last_err = Some(VerificationError::new(
                ErrorKind::Quote,
                e.context(format!("failed to verify {alg} quote")),
            ));
            continue;
        }

        let firmware_state =
            match replay_firmware_log(&attestation.event_log, alg, &quote.pcr_values).with_context(
                || format!("failed to replay the firmware event log against the {alg} bank"),
            ) {
                Ok(state) => state,
                Err(e) => {
                    warn!("{e:#}");
                    last_err = Some(VerificationError::new(ErrorKind::LogReplay, e));
                    continue;
                }
            };

        let cel_state = match replay_canonical_log(
            &attestation.canonical_event_log,
            alg,
            &quote.pcr_values,
        )
        .with_context(|| {
            format!("failed to replay the canonical event log against the {alg} bank")
        }) {
            Ok(state) => state,
            Err(e) => {
                warn!("{e:#}");
                last_err = Some(VerificationError::new(ErrorKind::LogReplay, e));
                continue;
            }
        };

        // This gate runs after the replays on purpose: a SHA-1 rejection is
        // only worth reporting when allowing SHA-1 would actually have let
        // the logs verify, which makes failed verifications easier to debug.
        if !opts.allow_sha1 && alg == HashAlg::Sha1 {
            last_err = Some(VerificationError::new(
                ErrorKind::Policy,
                anyhow!("SHA-1 is not allowed for verification (set allow_sha1 to true to allow it)"),
            ));
            continue;
        }

        machine_state.merge(cel_state);
        machine_state.merge(firmware_state);
        machine_state.hash = Some(alg);
        debug!("attestation verified against the {alg} bank");
        return Ok(machine_state);
    }

    Err(last_err.unwrap_or_else(|| {
        VerificationError::new(
            ErrorKind::Quote,
            anyhow!("attestation does not contain a supported quote"),
        )
    }))
}

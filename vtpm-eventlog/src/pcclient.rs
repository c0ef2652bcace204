// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! TCG PC Client firmware event log (binary_bios_measurements format)
//! decoding and replay.

use anyhow::{bail, Context, Result};
use scale::Decode;
use tracing::debug;

use crate::codecs::VecOf;
use crate::tcg::{TcgDigest, TcgEfiSpecIdEvent, EV_NO_ACTION, EV_S_CRTM_VERSION};
use vtpm_types::{HashAlg, MachineState, MeasuredEvent, PcrValue, PlatformState};

/// A decoded TCG_PCR_EVENT2 record.
#[derive(Clone)]
pub struct FirmwareEvent {
    pub pcr_index: u32,
    pub event_type: u32,
    pub digests: Vec<TcgDigest>,
    pub data: Vec<u8>,
}

impl core::fmt::Debug for FirmwareEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FirmwareEvent")
            .field("pcr_index", &self.pcr_index)
            .field("event_type", &self.event_type)
            .field(
                "digests",
                &self
                    .digests
                    .iter()
                    .map(|d| hex::encode(&d.hash))
                    .collect::<Vec<_>>(),
            )
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

impl FirmwareEvent {
    fn digest_for(&self, bank: HashAlg) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|d| d.algo_id == bank.tpm_alg_id())
            .map(|d| d.hash.as_slice())
    }

    /// EV_NO_ACTION events are informative only and never extended.
    fn is_extended_to_pcr(&self) -> bool {
        self.event_type != EV_NO_ACTION
    }
}

/// TCG_PCR_EVENT2 wire format (crypto agile, little-endian)
///
/// See TCG PC Client Platform Firmware Profile spec section 9.2.2
#[derive(Decode)]
struct RawEvent {
    pcr_index: u32,
    event_type: u32,
    digests: VecOf<u32, TcgDigest>,
    event: VecOf<u32, u8>,
}

#[derive(Clone, Debug)]
pub struct FirmwareLog {
    pub spec_id_event: TcgEfiSpecIdEvent,
    pub events: Vec<FirmwareEvent>,
}

impl FirmwareLog {
    /// Decode from binary_bios_measurements format
    ///
    /// The first event is a TCG_PCClientPCREvent (legacy format with a SHA-1
    /// digest) carrying the spec-ID header. Subsequent events are
    /// TCG_PCR_EVENT2 (crypto-agile format).
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let spec_id_event = parse_spec_id_event(input).context("failed to parse spec id event")?;

        let mut events = vec![];
        loop {
            // Peek the PCR index to detect the terminator without consuming it.
            let head_buffer = &mut &input[..];
            let pcr_index = match u32::decode(head_buffer) {
                Ok(idx) => idx,
                Err(_) => break,
            };
            if pcr_index == 0xFFFFFFFF {
                break;
            }

            let raw = RawEvent::decode(input).context("failed to decode firmware event")?;
            events.push(FirmwareEvent {
                pcr_index: raw.pcr_index,
                event_type: raw.event_type,
                digests: raw.digests.into_inner(),
                data: raw.event.into_inner(),
            });
        }

        Ok(FirmwareLog {
            spec_id_event,
            events,
        })
    }
}

/// Parse the spec ID header in legacy TCG_PCClientPCREvent format.
fn parse_spec_id_event<I: scale::Input>(input: &mut I) -> Result<TcgEfiSpecIdEvent> {
    #[derive(Decode)]
    struct SpecIdHeader {
        _pcr_index: u32,
        _event_type: u32,
        _digest_sha1: [u8; 20],
        event: VecOf<u32, u8>,
    }

    let header = SpecIdHeader::decode(input).context("failed to decode spec id header")?;
    TcgEfiSpecIdEvent::decode(&mut header.event.as_slice())
        .context("failed to decode TcgEfiSpecIdEvent")
}

/// Replay the firmware event log against the claimed PCR values.
///
/// For every claimed PCR that has events in the log, the event digests of the
/// given bank are folded into a fresh register and the result must equal the
/// claimed value. An empty log is not an error; it yields an empty fragment.
pub fn replay_firmware_log(
    raw: &[u8],
    bank: HashAlg,
    pcr_values: &[PcrValue],
) -> Result<MachineState> {
    if raw.is_empty() {
        return Ok(MachineState::default());
    }
    let log = FirmwareLog::decode(&mut &raw[..])?;

    let mut state = MachineState::default();
    let mut firmware_version = Vec::new();
    for pcr in pcr_values {
        let events: Vec<&FirmwareEvent> = log
            .events
            .iter()
            .filter(|e| e.is_extended_to_pcr() && e.pcr_index == pcr.index)
            .collect();
        if events.is_empty() {
            continue;
        }

        let mut replayed = bank.zero_digest();
        let mut verified = Vec::with_capacity(events.len());
        for event in events {
            let Some(digest) = event.digest_for(bank) else {
                bail!(
                    "PCR {} event of type 0x{:x} has no {bank} digest",
                    pcr.index,
                    event.event_type
                );
            };
            replayed = bank.extend(&replayed, digest);
            if event.event_type == EV_S_CRTM_VERSION && firmware_version.is_empty() {
                firmware_version = event.data.clone();
            }
            verified.push(MeasuredEvent {
                pcr_index: event.pcr_index,
                event_type: event.event_type,
                digest: digest.to_vec(),
                data: event.data.clone(),
                digest_verified: digest == bank.digest(&event.data),
            });
        }

        if replayed != pcr.value {
            bail!(
                "PCR {} replay mismatch: expected {}, got {}",
                pcr.index,
                hex::encode(&pcr.value),
                hex::encode(&replayed)
            );
        }
        debug!(
            "PCR {} firmware log replay ok ({} events)",
            pcr.index,
            verified.len()
        );
        state.boot_events.extend(verified);
    }

    if !firmware_version.is_empty() {
        state.platform = Some(PlatformState {
            firmware_version,
            ..Default::default()
        });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcg::EV_SEPARATOR;

    fn put_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn spec_id_header() -> Vec<u8> {
        let mut spec = Vec::new();
        spec.extend_from_slice(b"Spec ID Event03\0");
        put_u32(&mut spec, 0); // platform class
        spec.extend_from_slice(&[0, 2, 0, 2]); // minor, major, errata, uintn size
        put_u32(&mut spec, 1); // number of algorithms
        spec.extend_from_slice(&HashAlg::Sha256.tpm_alg_id().to_le_bytes());
        spec.extend_from_slice(&32u16.to_le_bytes());
        spec.push(0); // vendor info size

        let mut header = Vec::new();
        put_u32(&mut header, 0); // pcr index
        put_u32(&mut header, EV_NO_ACTION);
        header.extend_from_slice(&[0; 20]); // sha1 digest
        put_u32(&mut header, spec.len() as u32);
        header.extend_from_slice(&spec);
        header
    }

    fn encode_event(bank: HashAlg, pcr: u32, event_type: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, pcr);
        put_u32(&mut buf, event_type);
        put_u32(&mut buf, 1); // digest count
        buf.extend_from_slice(&bank.tpm_alg_id().to_le_bytes());
        buf.extend_from_slice(&bank.digest(data));
        put_u32(&mut buf, data.len() as u32);
        buf.extend_from_slice(data);
        buf
    }

    /// Builds a log plus the PCR values that replaying it produces.
    fn build_log(bank: HashAlg, events: &[(u32, u32, &[u8])]) -> (Vec<u8>, Vec<PcrValue>) {
        let mut log = spec_id_header();
        let mut pcrs: Vec<PcrValue> = Vec::new();
        for (pcr, event_type, data) in events {
            log.extend_from_slice(&encode_event(bank, *pcr, *event_type, data));
            let slot = match pcrs.iter().position(|p| p.index == *pcr) {
                Some(i) => i,
                None => {
                    pcrs.push(PcrValue {
                        index: *pcr,
                        value: bank.zero_digest(),
                    });
                    pcrs.len() - 1
                }
            };
            pcrs[slot].value = bank.extend(&pcrs[slot].value, &bank.digest(data));
        }
        pcrs.sort_by_key(|p| p.index);
        (log, pcrs)
    }

    #[test]
    fn empty_input_yields_empty_fragment() {
        let state = replay_firmware_log(&[], HashAlg::Sha256, &[]).unwrap();
        assert_eq!(state, MachineState::default());
    }

    #[test]
    fn truncated_log_fails_to_decode() {
        assert!(FirmwareLog::decode(&mut &[1u8, 2, 3][..]).is_err());
    }

    #[test]
    fn replay_succeeds_and_collects_events() {
        let (log, pcrs) = build_log(
            HashAlg::Sha256,
            &[
                (0, EV_S_CRTM_VERSION, b"fw-1.2"),
                (0, EV_SEPARATOR, &[0; 4]),
                (4, EV_SEPARATOR, &[0; 4]),
            ],
        );
        let state = replay_firmware_log(&log, HashAlg::Sha256, &pcrs).unwrap();
        assert_eq!(state.boot_events.len(), 3);
        assert!(state.boot_events.iter().all(|e| e.digest_verified));
        assert_eq!(
            state.platform.expect("platform").firmware_version,
            b"fw-1.2"
        );
    }

    #[test]
    fn tampered_pcr_value_is_detected() {
        let (log, mut pcrs) = build_log(HashAlg::Sha256, &[(0, EV_SEPARATOR, &[0; 4])]);
        pcrs[0].value[0] ^= 1;
        let err = replay_firmware_log(&log, HashAlg::Sha256, &pcrs).unwrap_err();
        assert!(err.to_string().contains("PCR 0 replay mismatch"), "{err}");
    }

    #[test]
    fn missing_bank_digest_is_an_error() {
        let (log, pcrs) = build_log(HashAlg::Sha256, &[(0, EV_SEPARATOR, &[0; 4])]);
        let err = replay_firmware_log(&log, HashAlg::Sha384, &pcrs).unwrap_err();
        assert!(err.to_string().contains("no sha384 digest"), "{err}");
    }

    #[test]
    fn pcrs_without_events_are_skipped() {
        let (log, mut pcrs) = build_log(HashAlg::Sha256, &[(0, EV_SEPARATOR, &[0; 4])]);
        pcrs.push(PcrValue {
            index: 7,
            value: vec![0xee; 32],
        });
        let state = replay_firmware_log(&log, HashAlg::Sha256, &pcrs).unwrap();
        assert_eq!(state.boot_events.len(), 1);
    }

    #[test]
    fn no_action_events_are_not_extended() {
        let (mut log, pcrs) = build_log(HashAlg::Sha256, &[(0, EV_SEPARATOR, &[0; 4])]);
        log.extend_from_slice(&encode_event(HashAlg::Sha256, 0, EV_NO_ACTION, b"info"));
        let state = replay_firmware_log(&log, HashAlg::Sha256, &pcrs).unwrap();
        assert_eq!(state.boot_events.len(), 1);
    }

    #[test]
    fn terminator_stops_decoding() {
        let (mut log, pcrs) = build_log(HashAlg::Sha256, &[(0, EV_SEPARATOR, &[0; 4])]);
        put_u32(&mut log, 0xFFFFFFFF);
        log.extend_from_slice(b"garbage after terminator");
        let state = replay_firmware_log(&log, HashAlg::Sha256, &pcrs).unwrap();
        assert_eq!(state.boot_events.len(), 1);
    }
}

// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! TCG Canonical Event Log (CEL-TLV encoding) decoding and replay.
//!
//! CEL records are big-endian TLV structures: a one-byte type, a four-byte
//! length and the value. Each record carries a record number TLV, a PCR TLV,
//! a digests TLV (nested digest TLVs typed by algorithm ID) and a content
//! TLV.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, ensure, Context, Result};
use nom::bytes::complete::take;
use nom::number::complete::{be_u32, be_u8};
use nom::IResult;
use tracing::debug;

use crate::tcg::TcgDigest;
use vtpm_types::{HashAlg, MachineState, PcrValue, RuntimeEvent};

pub const CEL_SEQNUM: u8 = 0x00;
pub const CEL_PCR: u8 = 0x01;
pub const CEL_NV_INDEX: u8 = 0x02;
pub const CEL_DIGESTS: u8 = 0x03;

/// A decoded CEL-TLV record.
#[derive(Clone)]
pub struct CelRecord {
    pub record_number: u64,
    pub pcr_index: u32,
    pub digests: Vec<TcgDigest>,
    pub content_type: u8,
    pub content: Vec<u8>,
}

impl core::fmt::Debug for CelRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CelRecord")
            .field("record_number", &self.record_number)
            .field("pcr_index", &self.pcr_index)
            .field(
                "digests",
                &self
                    .digests
                    .iter()
                    .map(|d| hex::encode(&d.hash))
                    .collect::<Vec<_>>(),
            )
            .field("content_type", &self.content_type)
            .field("content", &hex::encode(&self.content))
            .finish()
    }
}

impl CelRecord {
    fn digest_for(&self, bank: HashAlg) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|d| d.algo_id == bank.tpm_alg_id())
            .map(|d| d.hash.as_slice())
    }
}

fn parse_tlv(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (input, tag) = be_u8(input)?;
    let (input, len) = be_u32(input)?;
    let (input, value) = take(len)(input)?;
    Ok((input, (tag, value)))
}

fn tlv(input: &[u8]) -> Result<(&[u8], (u8, &[u8]))> {
    parse_tlv(input).map_err(|e| anyhow!("truncated TLV: {e}"))
}

/// Big-endian unsigned integer of at most `max` bytes.
fn be_uint(bytes: &[u8], max: usize) -> Result<u64> {
    ensure!(
        !bytes.is_empty() && bytes.len() <= max,
        "integer field must be 1..={max} bytes, got {}",
        bytes.len()
    );
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn parse_digests(mut raw: &[u8]) -> Result<Vec<TcgDigest>> {
    let mut digests = Vec::new();
    while !raw.is_empty() {
        let (rest, (alg, value)) = tlv(raw)?;
        let Some(bank) = HashAlg::from_tpm_alg_id(u16::from(alg)) else {
            bail!("unsupported digest algorithm 0x{alg:02x}");
        };
        ensure!(
            value.len() == bank.digest_size(),
            "digest size mismatch for {bank}: got {} bytes",
            value.len()
        );
        digests.push(TcgDigest {
            algo_id: u16::from(alg),
            hash: value.to_vec(),
        });
        raw = rest;
    }
    ensure!(!digests.is_empty(), "record carries no digests");
    Ok(digests)
}

fn parse_record(input: &[u8]) -> Result<(&[u8], CelRecord)> {
    let (rest, (tag, value)) = tlv(input)?;
    ensure!(tag == CEL_SEQNUM, "expected record number TLV, got type {tag}");
    let record_number = be_uint(value, 8).context("record number")?;

    let (rest, (tag, value)) = tlv(rest)?;
    if tag == CEL_NV_INDEX {
        bail!("NV index records are not supported");
    }
    ensure!(tag == CEL_PCR, "expected PCR TLV, got type {tag}");
    let pcr_index = be_uint(value, 4).context("PCR index")? as u32;

    let (rest, (tag, value)) = tlv(rest)?;
    ensure!(tag == CEL_DIGESTS, "expected digests TLV, got type {tag}");
    let digests = parse_digests(value)
        .with_context(|| format!("bad digests in record {record_number}"))?;

    let (rest, (content_type, content)) = tlv(rest)?;
    ensure!(
        content_type > CEL_DIGESTS,
        "invalid content TLV type {content_type}"
    );

    Ok((
        rest,
        CelRecord {
            record_number,
            pcr_index,
            digests,
            content_type,
            content: content.to_vec(),
        },
    ))
}

/// Decode a full CEL-TLV log.
pub fn decode_cel(mut input: &[u8]) -> Result<Vec<CelRecord>> {
    let mut records = Vec::new();
    while !input.is_empty() {
        let (rest, record) = parse_record(input)
            .with_context(|| format!("malformed CEL record at index {}", records.len()))?;
        records.push(record);
        input = rest;
    }
    Ok(records)
}

/// Replay the canonical event log against the claimed PCR values.
///
/// Every record must carry a digest for the requested bank. The replayed
/// value of each PCR the log covers must equal the claimed value; a covered
/// PCR missing from the claim is an error. An empty log yields an empty
/// fragment.
pub fn replay_canonical_log(
    raw: &[u8],
    bank: HashAlg,
    pcr_values: &[PcrValue],
) -> Result<MachineState> {
    if raw.is_empty() {
        return Ok(MachineState::default());
    }
    let records = decode_cel(raw)?;

    let mut state = MachineState::default();
    let mut replayed: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    for record in records {
        let Some(digest) = record.digest_for(bank) else {
            bail!(
                "CEL record {} has no {bank} digest",
                record.record_number
            );
        };
        let register = replayed
            .entry(record.pcr_index)
            .or_insert_with(|| bank.zero_digest());
        *register = bank.extend(register, digest);
        state.runtime_events.push(RuntimeEvent {
            record_number: record.record_number,
            pcr_index: record.pcr_index,
            digest: digest.to_vec(),
            content_type: record.content_type,
            content: record.content,
        });
    }

    for (pcr_index, value) in &replayed {
        let claimed = pcr_values
            .iter()
            .find(|p| p.index == *pcr_index)
            .with_context(|| {
                format!("CEL covers PCR {pcr_index}, which is not present in the quote")
            })?;
        if &claimed.value != value {
            bail!(
                "PCR {} replay mismatch: expected {}, got {}",
                pcr_index,
                hex::encode(&claimed.value),
                hex::encode(value)
            );
        }
        debug!("PCR {pcr_index} canonical log replay ok");
    }
    Ok(state)
}

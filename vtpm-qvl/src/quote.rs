// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! Quote parsing and verification: TPMS_ATTEST and TPMT_SIGNATURE decoding,
//! signature and freshness checks, and candidate ordering by hash preference.

use anyhow::{anyhow, bail, ensure, Context, Result};
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use tracing::debug;

use crate::akpub::AkPublicKey;
use vtpm_types::{HashAlg, Quote};

const TPM_GENERATED_VALUE: u32 = 0xFF544347;
const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;
const TPM_ALG_RSASSA: u16 = 0x0014;
const TPM_ALG_ECDSA: u16 = 0x0018;

/// PCR bank preference, most trusted first. SHA-1 is supported only at the
/// lowest priority and additionally gated by `VerifyOpts::allow_sha1`.
pub const PCR_HASH_ALGS: [HashAlg; 4] = [
    HashAlg::Sha256,
    HashAlg::Sha384,
    HashAlg::Sha512,
    HashAlg::Sha1,
];

/// Order the candidate quotes by hash preference.
///
/// At most one quote per algorithm is selected (first seen wins); quotes for
/// algorithms outside the preference list are dropped.
pub fn supported_quotes<'a>(quotes: &'a [Quote], preference: &[HashAlg]) -> Vec<&'a Quote> {
    let mut ordered = Vec::with_capacity(quotes.len());
    for alg in preference {
        if let Some(quote) = quotes.iter().find(|q| q.hash_alg == *alg) {
            ordered.push(quote);
        }
    }
    ordered
}

#[derive(Debug, Clone)]
pub struct TpmAttest {
    pub magic: u32,
    pub type_: u16,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub quote_info: QuoteInfo,
}

#[derive(Debug, Clone)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: u8,
}

/// PCR selection entry from a quote
#[derive(Debug, Clone)]
pub struct PcrSelection {
    /// Hash algorithm (e.g., 0x000B for SHA-256)
    pub hash_alg: u16,
    /// Selected PCR indices
    pub pcr_indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct QuoteInfo {
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

pub fn parse_tpm_attest(data: &[u8]) -> Result<TpmAttest> {
    use nom::bytes::complete::take;
    use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
    use nom::IResult;

    fn parse_sized_buffer(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (input, size) = be_u16(input)?;
        let (input, data) = take(size)(input)?;
        Ok((input, data.to_vec()))
    }

    fn parse_attest(input: &[u8]) -> IResult<&[u8], TpmAttest> {
        let (input, magic) = be_u32(input)?;
        let (input, type_) = be_u16(input)?;
        let (input, qualified_signer) = parse_sized_buffer(input)?;
        let (input, extra_data) = parse_sized_buffer(input)?;

        let (input, clock) = be_u64(input)?;
        let (input, reset_count) = be_u32(input)?;
        let (input, restart_count) = be_u32(input)?;
        let (input, safe) = be_u8(input)?;

        let (input, firmware_version) = be_u64(input)?;

        let (input, pcr_select_count) = be_u32(input)?;

        let mut pcr_selections = Vec::new();
        let mut current_input = input;
        for _ in 0..pcr_select_count {
            let (input, hash_alg) = be_u16(current_input)?;
            let (input, sizeof_select) = be_u8(input)?;
            let (input, pcr_bitmap) = take(sizeof_select)(input)?;

            // The selection bitmap is little-endian per byte: bit n of byte m
            // selects PCR m*8+n.
            let mut pcr_indices = Vec::new();
            for (byte_idx, &byte) in pcr_bitmap.iter().enumerate() {
                for bit_idx in 0..8 {
                    if (byte & (1 << bit_idx)) != 0 {
                        pcr_indices.push((byte_idx * 8 + bit_idx) as u32);
                    }
                }
            }

            pcr_selections.push(PcrSelection {
                hash_alg,
                pcr_indices,
            });
            current_input = input;
        }

        let (input, pcr_digest) = parse_sized_buffer(current_input)?;

        Ok((
            input,
            TpmAttest {
                magic,
                type_,
                qualified_signer,
                extra_data,
                clock_info: ClockInfo {
                    clock,
                    reset_count,
                    restart_count,
                    safe,
                },
                firmware_version,
                quote_info: QuoteInfo {
                    pcr_selections,
                    pcr_digest,
                },
            },
        ))
    }

    let (_, attest) = parse_attest(data).map_err(|e| anyhow!("parse error: {e}"))?;

    if attest.magic != TPM_GENERATED_VALUE {
        bail!("invalid magic number: 0x{magic:08x}", magic = attest.magic);
    }
    if attest.type_ != TPM_ST_ATTEST_QUOTE {
        bail!("invalid attest type: 0x{type_:04x}", type_ = attest.type_);
    }
    Ok(attest)
}

#[derive(Debug)]
enum TpmtSignature {
    Rsassa { hash: HashAlg, signature: Vec<u8> },
    Ecdsa { hash: HashAlg, r: Vec<u8>, s: Vec<u8> },
}

impl TpmtSignature {
    fn hash(&self) -> HashAlg {
        match self {
            TpmtSignature::Rsassa { hash, .. } => *hash,
            TpmtSignature::Ecdsa { hash, .. } => *hash,
        }
    }
}

fn parse_tpmt_signature(data: &[u8]) -> Result<TpmtSignature> {
    use nom::bytes::complete::take;
    use nom::number::complete::be_u16;
    use nom::IResult;

    fn parse_sized_buffer(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (input, size) = be_u16(input)?;
        let (input, data) = take(size)(input)?;
        Ok((input, data.to_vec()))
    }

    let (rest, (sig_alg, hash_alg)) = {
        let parsed: nom::IResult<&[u8], (u16, u16)> = (|input| {
            let (input, sig_alg) = be_u16(input)?;
            let (input, hash_alg) = be_u16(input)?;
            Ok((input, (sig_alg, hash_alg)))
        })(data);
        parsed.map_err(|e| anyhow!("truncated TPMT_SIGNATURE: {e}"))?
    };

    let hash = HashAlg::from_tpm_alg_id(hash_alg)
        .with_context(|| format!("unsupported signature hash algorithm: 0x{hash_alg:04x}"))?;

    match sig_alg {
        TPM_ALG_RSASSA => {
            let (_, signature) =
                parse_sized_buffer(rest).map_err(|e| anyhow!("truncated RSA signature: {e}"))?;
            Ok(TpmtSignature::Rsassa { hash, signature })
        }
        TPM_ALG_ECDSA => {
            let parsed: nom::IResult<&[u8], (Vec<u8>, Vec<u8>)> = (|input| {
                let (input, r) = parse_sized_buffer(input)?;
                let (input, s) = parse_sized_buffer(input)?;
                Ok((input, (r, s)))
            })(rest);
            let (_, (r, s)) = parsed.map_err(|e| anyhow!("truncated ECDSA signature: {e}"))?;
            Ok(TpmtSignature::Ecdsa { hash, r, s })
        }
        other => bail!("unsupported signature algorithm: 0x{other:04x}"),
    }
}

/// Verify that `quote` was signed by `ak` over `nonce`.
///
/// Checks, in order: the TPMT_SIGNATURE verifies over the message with the
/// AK; the message is a well-formed TPMS_ATTEST of type quote; the attested
/// extra data equals the nonce; the PCR selection matches the quote's bank
/// and the provided PCR indices; the attested PCR digest matches the hash of
/// the provided PCR values.
pub fn verify_quote(quote: &Quote, ak: &AkPublicKey, nonce: &[u8]) -> Result<()> {
    let signature =
        parse_tpmt_signature(&quote.signature).context("failed to parse TPMT_SIGNATURE")?;
    let sig_hash = signature.hash();
    let message_digest = sig_hash.digest(&quote.message);

    match (ak, &signature) {
        (AkPublicKey::Rsa(key), TpmtSignature::Rsassa { signature, .. }) => {
            verify_rsassa(key, sig_hash, &message_digest, signature)?;
        }
        (AkPublicKey::Ecdsa(key), TpmtSignature::Ecdsa { r, s, .. }) => {
            verify_ecdsa(key, &message_digest, r, s)?;
        }
        _ => bail!("signature algorithm does not match the AK key type"),
    }
    debug!("quote signature verified");

    let attest = parse_tpm_attest(&quote.message).context("failed to parse TPMS_ATTEST")?;

    if attest.extra_data != nonce {
        bail!(
            "quote nonce mismatch: expected {}, got {}",
            hex::encode(nonce),
            hex::encode(&attest.extra_data)
        );
    }

    let [selection] = attest.quote_info.pcr_selections.as_slice() else {
        bail!(
            "expected exactly one PCR selection, got {}",
            attest.quote_info.pcr_selections.len()
        );
    };
    ensure!(
        selection.hash_alg == quote.hash_alg.tpm_alg_id(),
        "quote PCR bank is 0x{:04x}, expected {}",
        selection.hash_alg,
        quote.hash_alg
    );
    let provided: Vec<u32> = quote.pcr_values.iter().map(|p| p.index).collect();
    ensure!(
        selection.pcr_indices == provided,
        "PCR selection mismatch: quote has {:?}, provided {:?}",
        selection.pcr_indices,
        provided
    );

    let mut concatenated = Vec::new();
    for pcr in &quote.pcr_values {
        concatenated.extend_from_slice(&pcr.value);
    }
    let computed = sig_hash.digest(&concatenated);
    if attest.quote_info.pcr_digest != computed {
        bail!(
            "PCR digest mismatch: attested {}, computed {}",
            hex::encode(&attest.quote_info.pcr_digest),
            hex::encode(&computed)
        );
    }
    Ok(())
}

fn verify_rsassa(
    key: &RsaPublicKey,
    hash: HashAlg,
    message_digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    let padding = match hash {
        HashAlg::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashAlg::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        HashAlg::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        HashAlg::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
    };
    key.verify(padding, message_digest, signature)
        .map_err(|e| anyhow!("RSA signature verification failed: {e}"))
}

fn verify_ecdsa(key: &VerifyingKey, message_digest: &[u8], r: &[u8], s: &[u8]) -> Result<()> {
    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&left_pad_32(r).context("ECDSA signature r")?);
    sig_bytes[32..].copy_from_slice(&left_pad_32(s).context("ECDSA signature s")?);
    let signature =
        Signature::from_slice(&sig_bytes).context("failed to parse ECDSA signature")?;
    key.verify_prehash(message_digest, &signature)
        .map_err(|e| anyhow!("ECDSA signature verification failed: {e}"))
}

fn left_pad_32(bytes: &[u8]) -> Result<[u8; 32]> {
    let mut b = bytes;
    while b.first() == Some(&0) {
        b = &b[1..];
    }
    ensure!(b.len() <= 32, "signature component longer than 32 bytes");
    let mut out = [0u8; 32];
    out[32 - b.len()..].copy_from_slice(b);
    Ok(out)
}

// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! Attestation Key public material: TPMT_PUBLIC decoding, SubjectPublicKeyInfo
//! extraction from certificates, and structural key equality.

use anyhow::{anyhow, bail, ensure, Context, Result};
use p256::ecdsa::VerifyingKey;
use rsa::{BigUint, RsaPublicKey};
use tracing::debug;
use x509_parser::prelude::*;

pub(crate) const TPM_ALG_RSA: u16 = 0x0001;
pub(crate) const TPM_ALG_NULL: u16 = 0x0010;
pub(crate) const TPM_ALG_ECC: u16 = 0x0023;
pub(crate) const TPM_ECC_NIST_P256: u16 = 0x0003;

/// An Attestation Key public key.
///
/// Equality is structural over the parsed key material (RSA modulus and
/// exponent, or the ECDSA point), never a comparison of raw encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum AkPublicKey {
    Rsa(RsaPublicKey),
    Ecdsa(VerifyingKey),
}

struct RawRsa {
    exponent: u32,
    modulus: Vec<u8>,
}

struct RawEcc {
    curve_id: u16,
    x: Vec<u8>,
    y: Vec<u8>,
}

/// Decode a TPMT_PUBLIC public area into an [`AkPublicKey`].
pub fn decode_ak_public(data: &[u8]) -> Result<AkPublicKey> {
    use nom::number::complete::be_u16;

    let (rest, key_type) = be_u16::<_, nom::error::Error<&[u8]>>(data)
        .map_err(|e| anyhow!("truncated TPMT_PUBLIC: {e}"))?;
    match key_type {
        TPM_ALG_RSA => {
            let (_, raw) =
                parse_rsa_public(rest).map_err(|e| anyhow!("malformed RSA public area: {e}"))?;
            let exponent = if raw.exponent == 0 { 65537 } else { raw.exponent };
            let key = RsaPublicKey::new(
                BigUint::from_bytes_be(&raw.modulus),
                BigUint::from(exponent),
            )
            .context("invalid RSA public key")?;
            debug!("decoded RSA AK public area ({} bit)", raw.modulus.len() * 8);
            Ok(AkPublicKey::Rsa(key))
        }
        TPM_ALG_ECC => {
            let (_, raw) =
                parse_ecc_public(rest).map_err(|e| anyhow!("malformed ECC public area: {e}"))?;
            ensure!(
                raw.curve_id == TPM_ECC_NIST_P256,
                "unsupported ECC curve: 0x{:04x}",
                raw.curve_id
            );
            let mut point = Vec::with_capacity(65);
            point.push(0x04);
            point.extend_from_slice(&left_pad_32(&raw.x).context("ECC point x")?);
            point.extend_from_slice(&left_pad_32(&raw.y).context("ECC point y")?);
            let key = VerifyingKey::from_sec1_bytes(&point).context("invalid ECC public key")?;
            debug!("decoded ECC P-256 AK public area");
            Ok(AkPublicKey::Ecdsa(key))
        }
        other => bail!("unsupported AK key type: 0x{other:04x}"),
    }
}

/// Extract the AK public key from a certificate's SubjectPublicKeyInfo.
pub fn ak_from_cert(cert: &X509Certificate) -> Result<AkPublicKey> {
    const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
    const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];

    let spki = cert.public_key();
    let algo_oid: Vec<u64> = spki
        .algorithm
        .algorithm
        .iter()
        .ok_or_else(|| anyhow!("invalid public key algorithm OID"))?
        .collect();

    if algo_oid == OID_RSA_ENCRYPTION {
        use rsa::pkcs1::DecodeRsaPublicKey;

        let key = RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
            .context("failed to decode RSA public key from certificate")?;
        Ok(AkPublicKey::Rsa(key))
    } else if algo_oid == OID_EC_PUBLIC_KEY {
        let key = VerifyingKey::from_sec1_bytes(spki.subject_public_key.data.as_ref())
            .context("failed to decode ECC public key from certificate")?;
        Ok(AkPublicKey::Ecdsa(key))
    } else {
        bail!("unsupported public key algorithm: {algo_oid:?}");
    }
}

fn parse_sized(input: &[u8]) -> nom::IResult<&[u8], &[u8]> {
    use nom::bytes::complete::take;
    use nom::number::complete::be_u16;

    let (input, size) = be_u16(input)?;
    take(size)(input)
}

/// TPMT_SYM_DEF_OBJECT: algorithm, plus key bits and mode unless null.
fn parse_symmetric(input: &[u8]) -> nom::IResult<&[u8], ()> {
    use nom::bytes::complete::take;
    use nom::number::complete::be_u16;

    let (input, alg) = be_u16(input)?;
    if alg == TPM_ALG_NULL {
        return Ok((input, ()));
    }
    let (input, _key_bits_and_mode) = take(4usize)(input)?;
    Ok((input, ()))
}

/// A signing scheme: algorithm, plus hash unless null.
fn parse_scheme(input: &[u8]) -> nom::IResult<&[u8], ()> {
    use nom::number::complete::be_u16;

    let (input, alg) = be_u16(input)?;
    if alg == TPM_ALG_NULL {
        return Ok((input, ()));
    }
    let (input, _hash) = be_u16(input)?;
    Ok((input, ()))
}

/// Common TPMT_PUBLIC prefix after the key type: nameAlg, objectAttributes,
/// authPolicy.
fn parse_public_prefix(input: &[u8]) -> nom::IResult<&[u8], ()> {
    use nom::number::complete::{be_u16, be_u32};

    let (input, _name_alg) = be_u16(input)?;
    let (input, _object_attributes) = be_u32(input)?;
    let (input, _auth_policy) = parse_sized(input)?;
    Ok((input, ()))
}

fn parse_rsa_public(input: &[u8]) -> nom::IResult<&[u8], RawRsa> {
    use nom::number::complete::{be_u16, be_u32};

    let (input, ()) = parse_public_prefix(input)?;
    let (input, ()) = parse_symmetric(input)?;
    let (input, ()) = parse_scheme(input)?;
    let (input, _key_bits) = be_u16(input)?;
    let (input, exponent) = be_u32(input)?;
    let (input, modulus) = parse_sized(input)?;
    Ok((
        input,
        RawRsa {
            exponent,
            modulus: modulus.to_vec(),
        },
    ))
}

fn parse_ecc_public(input: &[u8]) -> nom::IResult<&[u8], RawEcc> {
    use nom::number::complete::be_u16;

    let (input, ()) = parse_public_prefix(input)?;
    let (input, ()) = parse_symmetric(input)?;
    let (input, ()) = parse_scheme(input)?;
    let (input, curve_id) = be_u16(input)?;
    let (input, ()) = parse_scheme(input)?; // KDF scheme
    let (input, x) = parse_sized(input)?;
    let (input, y) = parse_sized(input)?;
    Ok((
        input,
        RawEcc {
            curve_id,
            x: x.to_vec(),
            y: y.to_vec(),
        },
    ))
}

/// Left-pad a big-endian field element to 32 bytes.
fn left_pad_32(bytes: &[u8]) -> Result<[u8; 32]> {
    let stripped: &[u8] = {
        let mut b = bytes;
        while b.first() == Some(&0) {
            b = &b[1..];
        }
        b
    };
    ensure!(stripped.len() <= 32, "field element longer than 32 bytes");
    let mut out = [0u8; 32];
    out[32 - stripped.len()..].copy_from_slice(stripped);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;

    fn put_u16(buf: &mut Vec<u8>, value: u16) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_sized(buf: &mut Vec<u8>, value: &[u8]) {
        put_u16(buf, value.len() as u16);
        buf.extend_from_slice(value);
    }

    fn encode_rsa_public(modulus: &[u8], exponent: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u16(&mut buf, TPM_ALG_RSA);
        put_u16(&mut buf, 0x000B); // nameAlg
        buf.extend_from_slice(&0x00050072u32.to_be_bytes()); // objectAttributes
        put_sized(&mut buf, &[]); // authPolicy
        put_u16(&mut buf, TPM_ALG_NULL); // symmetric
        put_u16(&mut buf, 0x0014); // scheme: RSASSA
        put_u16(&mut buf, 0x000B); // scheme hash
        put_u16(&mut buf, (modulus.len() * 8) as u16);
        buf.extend_from_slice(&exponent.to_be_bytes());
        put_sized(&mut buf, modulus);
        buf
    }

    fn encode_ecc_public(key: &VerifyingKey) -> Vec<u8> {
        let point = key.to_encoded_point(false);
        let mut buf = Vec::new();
        put_u16(&mut buf, TPM_ALG_ECC);
        put_u16(&mut buf, 0x000B);
        buf.extend_from_slice(&0x00050072u32.to_be_bytes());
        put_sized(&mut buf, &[]);
        put_u16(&mut buf, TPM_ALG_NULL); // symmetric
        put_u16(&mut buf, 0x0018); // scheme: ECDSA
        put_u16(&mut buf, 0x000B); // scheme hash
        put_u16(&mut buf, TPM_ECC_NIST_P256);
        put_u16(&mut buf, TPM_ALG_NULL); // KDF
        put_sized(&mut buf, point.x().expect("x"));
        put_sized(&mut buf, point.y().expect("y"));
        buf
    }

    #[test]
    fn decodes_ecc_public_area() {
        let signing = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let verifying = *signing.verifying_key();
        let encoded = encode_ecc_public(&verifying);
        let decoded = decode_ak_public(&encoded).unwrap();
        assert_eq!(decoded, AkPublicKey::Ecdsa(verifying));
    }

    #[test]
    fn decodes_rsa_public_area() {
        let modulus = {
            let mut m = vec![0xABu8; 256];
            m[255] |= 1;
            m
        };
        let encoded = encode_rsa_public(&modulus, 0);
        let decoded = decode_ak_public(&encoded).unwrap();
        let AkPublicKey::Rsa(key) = decoded else {
            panic!("expected RSA key");
        };
        use rsa::traits::PublicKeyParts;
        assert_eq!(key.e(), &BigUint::from(65537u32));
        assert_eq!(key.n(), &BigUint::from_bytes_be(&modulus));
    }

    #[test]
    fn rejects_unknown_key_type() {
        let err = decode_ak_public(&[0x00, 0x08, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("unsupported AK key type"));
    }

    #[test]
    fn rejects_truncation() {
        let signing = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let encoded = encode_ecc_public(signing.verifying_key());
        assert!(decode_ak_public(&encoded[..encoded.len() - 10]).is_err());
        assert!(decode_ak_public(&[]).is_err());
    }

    #[test]
    fn structural_equality_ignores_encoding() {
        let signing = SigningKey::from_slice(&[5u8; 32]).unwrap();
        let verifying = *signing.verifying_key();
        let a = decode_ak_public(&encode_ecc_public(&verifying)).unwrap();
        let b = AkPublicKey::Ecdsa(verifying);
        assert_eq!(a, b);

        let other = SigningKey::from_slice(&[6u8; 32]).unwrap();
        assert_ne!(a, AkPublicKey::Ecdsa(*other.verifying_key()));
    }
}

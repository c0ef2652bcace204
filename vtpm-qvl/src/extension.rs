// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: BUSL-1.1

//! GCE instance identity certificate extension codec.
//!
//! The extension (OID 1.3.6.1.4.1.11129.2.1.21) carries a DER SEQUENCE of
//! zone, project number, project ID, instance ID and instance name, plus an
//! optional explicitly tagged security-properties SEQUENCE holding an
//! optional security version ([0]) and production flag ([1]).

use anyhow::{anyhow, bail, ensure, Context, Result};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::IResult;
use tracing::debug;
use x509_parser::prelude::*;

use vtpm_types::GceInstanceInfo;

/// OID of the GCE instance identity extension.
pub const CLOUD_COMPUTE_INSTANCE_IDENTIFIER: &str = "1.3.6.1.4.1.11129.2.1.21";

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_UTF8_STRING: u8 = 0x0C;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_CONTEXT_0: u8 = 0xA0;
const TAG_CONTEXT_1: u8 = 0xA1;

/// The extension payload as encoded, before sign checks and the production
/// gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInstanceInfo {
    pub zone: String,
    pub project_number: i64,
    pub project_id: String,
    pub instance_id: i64,
    pub instance_name: String,
    pub security_properties: Option<RawSecurityProperties>,
}

/// Absent fields default to 0/false when interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSecurityProperties {
    pub security_version: Option<i64>,
    pub is_production: Option<bool>,
}

/// Extract and interpret the instance identity extension of `cert`.
///
/// Returns `Ok(None)` when the certificate carries no such extension, or
/// when the instance is not marked as production.
pub fn decode_instance_info(cert: &X509Certificate) -> Result<Option<GceInstanceInfo>> {
    let Some(ext) = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == CLOUD_COMPUTE_INSTANCE_IDENTIFIER)
    else {
        return Ok(None);
    };
    let raw = decode_raw(ext.value).context("failed to parse instance identity extension")?;
    parse_instance_info(&raw)
}

/// Interpret a decoded extension payload.
///
/// Negative integer fields are rejected before anything else; the fields are
/// unsigned quantities squeezed through a signed encoding. A payload not
/// marked as production yields `Ok(None)`.
pub fn parse_instance_info(raw: &RawInstanceInfo) -> Result<Option<GceInstanceInfo>> {
    let props = raw.security_properties.clone().unwrap_or_default();
    ensure!(
        raw.project_number >= 0 && raw.instance_id >= 0 && props.security_version.unwrap_or(0) >= 0,
        "negative integer fields in instance identity extension"
    );
    if !props.is_production.unwrap_or(false) {
        debug!("instance identity extension is not marked production, ignoring");
        return Ok(None);
    }
    Ok(Some(GceInstanceInfo {
        zone: raw.zone.clone(),
        project_id: raw.project_id.clone(),
        project_number: raw.project_number as u64,
        instance_name: raw.instance_name.clone(),
        instance_id: raw.instance_id as u64,
    }))
}

fn parse_length(input: &[u8]) -> IResult<&[u8], usize> {
    let (input, first) = be_u8(input)?;
    if first < 0x80 {
        return Ok((input, usize::from(first)));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 || count > 4 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (input, bytes) = take(count)(input)?;
    let len = bytes
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Ok((input, len))
}

fn parse_any_tlv(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (input, tag) = be_u8(input)?;
    let (input, len) = parse_length(input)?;
    let (input, value) = take(len)(input)?;
    Ok((input, (tag, value)))
}

fn tlv<'a>(input: &'a [u8], expected: u8, what: &str) -> Result<(&'a [u8], &'a [u8])> {
    let (rest, (tag, value)) =
        parse_any_tlv(input).map_err(|e| anyhow!("truncated {what}: {e}"))?;
    ensure!(
        tag == expected,
        "{what}: expected tag 0x{expected:02x}, got 0x{tag:02x}"
    );
    Ok((rest, value))
}

fn utf8<'a>(input: &'a [u8], what: &str) -> Result<(&'a [u8], String)> {
    let (rest, value) = tlv(input, TAG_UTF8_STRING, what)?;
    let s = core::str::from_utf8(value).with_context(|| format!("{what}: invalid UTF-8"))?;
    Ok((rest, s.to_string()))
}

/// DER INTEGER as i64: minimal two's complement, at most 8 content bytes.
fn int<'a>(input: &'a [u8], what: &str) -> Result<(&'a [u8], i64)> {
    let (rest, value) = tlv(input, TAG_INTEGER, what)?;
    ensure!(
        !value.is_empty() && value.len() <= 8,
        "{what}: INTEGER must be 1..=8 bytes, got {}",
        value.len()
    );
    if value.len() > 1 {
        let redundant = (value[0] == 0x00 && value[1] < 0x80)
            || (value[0] == 0xFF && value[1] >= 0x80);
        ensure!(!redundant, "{what}: INTEGER is not minimally encoded");
    }
    let mut acc: i64 = if value[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in value {
        acc = (acc << 8) | i64::from(b);
    }
    Ok((rest, acc))
}

fn boolean<'a>(input: &'a [u8], what: &str) -> Result<(&'a [u8], bool)> {
    let (rest, value) = tlv(input, TAG_BOOLEAN, what)?;
    match value {
        [0x00] => Ok((rest, false)),
        [0xFF] => Ok((rest, true)),
        other => bail!("{what}: invalid BOOLEAN encoding {}", hex::encode(other)),
    }
}

/// Decode the raw extension payload. Trailing data after the top-level
/// SEQUENCE is ignored; trailing data inside any SEQUENCE is an error.
pub(crate) fn decode_raw(input: &[u8]) -> Result<RawInstanceInfo> {
    let (_, body) = tlv(input, TAG_SEQUENCE, "instance info")?;
    let (body, zone) = utf8(body, "zone")?;
    let (body, project_number) = int(body, "project number")?;
    let (body, project_id) = utf8(body, "project ID")?;
    let (body, instance_id) = int(body, "instance ID")?;
    let (body, instance_name) = utf8(body, "instance name")?;
    let (body, security_properties) = if body.first() == Some(&TAG_CONTEXT_0) {
        let (rest, wrapped) = tlv(body, TAG_CONTEXT_0, "security properties")?;
        (rest, Some(decode_security_properties(wrapped)?))
    } else {
        (body, None)
    };
    ensure!(body.is_empty(), "trailing data inside instance info SEQUENCE");
    Ok(RawInstanceInfo {
        zone,
        project_number,
        project_id,
        instance_id,
        instance_name,
        security_properties,
    })
}

fn decode_security_properties(input: &[u8]) -> Result<RawSecurityProperties> {
    let (rest, mut body) = tlv(input, TAG_SEQUENCE, "security properties")?;
    ensure!(rest.is_empty(), "trailing data around security properties SEQUENCE");

    let mut security_version = None;
    if body.first() == Some(&TAG_CONTEXT_0) {
        let (rest, wrapped) = tlv(body, TAG_CONTEXT_0, "security version")?;
        let (inner, value) = int(wrapped, "security version")?;
        ensure!(inner.is_empty(), "trailing data inside security version");
        security_version = Some(value);
        body = rest;
    }
    let mut is_production = None;
    if body.first() == Some(&TAG_CONTEXT_1) {
        let (rest, wrapped) = tlv(body, TAG_CONTEXT_1, "production flag")?;
        let (inner, value) = boolean(wrapped, "production flag")?;
        ensure!(inner.is_empty(), "trailing data inside production flag");
        is_production = Some(value);
        body = rest;
    }
    ensure!(body.is_empty(), "trailing data inside security properties SEQUENCE");
    Ok(RawSecurityProperties {
        security_version,
        is_production,
    })
}

/// Encode an extension payload. Used when provisioning AK certificates and
/// by tests; the inverse of [`decode_raw`] modulo ignored trailing data.
pub fn encode_instance_info(info: &RawInstanceInfo) -> Vec<u8> {
    let mut body = Vec::new();
    put_utf8(&mut body, &info.zone);
    put_int(&mut body, info.project_number);
    put_utf8(&mut body, &info.project_id);
    put_int(&mut body, info.instance_id);
    put_utf8(&mut body, &info.instance_name);
    if let Some(props) = &info.security_properties {
        let mut inner = Vec::new();
        if let Some(version) = props.security_version {
            let mut wrapped = Vec::new();
            put_int(&mut wrapped, version);
            put_tlv(&mut inner, TAG_CONTEXT_0, &wrapped);
        }
        if let Some(production) = props.is_production {
            let mut wrapped = Vec::new();
            put_tlv(
                &mut wrapped,
                TAG_BOOLEAN,
                &[if production { 0xFF } else { 0x00 }],
            );
            put_tlv(&mut inner, TAG_CONTEXT_1, &wrapped);
        }
        let mut seq = Vec::new();
        put_tlv(&mut seq, TAG_SEQUENCE, &inner);
        put_tlv(&mut body, TAG_CONTEXT_0, &seq);
    }
    let mut out = Vec::new();
    put_tlv(&mut out, TAG_SEQUENCE, &body);
    out
}

fn put_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.push(0x80 | (bytes.len() - skip) as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

fn put_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    put_length(buf, value.len());
    buf.extend_from_slice(value);
}

fn put_utf8(buf: &mut Vec<u8>, value: &str) {
    put_tlv(buf, TAG_UTF8_STRING, value.as_bytes());
}

fn put_int(buf: &mut Vec<u8>, value: i64) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] < 0x80)
            || (bytes[start] == 0xFF && bytes[start + 1] >= 0x80);
        if !redundant {
            break;
        }
        start += 1;
    }
    put_tlv(buf, TAG_INTEGER, &bytes[start..]);
}

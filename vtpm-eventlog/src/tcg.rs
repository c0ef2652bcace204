// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Shared TCG log structures.

use crate::codecs::VecOf;
use scale::Decode;
use vtpm_types::HashAlg;

/// TCG EventType values defined at
/// https://trustedcomputinggroup.org/wp-content/uploads/PC-Client-Platform-Firmware-Profile-Version-1.06-Revision-52_pub.pdf
pub const EV_PREBOOT_CERT: u32 = 0x0;
pub const EV_POST_CODE: u32 = 0x1;
pub const EV_NO_ACTION: u32 = 0x3;
pub const EV_SEPARATOR: u32 = 0x4;
pub const EV_ACTION: u32 = 0x5;
pub const EV_EVENT_TAG: u32 = 0x6;
pub const EV_S_CRTM_CONTENTS: u32 = 0x7;
pub const EV_S_CRTM_VERSION: u32 = 0x8;
pub const EV_IPL: u32 = 0xd;

// digest format: (algo id, hash value)
#[derive(Clone)]
pub struct TcgDigest {
    pub algo_id: u16,
    pub hash: Vec<u8>,
}

impl core::fmt::Debug for TcgDigest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcgDigest")
            .field("algo_id", &self.algo_id)
            .field("hash", &hex::encode(&self.hash))
            .finish()
    }
}

impl scale::Decode for TcgDigest {
    fn decode<I: scale::Input>(input: &mut I) -> Result<Self, scale::Error> {
        let algo_id = u16::decode(input)?;
        let digest_size = HashAlg::from_tpm_alg_id(algo_id)
            .ok_or(scale::Error::from("Unsupported algorithm ID"))?
            .digest_size();
        let mut hash = vec![0; digest_size];
        input
            .read(&mut hash)
            .map_err(|_| scale::Error::from("failed to read digest data"))?;
        Ok(TcgDigest { algo_id, hash })
    }
}

/// TCG TCG_EfiSpecIdEventStruct defined at
/// https://trustedcomputinggroup.org/wp-content/uploads/EFI-Protocol-Specification-rev13-160330final.pdf
#[derive(Clone, Decode, Debug, Default)]
pub struct TcgEfiSpecIdEvent {
    pub signature: [u8; 16],
    pub platform_class: u32,
    pub spec_version_minor: u8,
    pub spec_version_major: u8,
    pub spec_errata: u8,
    pub uintn_size: u8,
    pub digest_sizes: VecOf<u32, TcgEfiSpecIdEventAlgorithmSize>,
    pub vendor_info: VecOf<u8, u8>,
}

/// TCG TCG_EfiSpecIdEventAlgorithmSize: (algorithmId, digestSize)
#[derive(Clone, Decode, Debug)]
pub struct TcgEfiSpecIdEventAlgorithmSize {
    pub algo_id: u16,
    pub digest_size: u16,
}

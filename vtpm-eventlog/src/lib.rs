// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Event log decoding and replay for vTPM attestation.
//!
//! Two log formats are supported:
//! - The TCG PC Client firmware log (`binary_bios_measurements` format),
//!   replayed by [`replay_firmware_log`].
//! - The TCG Canonical Event Log (CEL-TLV encoding), replayed by
//!   [`replay_canonical_log`].
//!
//! Each replay folds the log's digests into the claimed PCR values and, on
//! success, returns a [`vtpm_types::MachineState`] fragment describing the
//! measured events.

pub use cel::{decode_cel, replay_canonical_log, CelRecord};
pub use pcclient::{replay_firmware_log, FirmwareEvent, FirmwareLog};
pub use tcg::TcgDigest;

mod codecs;
pub mod cel;
pub mod pcclient;
pub mod tcg;

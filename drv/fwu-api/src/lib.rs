// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for firmware update (FWU) bank management.
//!
//! This crate holds the pieces shared by everything that takes part in an
//! A/B update: the error taxonomy, the traits through which the platform
//! plugs in its storage and its idea of the active bank, and the status
//! snapshot handed to whoever drives the update.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

pub use fwu_mdata::{
    BankState, ImageEntry, MdataError, Metadata, Uuid, FWU_MDATA_SIZE,
    MAX_BANKS, MAX_IMAGES,
};

/// Errors that can be produced while selecting, staging, or committing a
/// firmware bank.
///
/// Every error is fatal to the current update attempt. None of them changes
/// the persisted active bank: whatever was committed last is what boots.
#[derive(
    Copy,
    Clone,
    Debug,
    FromPrimitive,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u32)]
pub enum FwuError {
    /// The platform could not report which bank is active.
    ActiveIndexFetchFailed = 1,
    /// The record names a bank outside `[0, num_banks)`, or describes a
    /// different number of banks than the platform has.
    InvalidMetadata,
    /// Writing the new record failed; the old bank stays active.
    PersistFailed,
    /// A caller-supplied bank index is outside `[0, num_banks)`.
    InvalidBankIndex,
    /// A single metadata copy failed its checks.
    MetadataCorrupt,
    BothCopiesCorrupt,
    ImageNotFound,
    /// The active bank still holds unaccepted images.
    TrialState,
    /// We booted from a bank other than the one the record calls active.
    NotBootedFromActive,
    UpdateInProgress,
    UpdateNotStarted,
    BadLength,
    OutOfBounds,
    FlashError,
    /// The staged image does not match its expected digest.
    VerifyFailed,
    BadConfig,
}

impl From<FwuError> for u32 {
    fn from(e: FwuError) -> Self {
        e as u32
    }
}

impl TryFrom<u32> for FwuError {
    type Error = ();

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_u32(code).ok_or(())
    }
}

impl From<MdataError> for FwuError {
    fn from(_: MdataError) -> Self {
        FwuError::MetadataCorrupt
    }
}

/// Source of the currently active bank index.
///
/// This is the platform hook consulted before every update. There is
/// deliberately no default implementation: a platform that has not been
/// wired up must fail the query instead of claiming that bank 0 is active.
pub trait ActiveIndexSource {
    fn active_index(&mut self) -> Result<u32, FwuError>;
}

/// A decoded record knows its own active index.
impl ActiveIndexSource for Metadata {
    fn active_index(&mut self) -> Result<u32, FwuError> {
        Ok(self.active_index)
    }
}

/// Persistent home of the metadata record.
///
/// Implementations must make `write` all-or-nothing from the point of view
/// of the next `read`: after a torn write, `read` returns either the old or
/// the new record, never a mix.
pub trait MetadataStore {
    fn read(&mut self) -> Result<Metadata, FwuError>;
    fn write(&mut self, mdata: &Metadata) -> Result<(), FwuError>;
}

/// Platform access to the firmware banks themselves.
pub trait BankFlash {
    /// Size in bytes of one write block.
    fn block_size(&self) -> usize;

    /// Number of write blocks in one bank.
    fn bank_blocks(&self) -> usize;

    fn erase_bank(&mut self, bank: u32) -> Result<(), FwuError>;

    fn write_block(
        &mut self,
        bank: u32,
        block: usize,
        data: &[u8],
    ) -> Result<(), FwuError>;

    /// Digest of the first `len` bytes of `bank`.
    fn digest(&mut self, bank: u32, len: usize) -> Result<[u8; 32], FwuError>;
}

/// Where an update session currently stands.
///
/// Committing a verified image happens within a single call and is never
/// observable from outside, so there is no phase for it.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum UpdatePhase {
    Idle,
    /// Image is being written to `target`; metadata unchanged.
    Staging { target: u32 },
}

/// Snapshot of update state handed to agents.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct FwuStatus {
    pub active_index: u32,
    pub previous_active_index: u32,
    pub num_banks: u32,
    pub bank_state: [BankState; MAX_BANKS],
    /// The active bank holds at least one image not yet accepted.
    pub trial: bool,
    pub phase: UpdatePhase,
}

/// Default number of boots allowed in trial state before reverting.
pub const DEFAULT_TRIAL_BOOT_LIMIT: u32 = 3;

fn default_trial_boot_limit() -> u32 {
    DEFAULT_TRIAL_BOOT_LIMIT
}

/// Per-platform configuration, typically the `[config.fwu]` section of an
/// application's TOML description.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FwuConfig {
    pub num_banks: u32,
    pub num_images: u32,
    #[serde(default = "default_trial_boot_limit")]
    pub trial_boot_limit: u32,
}

impl FwuConfig {
    /// At least two banks are needed so that an update never targets the
    /// bank we are running from.
    pub fn check(&self) -> Result<(), FwuError> {
        if self.num_banks < 2
            || self.num_banks as usize > MAX_BANKS
            || self.num_images as usize > MAX_IMAGES
            || self.trial_boot_limit == 0
        {
            return Err(FwuError::BadConfig);
        }
        Ok(())
    }
}

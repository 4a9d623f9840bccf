// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bank selection for A/B (and A/B/C/...) firmware updates.
//!
//! [`BankSelector`] answers two questions: which bank should an incoming
//! update be written to, and what does the metadata record look like once
//! that bank has been committed. It keeps no state between calls beyond the
//! bank count it was configured with, performs no I/O and records no traces:
//! every answer is a function of the record (or index source) it is handed.
//! Retrying, logging and persisting are the caller's business.
//!
//! The update target is always "the next bank": `(active + 1) % N`. For two
//! banks that is the same as flipping the low bit, which is how it is
//! usually written, but flipping the bit is wrong for anything but two
//! banks, so we never do it.
//!
//! The rest of this crate covers the lifecycle of a committed bank:
//! accepting its images after a good boot, counting trial boots, and
//! reverting to the previous bank.

#![cfg_attr(not(test), no_std)]

use drv_fwu_api::{
    ActiveIndexSource, BankState, FwuConfig, FwuError, Metadata, Uuid,
};

mod trial;

pub use trial::{BootDecision, BootOutcome, TrialTracker};

/// A bank index known to be in range for the selector that produced it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct BankId(u32);

impl BankId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl From<BankId> for u32 {
    fn from(b: BankId) -> Self {
        b.0
    }
}

impl From<BankId> for usize {
    fn from(b: BankId) -> Self {
        b.0 as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BankSelector {
    num_banks: u32,
}

impl BankSelector {
    /// Creates a selector for `num_banks` banks.
    ///
    /// Fewer than two banks cannot work: the update target would be the
    /// running bank.
    pub fn new(num_banks: u32) -> Result<Self, FwuError> {
        if num_banks < 2 || num_banks as usize > drv_fwu_api::MAX_BANKS {
            return Err(FwuError::BadConfig);
        }
        Ok(Self { num_banks })
    }

    pub fn from_config(cfg: &FwuConfig) -> Result<Self, FwuError> {
        cfg.check()?;
        Self::new(cfg.num_banks)
    }

    pub fn num_banks(&self) -> u32 {
        self.num_banks
    }

    /// Validates a caller-supplied bank index.
    pub fn bank(&self, index: u32) -> Result<BankId, FwuError> {
        if index < self.num_banks {
            Ok(BankId(index))
        } else {
            Err(FwuError::InvalidBankIndex)
        }
    }

    /// Validates the active index stored in a record.
    ///
    /// An out-of-range value means the record is corrupt or was never
    /// provisioned. We refuse to guess a default bank here, since guessing
    /// wrong can leave the board without a bootable image.
    ///
    /// A record describing a different number of banks than we were
    /// configured for is rejected the same way: its bank states and image
    /// slots do not line up with the banks we would pick from.
    pub fn active_bank(&self, mdata: &Metadata) -> Result<BankId, FwuError> {
        self.same_banks(mdata)?;
        self.checked(mdata.active_index)
    }

    fn same_banks(&self, mdata: &Metadata) -> Result<(), FwuError> {
        if mdata.num_banks == self.num_banks {
            Ok(())
        } else {
            Err(FwuError::InvalidMetadata)
        }
    }

    fn checked(&self, index: u32) -> Result<BankId, FwuError> {
        if index < self.num_banks {
            Ok(BankId(index))
        } else {
            Err(FwuError::InvalidMetadata)
        }
    }

    /// The bank an update should be written to, given a source for the
    /// active bank.
    ///
    /// The source is queried exactly once. A failed query is reported as
    /// [`FwuError::ActiveIndexFetchFailed`] and not retried.
    pub fn get_update_index(
        &self,
        source: &mut impl ActiveIndexSource,
    ) -> Result<BankId, FwuError> {
        let active = source
            .active_index()
            .map_err(|_| FwuError::ActiveIndexFetchFailed)?;
        let active = self.checked(active)?;
        Ok(self.next(active))
    }

    /// The bank an update should be written to, taking the active bank from
    /// `mdata`.
    pub fn update_index(&self, mdata: &Metadata) -> Result<BankId, FwuError> {
        Ok(self.next(self.active_bank(mdata)?))
    }

    fn next(&self, bank: BankId) -> BankId {
        let n = bank.0 + 1;
        BankId(if n == self.num_banks { 0 } else { n })
    }

    /// Returns the record that makes `target` the active bank.
    ///
    /// The old active bank becomes the previous bank, which is where
    /// [`revert_boot_index`](Self::revert_boot_index) goes back to. Nothing
    /// else in the record changes, and nothing is written: the caller
    /// persists the result, and only after the image in `target` has been
    /// verified.
    pub fn commit_update(&self, mdata: &Metadata, target: BankId) -> Metadata {
        let mut out = *mdata;
        out.previous_active_index = mdata.active_index;
        out.active_index = target.0;
        out
    }

    /// Returns the record that swaps the active and previous banks.
    pub fn revert_boot_index(
        &self,
        mdata: &Metadata,
    ) -> Result<Metadata, FwuError> {
        let active = self.active_bank(mdata)?;
        let previous = self.checked(mdata.previous_active_index)?;
        if mdata.bank_state[usize::from(previous)] == BankState::Invalid {
            return Err(FwuError::InvalidMetadata);
        }
        let mut out = *mdata;
        out.active_index = previous.0;
        out.previous_active_index = active.0;
        Ok(out)
    }

    /// Marks `bank` as freshly written: its images are unaccepted and the
    /// bank is valid but not yet accepted.
    pub fn stage_bank(&self, mdata: &Metadata, bank: BankId) -> Metadata {
        let mut out = *mdata;
        let b = usize::from(bank);
        for img in out.images_mut() {
            img.banks[b].accepted = false;
        }
        out.bank_state[b] = BankState::Valid;
        out
    }

    /// Accepts the image of type `image_type` in `bank`.
    ///
    /// Once every image in the bank is accepted, the bank itself becomes
    /// [`BankState::Accepted`].
    pub fn accept_image(
        &self,
        mdata: &Metadata,
        image_type: &Uuid,
        bank: BankId,
    ) -> Result<Metadata, FwuError> {
        self.set_accepted(mdata, image_type, bank, true)
    }

    /// Withdraws acceptance of the image of type `image_type` in `bank`.
    pub fn clear_accept_image(
        &self,
        mdata: &Metadata,
        image_type: &Uuid,
        bank: BankId,
    ) -> Result<Metadata, FwuError> {
        self.set_accepted(mdata, image_type, bank, false)
    }

    fn set_accepted(
        &self,
        mdata: &Metadata,
        image_type: &Uuid,
        bank: BankId,
        accepted: bool,
    ) -> Result<Metadata, FwuError> {
        self.same_banks(mdata)?;
        let b = usize::from(bank);
        if mdata.bank_state[b] == BankState::Invalid {
            return Err(FwuError::InvalidBankIndex);
        }
        let ndx = mdata
            .find_image(image_type)
            .ok_or(FwuError::ImageNotFound)?;

        let mut out = *mdata;
        out.images[ndx].banks[b].accepted = accepted;
        out.bank_state[b] = if out.bank_fully_accepted(b) {
            BankState::Accepted
        } else {
            BankState::Valid
        };
        Ok(out)
    }

    /// Whether the active bank is still on trial, i.e. holds an image that
    /// has not been accepted.
    pub fn in_trial_state(&self, mdata: &Metadata) -> Result<bool, FwuError> {
        let active = self.active_bank(mdata)?;
        Ok(!mdata.bank_fully_accepted(active.into()))
    }

    /// Checks that a new update may start.
    ///
    /// Updates are refused while the active bank is on trial (a second
    /// update would overwrite the only known-good bank) and when the
    /// platform reports having booted from some other bank than the active
    /// one (the running image would be overwritten).
    pub fn update_checks(
        &self,
        mdata: &Metadata,
        boot_index: u32,
    ) -> Result<(), FwuError> {
        let active = self.active_bank(mdata)?;
        if self.in_trial_state(mdata)? {
            return Err(FwuError::TrialState);
        }
        if boot_index != active.0 {
            return Err(FwuError::NotBootedFromActive);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRMWARE: Uuid = [0x5a; 16];
    const LOADER: Uuid = [0xa5; 16];

    fn ab() -> BankSelector {
        BankSelector::new(2).unwrap()
    }

    fn mdata(active: u32) -> Metadata {
        let mut m = Metadata::new(2, 2).unwrap();
        m.images[0].image_type_uuid = FIRMWARE;
        m.images[1].image_type_uuid = LOADER;
        m.active_index = active;
        m
    }

    struct Unwired;

    impl ActiveIndexSource for Unwired {
        fn active_index(&mut self) -> Result<u32, FwuError> {
            Err(FwuError::FlashError)
        }
    }

    #[test]
    fn two_bank_toggle() {
        let sel = ab();
        assert_eq!(sel.update_index(&mdata(0)), Ok(BankId(1)));
        assert_eq!(sel.update_index(&mdata(1)), Ok(BankId(0)));
    }

    #[test]
    fn three_banks_rotate_instead_of_xor() {
        let sel = BankSelector::new(3).unwrap();
        let mut m = Metadata::new(3, 1).unwrap();
        m.active_index = 2;
        // 2 ^ 1 would be 3, which does not exist.
        assert_eq!(sel.update_index(&m), Ok(BankId(0)));
        m.active_index = 1;
        assert_eq!(sel.update_index(&m), Ok(BankId(2)));
    }

    #[test]
    fn rejects_bad_bank_counts() {
        assert_eq!(BankSelector::new(0), Err(FwuError::BadConfig));
        assert_eq!(BankSelector::new(1), Err(FwuError::BadConfig));
        assert_eq!(BankSelector::new(5), Err(FwuError::BadConfig));
    }

    #[test]
    fn out_of_range_active_index() {
        assert_eq!(
            ab().update_index(&mdata(3)),
            Err(FwuError::InvalidMetadata)
        );
        assert_eq!(
            ab().get_update_index(&mut mdata(5)),
            Err(FwuError::InvalidMetadata)
        );
    }

    #[test]
    fn failed_query_is_reported_as_such() {
        assert_eq!(
            ab().get_update_index(&mut Unwired),
            Err(FwuError::ActiveIndexFetchFailed)
        );
    }

    #[test]
    fn commit_moves_active_to_previous() {
        let sel = ab();
        let m = mdata(0);
        let target = sel.update_index(&m).unwrap();
        let c = sel.commit_update(&m, target);
        assert_eq!(c.active_index, 1);
        assert_eq!(c.previous_active_index, 0);
        assert_eq!(c.images, m.images);
        assert_eq!(c.bank_state, m.bank_state);
        assert_eq!(c.num_banks, m.num_banks);
    }

    #[test]
    fn revert_swaps_banks() {
        let sel = ab();
        let c = sel.commit_update(&mdata(0), BankId(1));
        let r = sel.revert_boot_index(&c).unwrap();
        assert_eq!(r.active_index, 0);
        assert_eq!(r.previous_active_index, 1);
    }

    #[test]
    fn revert_refuses_invalid_previous_bank() {
        let sel = ab();
        let c = sel.commit_update(&mdata(0), BankId(1));
        let mut c = c;
        c.bank_state[0] = BankState::Invalid;
        assert_eq!(sel.revert_boot_index(&c), Err(FwuError::InvalidMetadata));
    }

    #[test]
    fn record_for_other_bank_count_is_invalid() {
        let sel = BankSelector::new(3).unwrap();
        let mut m = mdata(0);
        m.active_index = 1;
        // Bank 2 exists for the selector but not in the record.
        assert_eq!(sel.update_index(&m), Err(FwuError::InvalidMetadata));
        assert_eq!(sel.active_bank(&m), Err(FwuError::InvalidMetadata));
        assert_eq!(sel.update_checks(&m, 1), Err(FwuError::InvalidMetadata));
        assert_eq!(sel.in_trial_state(&m), Err(FwuError::InvalidMetadata));
        assert_eq!(
            sel.accept_image(&m, &FIRMWARE, BankId(1)),
            Err(FwuError::InvalidMetadata)
        );

        // And the other way around.
        let m = Metadata::new(3, 1).unwrap();
        assert_eq!(ab().update_index(&m), Err(FwuError::InvalidMetadata));
    }

    #[test]
    fn bank_rejects_out_of_range() {
        assert_eq!(ab().bank(1), Ok(BankId(1)));
        assert_eq!(ab().bank(2), Err(FwuError::InvalidBankIndex));
    }

    #[test]
    fn accepting_every_image_accepts_the_bank() {
        let sel = ab();
        let m = sel.stage_bank(&mdata(0), BankId(1));
        let m = sel.commit_update(&m, BankId(1));
        assert_eq!(m.bank_state[1], BankState::Valid);
        assert_eq!(sel.in_trial_state(&m), Ok(true));

        let m = sel.accept_image(&m, &FIRMWARE, BankId(1)).unwrap();
        assert_eq!(m.bank_state[1], BankState::Valid);
        assert_eq!(sel.in_trial_state(&m), Ok(true));

        let m = sel.accept_image(&m, &LOADER, BankId(1)).unwrap();
        assert_eq!(m.bank_state[1], BankState::Accepted);
        assert_eq!(sel.in_trial_state(&m), Ok(false));

        let m = sel.clear_accept_image(&m, &LOADER, BankId(1)).unwrap();
        assert_eq!(m.bank_state[1], BankState::Valid);
    }

    #[test]
    fn accept_unknown_image() {
        assert_eq!(
            ab().accept_image(&mdata(0), &[0; 16], BankId(0)),
            Err(FwuError::ImageNotFound)
        );
    }

    #[test]
    fn update_checks() {
        let sel = ab();
        assert_eq!(sel.update_checks(&mdata(0), 0), Ok(()));
        assert_eq!(
            sel.update_checks(&mdata(0), 1),
            Err(FwuError::NotBootedFromActive)
        );

        let trial = sel.commit_update(
            &sel.stage_bank(&mdata(0), BankId(1)),
            BankId(1),
        );
        assert_eq!(sel.update_checks(&trial, 1), Err(FwuError::TrialState));
        assert_eq!(
            sel.update_checks(&mdata(7), 0),
            Err(FwuError::InvalidMetadata)
        );
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-order firmware update server.
//!
//! Drives one update at a time through the bank lifecycle:
//!
//! ```text
//!   Idle --prep_image_update--> Staging --finish_image_update--> Idle
//!    ^                            |
//!    +--------abort_update--------+
//! ```
//!
//! Committing is not a state of its own here: `finish_image_update` verifies
//! the image, computes the new record and persists it before returning, so
//! no caller can ever observe an update halfway through its commit.
//!
//! This server is intended to carry as little state as possible: the target
//! bank of the update in progress, how much of it has been written, and the
//! record as read when the update started. The record is read once per
//! update and written once, after the staged image has been verified.
//! Abandoning an update at any point before that (abort, error, power loss)
//! therefore leaves the board booting the bank it booted before.

#![cfg_attr(not(test), no_std)]

use drv_fwu_api::{
    BankFlash, FwuError, FwuStatus, Metadata, MetadataStore, UpdatePhase,
    Uuid,
};
use fwu_bank::{BankId, BankSelector, BootDecision, BootOutcome, TrialTracker};
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Prep { target: u32 },
    Refused(FwuError),
    EraseFailed(FwuError),
    BlockFailed { block: usize, err: FwuError },
    Aborted { target: u32 },
    VerifyFailed { target: u32 },
    Committed { active: u32, previous: u32 },
    CommitFailed(FwuError),
    Accepted { bank: u32 },
    TrialBoot { attempt: u32 },
    Reverted { active: u32 },
}

ringbuf!(Trace, 32, Trace::None);

enum UpdateState {
    NoUpdate,
    InProgress {
        target: BankId,
        high_water: usize,
        /// The record this update started from, and will be committed on
        /// top of.
        mdata: Metadata,
    },
}

pub struct ServerImpl<S, F> {
    store: S,
    banks: F,
    selector: BankSelector,
    /// Bank the running image was actually loaded from, as reported by the
    /// boot stage.
    boot_index: u32,
    state: UpdateState,
}

impl<S: MetadataStore, F: BankFlash> ServerImpl<S, F> {
    pub fn new(
        store: S,
        banks: F,
        selector: BankSelector,
        boot_index: u32,
    ) -> Self {
        Self {
            store,
            banks,
            selector,
            boot_index,
            state: UpdateState::NoUpdate,
        }
    }

    pub fn into_parts(self) -> (S, F) {
        (self.store, self.banks)
    }

    /// Picks the target bank, checks that an update may start at all, and
    /// erases the target. Metadata is left untouched.
    pub fn prep_image_update(&mut self) -> Result<u32, FwuError> {
        if !matches!(self.state, UpdateState::NoUpdate) {
            return Err(FwuError::UpdateInProgress);
        }

        let (target, mdata) = match self.pick_target() {
            Ok(picked) => picked,
            Err(e) => {
                ringbuf_entry!(Trace::Refused(e));
                return Err(e);
            }
        };

        if let Err(e) = self.banks.erase_bank(target.index()) {
            ringbuf_entry!(Trace::EraseFailed(e));
            return Err(e);
        }

        ringbuf_entry!(Trace::Prep {
            target: target.index()
        });
        self.state = UpdateState::InProgress {
            target,
            high_water: 0,
            mdata,
        };
        Ok(target.index())
    }

    fn pick_target(&mut self) -> Result<(BankId, Metadata), FwuError> {
        // A record we cannot read is a record that cannot tell us which bank
        // is active.
        let mut mdata = self
            .store
            .read()
            .map_err(|_| FwuError::ActiveIndexFetchFailed)?;
        let target = self.selector.get_update_index(&mut mdata)?;
        self.selector.update_checks(&mdata, self.boot_index)?;
        Ok((target, mdata))
    }

    pub fn abort_update(&mut self) -> Result<(), FwuError> {
        match self.state {
            UpdateState::InProgress { target, .. } => {
                ringbuf_entry!(Trace::Aborted {
                    target: target.index()
                });
                self.state = UpdateState::NoUpdate;
                Ok(())
            }
            UpdateState::NoUpdate => Err(FwuError::UpdateNotStarted),
        }
    }

    pub fn block_size(&self) -> usize {
        self.banks.block_size()
    }

    pub fn write_one_block(
        &mut self,
        block_num: usize,
        block: &[u8],
    ) -> Result<(), FwuError> {
        let UpdateState::InProgress {
            target, high_water, ..
        } = &mut self.state
        else {
            return Err(FwuError::UpdateNotStarted);
        };

        let block_size = self.banks.block_size();
        if block.is_empty() || block.len() > block_size {
            return Err(FwuError::BadLength);
        }
        if block_num >= self.banks.bank_blocks() {
            return Err(FwuError::OutOfBounds);
        }

        if let Err(err) =
            self.banks.write_block(target.index(), block_num, block)
        {
            ringbuf_entry!(Trace::BlockFailed {
                block: block_num,
                err
            });
            return Err(err);
        }

        let end = block_num * block_size + block.len();
        *high_water = (*high_water).max(end);
        Ok(())
    }

    /// Verifies the staged image against `digest` and, if it matches, makes
    /// its bank the active one.
    ///
    /// A digest mismatch leaves the update in progress so that the caller
    /// can rewrite blocks or abort. Any failure after verification ends the
    /// update with the old bank still active.
    pub fn finish_image_update(
        &mut self,
        image_len: usize,
        digest: &[u8; 32],
    ) -> Result<(), FwuError> {
        let UpdateState::InProgress {
            target,
            high_water,
            mdata,
        } = self.state
        else {
            return Err(FwuError::UpdateNotStarted);
        };

        let bank_len = self.banks.bank_blocks() * self.banks.block_size();
        if image_len == 0 || image_len > bank_len || image_len > high_water {
            return Err(FwuError::BadLength);
        }

        if self.banks.digest(target.index(), image_len)? != *digest {
            ringbuf_entry!(Trace::VerifyFailed {
                target: target.index()
            });
            return Err(FwuError::VerifyFailed);
        }

        // Whatever happens from here on, this update is over.
        self.state = UpdateState::NoUpdate;
        self.commit(target, &mdata)
    }

    fn commit(
        &mut self,
        target: BankId,
        mdata: &Metadata,
    ) -> Result<(), FwuError> {
        let staged = self.selector.stage_bank(mdata, target);
        let committed = self.selector.commit_update(&staged, target);

        match self.store.write(&committed) {
            Ok(()) => {
                ringbuf_entry!(Trace::Committed {
                    active: committed.active_index,
                    previous: committed.previous_active_index,
                });
                Ok(())
            }
            Err(e) => {
                ringbuf_entry!(Trace::CommitFailed(e));
                Err(e)
            }
        }
    }

    /// Accepts the image of type `image_type` in the active bank.
    pub fn accept_image(&mut self, image_type: &Uuid) -> Result<(), FwuError> {
        let mdata = self.store.read()?;
        let active = self.selector.active_bank(&mdata)?;
        let accepted = self.selector.accept_image(&mdata, image_type, active)?;
        self.store.write(&accepted)?;
        ringbuf_entry!(Trace::Accepted {
            bank: active.index()
        });
        Ok(())
    }

    /// Runs trial boot accounting for this boot.
    ///
    /// `counter` is the trial counter the platform persisted last time; the
    /// returned outcome carries the value to persist for next time. If the
    /// trial budget is exhausted the reverted record has already been
    /// written when this returns, and the caller should reset.
    pub fn boot_check(
        &mut self,
        tracker: &TrialTracker,
        counter: u32,
    ) -> Result<BootOutcome, FwuError> {
        let mdata = self.store.read()?;
        let outcome = tracker.on_boot(&self.selector, &mdata, counter)?;
        match outcome.decision {
            BootDecision::Normal => (),
            BootDecision::Trial { attempt } => {
                ringbuf_entry!(Trace::TrialBoot { attempt });
            }
            BootDecision::Revert(reverted) => {
                self.store.write(&reverted)?;
                ringbuf_entry!(Trace::Reverted {
                    active: reverted.active_index
                });
            }
        }
        Ok(outcome)
    }

    pub fn status(&mut self) -> Result<FwuStatus, FwuError> {
        let mdata: Metadata = self.store.read()?;
        let trial = self.selector.in_trial_state(&mdata)?;
        let phase = match self.state {
            UpdateState::NoUpdate => UpdatePhase::Idle,
            UpdateState::InProgress { target, .. } => UpdatePhase::Staging {
                target: target.index(),
            },
        };
        Ok(FwuStatus {
            active_index: mdata.active_index,
            previous_active_index: mdata.previous_active_index,
            num_banks: mdata.num_banks,
            bank_state: mdata.bank_state,
            trial,
            phase,
        })
    }
}

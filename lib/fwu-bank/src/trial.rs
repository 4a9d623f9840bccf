// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trial boot accounting.
//!
//! After an update is committed the new bank boots "on trial" until its
//! images are accepted. Each trial boot bumps a counter that the platform
//! keeps somewhere outside the metadata record; once the counter passes the
//! configured limit, the bank is given up on and we revert to the previous
//! one.

use crate::BankSelector;
use drv_fwu_api::{FwuConfig, FwuError, Metadata, DEFAULT_TRIAL_BOOT_LIMIT};

/// What the boot path should do about the current boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDecision {
    /// Active bank is fully accepted.
    Normal,
    /// Active bank is on trial; this is trial boot number `attempt`.
    Trial { attempt: u32 },
    /// Trial budget exhausted: persist this record and reset.
    Revert(Metadata),
}

/// The decision for this boot and the counter value to store for the next
/// one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootOutcome {
    pub decision: BootDecision,
    pub counter: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrialTracker {
    limit: u32,
}

impl Default for TrialTracker {
    fn default() -> Self {
        Self {
            limit: DEFAULT_TRIAL_BOOT_LIMIT,
        }
    }
}

impl TrialTracker {
    pub fn new(limit: u32) -> Result<Self, FwuError> {
        if limit == 0 {
            return Err(FwuError::BadConfig);
        }
        Ok(Self { limit })
    }

    pub fn from_config(cfg: &FwuConfig) -> Result<Self, FwuError> {
        Self::new(cfg.trial_boot_limit)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Accounts for one boot, given the trial counter persisted by the
    /// previous boot.
    pub fn on_boot(
        &self,
        sel: &BankSelector,
        mdata: &Metadata,
        counter: u32,
    ) -> Result<BootOutcome, FwuError> {
        if !sel.in_trial_state(mdata)? {
            return Ok(BootOutcome {
                decision: BootDecision::Normal,
                counter: 0,
            });
        }

        let attempt = counter.saturating_add(1);
        if attempt > self.limit {
            let reverted = sel.revert_boot_index(mdata)?;
            return Ok(BootOutcome {
                decision: BootDecision::Revert(reverted),
                counter: 0,
            });
        }

        Ok(BootOutcome {
            decision: BootDecision::Trial { attempt },
            counter: attempt,
        })
    }
}

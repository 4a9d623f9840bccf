// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Redundant metadata storage.
//!
//! The metadata record is kept twice, at two offsets of some flash device,
//! and always written primary first. That ordering is what makes a write
//! atomic from the point of view of the next read:
//!
//! - power lost while writing the primary: the primary fails its checks,
//!   the secondary still holds the old record, and we read the old record;
//! - power lost while writing the secondary: the primary already holds the
//!   complete new record, and we read the new record.
//!
//! [`MetadataStore::write`] therefore reports `PersistFailed` only when the
//! primary could not be written, which is exactly the case in which the old
//! record stays in force.
//!
//! Reading repairs whichever copy is bad (or stale) from the other one, so
//! a single torn write never survives a subsequent read.

#![cfg_attr(not(test), no_std)]

use drv_fwu_api::{
    FwuError, MdataError, Metadata, MetadataStore, FWU_MDATA_SIZE,
};
use ringbuf::{ringbuf, ringbuf_entry};

/// Byte-addressed access to the device holding the metadata copies.
pub trait FlashBackend {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FwuError>;

    /// Erases (at least) `len` bytes starting at `offset`.
    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FwuError>;

    /// Programs previously erased bytes.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FwuError>;
}

/// Flash emulated by a byte slice, with NOR semantics: erased bytes read as
/// `0xff` and programming can only clear bits.
pub struct SliceFlash<'a>(pub &'a mut [u8]);

impl SliceFlash<'_> {
    fn range(
        &self,
        offset: u32,
        len: usize,
    ) -> Result<core::ops::Range<usize>, FwuError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(FwuError::OutOfBounds)?;
        if end > self.0.len() {
            return Err(FwuError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashBackend for SliceFlash<'_> {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FwuError> {
        let r = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.0[r]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FwuError> {
        let r = self.range(offset, len)?;
        self.0[r].fill(0xff);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FwuError> {
        let r = self.range(offset, data.len())?;
        for (d, s) in self.0[r].iter_mut().zip(data) {
            *d &= *s;
        }
        Ok(())
    }
}

/// Which of the two copies we are talking about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MdataCopy {
    Primary,
    Secondary,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    ReadFailed(MdataCopy, FwuError),
    CopyInvalid(MdataCopy, MdataError),
    CopiesDiffer,
    Repaired(MdataCopy),
    RepairFailed(MdataCopy, FwuError),
    BothCorrupt,
    Wrote(MdataCopy),
    WriteFailed(MdataCopy, FwuError),
    ReadbackMismatch(MdataCopy),
}

ringbuf!(Trace, 64, Trace::None);

/// Offsets of the two copies on the backing device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreLayout {
    pub primary: u32,
    pub secondary: u32,
}

impl StoreLayout {
    /// The two copies must not overlap, or a torn write could take out both.
    pub fn check(&self) -> Result<(), FwuError> {
        if (self.primary.abs_diff(self.secondary) as usize) < FWU_MDATA_SIZE {
            return Err(FwuError::BadConfig);
        }
        Ok(())
    }
}

/// A [`MetadataStore`] keeping a primary and a secondary copy.
pub struct MirroredStore<F> {
    flash: F,
    layout: StoreLayout,
}

impl<F: FlashBackend> MirroredStore<F> {
    pub fn new(flash: F, layout: StoreLayout) -> Result<Self, FwuError> {
        layout.check()?;
        Ok(Self { flash, layout })
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn offset(&self, which: MdataCopy) -> u32 {
        match which {
            MdataCopy::Primary => self.layout.primary,
            MdataCopy::Secondary => self.layout.secondary,
        }
    }

    /// Reads and checks one copy, without any repair.
    pub fn read_copy(
        &mut self,
        which: MdataCopy,
    ) -> Result<Metadata, FwuError> {
        let mut buf = [0u8; FWU_MDATA_SIZE];
        if let Err(e) = self.flash.read(self.offset(which), &mut buf) {
            ringbuf_entry!(Trace::ReadFailed(which, e));
            return Err(e);
        }
        Metadata::decode(&buf).map_err(|e| {
            ringbuf_entry!(Trace::CopyInvalid(which, e));
            FwuError::MetadataCorrupt
        })
    }

    fn write_copy(
        &mut self,
        which: MdataCopy,
        buf: &[u8; FWU_MDATA_SIZE],
    ) -> Result<(), FwuError> {
        let offset = self.offset(which);
        self.flash.erase(offset, FWU_MDATA_SIZE)?;
        self.flash.program(offset, buf)?;

        let mut check = [0u8; FWU_MDATA_SIZE];
        self.flash.read(offset, &mut check)?;
        if &check != buf {
            ringbuf_entry!(Trace::ReadbackMismatch(which));
            return Err(FwuError::FlashError);
        }
        ringbuf_entry!(Trace::Wrote(which));
        Ok(())
    }

    /// Rewrites `bad` from `good`. A failed repair is recorded but does not
    /// fail the read: we still have one good copy in hand.
    fn repair(&mut self, bad: MdataCopy, good: &Metadata) {
        let mut buf = [0u8; FWU_MDATA_SIZE];
        let result = match good.encode(&mut buf) {
            Ok(_) => self.write_copy(bad, &buf),
            Err(_) => Err(FwuError::MetadataCorrupt),
        };
        match result {
            Ok(()) => ringbuf_entry!(Trace::Repaired(bad)),
            Err(e) => ringbuf_entry!(Trace::RepairFailed(bad, e)),
        }
    }
}

impl<F: FlashBackend> MetadataStore for MirroredStore<F> {
    fn read(&mut self) -> Result<Metadata, FwuError> {
        let primary = self.read_copy(MdataCopy::Primary);
        let secondary = self.read_copy(MdataCopy::Secondary);

        match (primary, secondary) {
            (Ok(p), Ok(s)) => {
                // The primary is always written first, so if the two differ
                // the primary holds the newer complete record.
                if p != s {
                    ringbuf_entry!(Trace::CopiesDiffer);
                    self.repair(MdataCopy::Secondary, &p);
                }
                Ok(p)
            }
            (Ok(good), Err(_)) => {
                self.repair(MdataCopy::Secondary, &good);
                Ok(good)
            }
            (Err(_), Ok(good)) => {
                self.repair(MdataCopy::Primary, &good);
                Ok(good)
            }
            (Err(_), Err(_)) => {
                ringbuf_entry!(Trace::BothCorrupt);
                Err(FwuError::BothCopiesCorrupt)
            }
        }
    }

    fn write(&mut self, mdata: &Metadata) -> Result<(), FwuError> {
        let mut buf = [0u8; FWU_MDATA_SIZE];
        mdata
            .encode(&mut buf)
            .map_err(|_| FwuError::PersistFailed)?;

        // The primary is the commit point. If it cannot be written, the
        // secondary still holds the old record and that is what the next
        // read returns.
        if let Err(e) = self.write_copy(MdataCopy::Primary, &buf) {
            ringbuf_entry!(Trace::WriteFailed(MdataCopy::Primary, e));
            return Err(FwuError::PersistFailed);
        }

        // Past this point the new record is durable. A stale or torn
        // secondary is repaired from the primary on the next read.
        if let Err(e) = self.write_copy(MdataCopy::Secondary, &buf) {
            ringbuf_entry!(Trace::WriteFailed(MdataCopy::Secondary, e));
        }
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side handling of FWU metadata images.
//!
//! An image file holds the two copies of the record the way they sit on
//! flash: the primary at offset 0 and the secondary at a configurable
//! offset, with erased (`0xff`) bytes in between. All edits go through the
//! same [`MirroredStore`] and [`BankSelector`] the firmware uses, so a file
//! produced here is exactly what the board would have written.

use std::fmt::Write;

use anyhow::{anyhow, bail, Result};
use drv_fwu_api::{
    BankState, FwuError, MdataError, Metadata, MetadataStore, Uuid,
    FWU_MDATA_SIZE,
};
use drv_fwu_mdata_store::{MdataCopy, MirroredStore, SliceFlash, StoreLayout};
use fwu_bank::BankSelector;

pub mod layout;

/// Where the secondary copy goes unless told otherwise: one 4 KiB erase
/// sector after the primary.
pub const DEFAULT_SECONDARY_OFFSET: u32 = 0x1000;

fn fwu(e: FwuError) -> anyhow::Error {
    anyhow!("{e:?}")
}

fn store_layout(secondary: u32) -> StoreLayout {
    StoreLayout {
        primary: 0,
        secondary,
    }
}

/// Size of an image file with the secondary copy at `secondary`.
pub fn image_len(secondary: u32) -> usize {
    secondary as usize + FWU_MDATA_SIZE.max(secondary as usize)
}

fn open(
    buf: &mut [u8],
    secondary: u32,
) -> Result<MirroredStore<SliceFlash<'_>>> {
    if buf.len() < secondary as usize + FWU_MDATA_SIZE {
        bail!(
            "image is {} bytes, too short for a copy at {secondary:#x}",
            buf.len()
        );
    }
    MirroredStore::new(SliceFlash(buf), store_layout(secondary)).map_err(|_| {
        anyhow!("secondary offset {secondary:#x} overlaps the primary copy")
    })
}

/// Produces a fresh image holding `mdata` in both copies.
pub fn generate(mdata: &Metadata, secondary: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0xff; image_len(secondary)];
    open(&mut buf, secondary)?.write(mdata).map_err(fwu)?;
    Ok(buf)
}

/// Decodes both copies of an image without repairing anything.
pub fn inspect(
    buf: &[u8],
    secondary: u32,
) -> [(MdataCopy, Result<Metadata, MdataError>); 2] {
    let copy = |offset: usize| {
        buf.get(offset..)
            .ok_or(MdataError::Short)
            .and_then(Metadata::decode)
    };
    [
        (MdataCopy::Primary, copy(0)),
        (MdataCopy::Secondary, copy(secondary as usize)),
    ]
}

/// A change to the record in an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Edit {
    /// Make a bank active, keeping the old one as the fallback.
    SetActive(u32),
    /// Accept an image, by type, in the active bank.
    Accept(Uuid),
    /// Go back to the previous bank.
    Revert,
}

/// Applies `edit` to the image in `buf` and returns the new record.
///
/// Reading the image repairs a bad or stale copy first, and both copies
/// hold the new record afterwards.
pub fn apply(buf: &mut [u8], secondary: u32, edit: &Edit) -> Result<Metadata> {
    let mut store = open(buf, secondary)?;
    let old = store.read().map_err(fwu)?;
    let sel = BankSelector::new(old.num_banks).map_err(fwu)?;

    let new = match edit {
        Edit::SetActive(index) => {
            let bank = sel
                .bank(*index)
                .map_err(|_| anyhow!("bank {index} does not exist"))?;
            if old.bank_state[usize::from(bank)] == BankState::Invalid {
                bail!("bank {index} is invalid and cannot be made active");
            }
            if old.active_index == *index {
                bail!("bank {index} is already active");
            }
            sel.commit_update(&old, bank)
        }
        Edit::Accept(image_type) => {
            let active = sel.active_bank(&old).map_err(fwu)?;
            sel.accept_image(&old, image_type, active).map_err(fwu)?
        }
        Edit::Revert => sel.revert_boot_index(&old).map_err(fwu)?,
    };

    store.write(&new).map_err(fwu)?;
    Ok(new)
}

/// Human-readable rendering of a record.
pub fn describe(m: &Metadata) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        "active bank {}, previous bank {}, {} banks, {} images",
        m.active_index, m.previous_active_index, m.num_banks, m.num_images
    );
    for (b, state) in m.bank_state[..m.num_banks as usize].iter().enumerate() {
        let _ = writeln!(out, "  bank {b}: {state:?}");
    }
    for (i, img) in m.images().iter().enumerate() {
        let _ = writeln!(
            out,
            "  image {i}: type {} location {}",
            layout::format_guid(&img.image_type_uuid),
            layout::format_guid(&img.location_uuid),
        );
        for (b, info) in img.banks[..m.num_banks as usize].iter().enumerate() {
            let _ = writeln!(
                out,
                "    bank {b}: {} {}",
                layout::format_guid(&info.image_uuid),
                if info.accepted { "accepted" } else { "unaccepted" },
            );
        }
    }
    out
}

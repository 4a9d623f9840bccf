// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update (FWU) metadata record.
//!
//! The metadata record is the only persistent state of the A/B update
//! scheme: it names the bank we boot from, the bank we booted from before
//! that, and, per image and per bank, whether the image has been accepted
//! after a trial boot.
//!
//! On flash the record is a fixed 544 byte little-endian structure
//! ([`RawMetadata`]) protected by a CRC-32 over everything after the
//! checksum field. In memory we work with [`Metadata`], which carries the
//! same information with the reserved fields and checksum stripped and the
//! bank states decoded.
//!
//! Decoding checks the structure of the record (checksum, version, sizes,
//! counts) but deliberately does *not* range-check `active_index`: a
//! well-formed record naming a bank that does not exist is a policy
//! problem, and is reported by the bank selector rather than hidden here.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_32_ISO_HDLC};
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Largest number of banks a record can describe.
pub const MAX_BANKS: usize = 4;

/// Largest number of images per bank a record can describe.
pub const MAX_IMAGES: usize = 4;

/// The only record version we read or write.
pub const FWU_MDATA_VERSION: u32 = 2;

/// Size of the on-flash record in bytes.
pub const FWU_MDATA_SIZE: usize = core::mem::size_of::<RawMetadata>();

const_assert_eq!(FWU_MDATA_SIZE, 544);

/// Value of a per-bank `accepted` word once the image has been accepted.
const IMAGE_ACCEPTED: u32 = 1;

static CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// GUIDs are stored as 16 raw bytes, in whatever byte order the tool that
/// wrote them used; we only ever compare them.
pub type Uuid = [u8; 16];

/// Errors produced while decoding or encoding a record.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum MdataError {
    /// Buffer is smaller than [`FWU_MDATA_SIZE`].
    Short,
    /// Stored CRC does not match the contents.
    BadCrc,
    BadVersion(u32),
    /// `metadata_size` field disagrees with [`FWU_MDATA_SIZE`].
    BadSize(u32),
    BadBankCount(u32),
    BadImageCount(u32),
    BadBankState(u8),
}

/// Health of one bank as a whole.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum BankState {
    /// Bank content is missing or half written; never boot it.
    Invalid = 0xff,
    /// Bank holds a complete image that has not been accepted yet.
    Valid = 0xfe,
    /// Every image in the bank has been accepted.
    Accepted = 0xfc,
}

/// Per-bank information about one image.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RawImageBankInfo {
    pub image_uuid: Uuid,
    pub accepted: u32,
    reserved: u32,
}

/// One image type and its location in every bank.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RawImageEntry {
    pub image_type_uuid: Uuid,
    pub location_uuid: Uuid,
    pub banks: [RawImageBankInfo; MAX_BANKS],
}

/// The record exactly as it sits in flash.
///
/// Slots beyond `num_banks` and `num_images` are still present (the record
/// is fixed size) and are written as zeroes, with unused bank states set to
/// [`BankState::Invalid`].
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RawMetadata {
    /// CRC-32 over every byte after this field
    crc32: u32,

    /// Must always be `FWU_MDATA_VERSION`
    version: u32,

    pub active_index: u32,
    pub previous_active_index: u32,

    /// Must always be `FWU_MDATA_SIZE`
    metadata_size: u32,

    pub num_banks: u32,
    pub bank_state: [u8; MAX_BANKS],
    pub num_images: u32,
    pub images: [RawImageEntry; MAX_IMAGES],
}

impl RawMetadata {
    fn expected_checksum(&self) -> u32 {
        let mut c = CRC.digest();
        c.update(&self.as_bytes()[core::mem::size_of::<u32>()..]);
        c.finalize()
    }

    /// Recomputes and stores the checksum.
    pub fn seal(&mut self) {
        self.crc32 = self.expected_checksum();
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Structural checks, in the order a corrupted record is most likely to
    /// fail them.
    pub fn check(&self) -> Result<(), MdataError> {
        if self.crc32 != self.expected_checksum() {
            return Err(MdataError::BadCrc);
        }
        if self.version != FWU_MDATA_VERSION {
            return Err(MdataError::BadVersion(self.version));
        }
        if self.metadata_size as usize != FWU_MDATA_SIZE {
            return Err(MdataError::BadSize(self.metadata_size));
        }
        if self.num_banks == 0 || self.num_banks as usize > MAX_BANKS {
            return Err(MdataError::BadBankCount(self.num_banks));
        }
        if self.num_images as usize > MAX_IMAGES {
            return Err(MdataError::BadImageCount(self.num_images));
        }
        Ok(())
    }
}

/// Per-bank state of one image, as used in memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageBankInfo {
    pub image_uuid: Uuid,
    pub accepted: bool,
}

/// An image type and where it lives in each bank.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageEntry {
    pub image_type_uuid: Uuid,
    pub location_uuid: Uuid,
    pub banks: [ImageBankInfo; MAX_BANKS],
}

/// Decoded metadata record.
///
/// Fields are public: the record is plain data, and every policy decision
/// about it (which bank to write, when to commit) belongs to the bank
/// selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    pub active_index: u32,
    pub previous_active_index: u32,
    pub num_banks: u32,
    pub bank_state: [BankState; MAX_BANKS],
    pub num_images: u32,
    pub images: [ImageEntry; MAX_IMAGES],
}

impl Metadata {
    /// A freshly provisioned record: bank 0 is active (and was the previous
    /// bank), every configured bank is `Valid`, and every image is accepted
    /// in bank 0 only.
    pub fn new(num_banks: u32, num_images: u32) -> Result<Self, MdataError> {
        if num_banks == 0 || num_banks as usize > MAX_BANKS {
            return Err(MdataError::BadBankCount(num_banks));
        }
        if num_images as usize > MAX_IMAGES {
            return Err(MdataError::BadImageCount(num_images));
        }

        let mut bank_state = [BankState::Invalid; MAX_BANKS];
        bank_state[..num_banks as usize].fill(BankState::Valid);

        let mut images = [ImageEntry::default(); MAX_IMAGES];
        for image in &mut images[..num_images as usize] {
            image.banks[0].accepted = true;
        }

        let mut out = Self {
            active_index: 0,
            previous_active_index: 0,
            num_banks,
            bank_state,
            num_images,
            images,
        };
        if out.bank_fully_accepted(0) {
            out.bank_state[0] = BankState::Accepted;
        }
        Ok(out)
    }

    /// The images actually described by this record.
    pub fn images(&self) -> &[ImageEntry] {
        let n = (self.num_images as usize).min(MAX_IMAGES);
        &self.images[..n]
    }

    pub fn images_mut(&mut self) -> &mut [ImageEntry] {
        let n = (self.num_images as usize).min(MAX_IMAGES);
        &mut self.images[..n]
    }

    /// Index of the image with the given type, if present.
    pub fn find_image(&self, image_type_uuid: &Uuid) -> Option<usize> {
        self.images()
            .iter()
            .position(|img| &img.image_type_uuid == image_type_uuid)
    }

    /// Whether every image in `bank` has been accepted.
    ///
    /// A record with no images has nothing left to accept, so this is
    /// vacuously true for it.
    pub fn bank_fully_accepted(&self, bank: usize) -> bool {
        bank < MAX_BANKS
            && self.images().iter().all(|img| img.banks[bank].accepted)
    }

    /// Reads and checks a record from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, MdataError> {
        let (raw, _) =
            RawMetadata::read_from_prefix(buf).map_err(|_| MdataError::Short)?;
        Self::try_from(&raw)
    }

    /// Writes this record, with a freshly computed checksum, to the front of
    /// `out`. Returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, MdataError> {
        let dest = out
            .get_mut(..FWU_MDATA_SIZE)
            .ok_or(MdataError::Short)?;
        dest.copy_from_slice(RawMetadata::from(self).as_bytes());
        Ok(FWU_MDATA_SIZE)
    }
}

impl From<&Metadata> for RawMetadata {
    fn from(m: &Metadata) -> Self {
        let mut raw = RawMetadata::new_zeroed();
        raw.version = FWU_MDATA_VERSION;
        raw.active_index = m.active_index;
        raw.previous_active_index = m.previous_active_index;
        raw.metadata_size = FWU_MDATA_SIZE as u32;
        raw.num_banks = m.num_banks;
        for (dst, src) in raw.bank_state.iter_mut().zip(&m.bank_state) {
            *dst = *src as u8;
        }
        raw.num_images = m.num_images;
        for (dst, src) in raw.images.iter_mut().zip(m.images()) {
            dst.image_type_uuid = src.image_type_uuid;
            dst.location_uuid = src.location_uuid;
            for (db, sb) in dst.banks.iter_mut().zip(&src.banks) {
                db.image_uuid = sb.image_uuid;
                db.accepted = if sb.accepted { IMAGE_ACCEPTED } else { 0 };
            }
        }
        raw.seal();
        raw
    }
}

impl TryFrom<&RawMetadata> for Metadata {
    type Error = MdataError;

    fn try_from(raw: &RawMetadata) -> Result<Self, Self::Error> {
        raw.check()?;

        let mut bank_state = [BankState::Invalid; MAX_BANKS];
        for (dst, &src) in bank_state.iter_mut().zip(&raw.bank_state) {
            *dst = BankState::from_u8(src)
                .ok_or(MdataError::BadBankState(src))?;
        }

        let mut images = [ImageEntry::default(); MAX_IMAGES];
        for (dst, src) in images
            .iter_mut()
            .zip(&raw.images)
            .take(raw.num_images as usize)
        {
            dst.image_type_uuid = src.image_type_uuid;
            dst.location_uuid = src.location_uuid;
            for (db, sb) in dst.banks.iter_mut().zip(&src.banks) {
                db.image_uuid = sb.image_uuid;
                db.accepted = sb.accepted != 0;
            }
        }

        Ok(Self {
            active_index: raw.active_index,
            previous_active_index: raw.previous_active_index,
            num_banks: raw.num_banks,
            bank_state,
            num_images: raw.num_images,
            images,
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{bail, Context, Result};
use drv_fwu_api::{BankState, Metadata, Uuid, MAX_BANKS, MAX_IMAGES};
use fwu_bank::BankSelector;
use indexmap::IndexMap;
use serde::Deserialize;

/// A metadata layout file, as written by hand.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLayout {
    num_banks: u32,
    #[serde(default)]
    active_index: u32,
    #[serde(default)]
    previous_active_index: Option<u32>,
    #[serde(default)]
    images: IndexMap<String, RawImage>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawImage {
    image_type_uuid: String,
    location_uuid: String,
    bank_uuids: Vec<String>,
}

/// A checked layout. Images keep the order in which the file lists them,
/// which is also their order in the record.
#[derive(Clone, Debug)]
pub struct Layout {
    pub num_banks: u32,
    pub active_index: u32,
    pub previous_active_index: u32,
    pub images: IndexMap<String, Image>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image {
    pub image_type_uuid: Uuid,
    pub location_uuid: Uuid,
    pub bank_uuids: Vec<Uuid>,
}

impl Layout {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawLayout = toml::from_str(text)?;

        let sel = BankSelector::new(raw.num_banks).map_err(|_| {
            anyhow::anyhow!(
                "num-banks must be between 2 and {MAX_BANKS}, not {}",
                raw.num_banks
            )
        })?;
        let previous = raw.previous_active_index.unwrap_or(raw.active_index);
        for (name, ndx) in [
            ("active-index", raw.active_index),
            ("previous-active-index", previous),
        ] {
            if sel.bank(ndx).is_err() {
                bail!(
                    "{name} {ndx} is not a bank (num-banks is {})",
                    sel.num_banks()
                );
            }
        }
        if raw.images.len() > MAX_IMAGES {
            bail!(
                "{} images listed, but a record holds at most {MAX_IMAGES}",
                raw.images.len()
            );
        }

        let mut images = IndexMap::new();
        for (name, img) in raw.images {
            if img.bank_uuids.len() != raw.num_banks as usize {
                bail!(
                    "image {name}: {} bank-uuids for {} banks",
                    img.bank_uuids.len(),
                    raw.num_banks
                );
            }
            let image = Image {
                image_type_uuid: parse_guid(&img.image_type_uuid)
                    .with_context(|| format!("image {name}"))?,
                location_uuid: parse_guid(&img.location_uuid)
                    .with_context(|| format!("image {name}"))?,
                bank_uuids: img
                    .bank_uuids
                    .iter()
                    .map(|s| parse_guid(s))
                    .collect::<Result<_>>()
                    .with_context(|| format!("image {name}"))?,
            };
            if images
                .values()
                .any(|i: &Image| i.image_type_uuid == image.image_type_uuid)
            {
                bail!("image {name}: duplicate image-type-uuid");
            }
            images.insert(name, image);
        }

        Ok(Self {
            num_banks: raw.num_banks,
            active_index: raw.active_index,
            previous_active_index: previous,
            images,
        })
    }

    /// Builds the record for a freshly provisioned board: every bank is
    /// valid, and the images in the active and previous banks are accepted.
    pub fn to_metadata(&self) -> Result<Metadata> {
        let mut m = Metadata::new(self.num_banks, self.images.len() as u32)
            .map_err(|e| anyhow::anyhow!("bad layout: {e:?}"))?;
        m.active_index = self.active_index;
        m.previous_active_index = self.previous_active_index;

        let good = [
            self.active_index as usize,
            self.previous_active_index as usize,
        ];
        let entries = m.images_mut().iter_mut();
        for (entry, image) in entries.zip(self.images.values()) {
            entry.image_type_uuid = image.image_type_uuid;
            entry.location_uuid = image.location_uuid;
            for (b, uuid) in image.bank_uuids.iter().enumerate() {
                entry.banks[b].image_uuid = *uuid;
                entry.banks[b].accepted = good.contains(&b);
            }
        }

        for b in 0..self.num_banks as usize {
            m.bank_state[b] = if m.bank_fully_accepted(b) {
                BankState::Accepted
            } else {
                BankState::Valid
            };
        }
        Ok(m)
    }
}

/// Converts between the byte order of a GUID's text form and the one EFI
/// uses on media, where the first three groups are little-endian. The
/// conversion is its own inverse.
fn swap_guid_fields(g: &mut Uuid) {
    g[0..4].reverse();
    g[4..6].reverse();
    g[6..8].reverse();
}

/// Parses a GUID in its usual text form into the EFI byte order.
pub fn parse_guid(s: &str) -> Result<Uuid> {
    let groups: Vec<&str> = s.trim().split('-').collect();
    let lens: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    if lens != [8, 4, 4, 4, 12] {
        bail!("malformed GUID {s:?}");
    }

    let mut bytes = [0u8; 16];
    hex::decode_to_slice(groups.concat(), &mut bytes)
        .with_context(|| format!("malformed GUID {s:?}"))?;
    swap_guid_fields(&mut bytes);
    Ok(bytes)
}

/// Inverse of [`parse_guid`].
pub fn format_guid(g: &Uuid) -> String {
    let mut bytes = *g;
    swap_guid_fields(&mut bytes);
    let h = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

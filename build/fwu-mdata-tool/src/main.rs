// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fwu_mdata_tool::layout::{parse_guid, Layout};
use fwu_mdata_tool::{
    apply, describe, generate, inspect, Edit, DEFAULT_SECONDARY_OFFSET,
};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "build and edit FWU metadata images")]
struct Args {
    /// Offset of the secondary metadata copy within the image file.
    #[clap(short, long, default_value_t = DEFAULT_SECONDARY_OFFSET)]
    secondary_offset: u32,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Builds a metadata image from a layout file, in TOML.
    Gen { layout: PathBuf, out: PathBuf },
    /// Decodes and prints both copies of the record in an image.
    Dump { file: PathBuf },
    /// Makes a bank active, keeping the current one as the fallback.
    SetActive { file: PathBuf, bank: u32 },
    /// Accepts an image, named by its type GUID, in the active bank.
    Accept { file: PathBuf, image_type_uuid: String },
    /// Swaps the active and previous banks.
    Revert { file: PathBuf },
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, buf: &[u8]) -> Result<()> {
    std::fs::write(path, buf)
        .with_context(|| format!("writing {}", path.display()))
}

fn edit(path: &Path, secondary: u32, edit: Edit) -> Result<()> {
    let mut buf = read(path)?;
    let m = apply(&mut buf, secondary, &edit)
        .with_context(|| format!("editing {}", path.display()))?;
    write(path, &buf)?;
    print!("{}", describe(&m));
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let secondary = args.secondary_offset;

    match args.cmd {
        Cmd::Gen { layout, out } => {
            let m = Layout::from_file(&layout)?.to_metadata()?;
            write(&out, &generate(&m, secondary)?)?;
            print!("{}", describe(&m));
        }
        Cmd::Dump { file } => {
            let buf = read(&file)?;
            for (which, copy) in inspect(&buf, secondary) {
                match copy {
                    Ok(m) => print!("{which:?}: valid\n{}", describe(&m)),
                    Err(e) => println!("{which:?}: invalid ({e:?})"),
                }
            }
        }
        Cmd::SetActive { file, bank } => {
            edit(&file, secondary, Edit::SetActive(bank))?;
        }
        Cmd::Accept {
            file,
            image_type_uuid,
        } => {
            let uuid = parse_guid(&image_type_uuid)?;
            edit(&file, secondary, Edit::Accept(uuid))?;
        }
        Cmd::Revert { file } => edit(&file, secondary, Edit::Revert)?,
    }

    Ok(())
}

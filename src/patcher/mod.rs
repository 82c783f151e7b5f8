//! Binary Patcher
//!
//! Adds and removes dynamic library load commands in Mach-O executables.
//! Every operation takes the original bytes and returns a new buffer; the
//! input is never modified. Universal binaries are edited slice by slice on a
//! private copy, so a failure in any slice leaves nothing half-patched.
//!
//! The patched buffer carries a stale code signature. Re-signing is left to a
//! [`Signer`](crate::signer::Signer).

mod fat;
mod macho;

use std::ops::Range;

use goblin::mach::cputype::CpuType;
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use scroll::{BE, Pread};

use crate::error::{GraftError, Result};
use macho::SliceLayout;

pub use macho::DylibReference;

/// What the Inspector needs to know about one architecture slice
#[derive(Debug, Clone)]
pub struct SliceSummary {
    pub cputype: CpuType,
    pub filetype: u32,
    pub encrypted: bool,
    pub references: Vec<DylibReference>,
    pub free_space: usize,
}

/// Quick check for a thin or universal Mach-O magic number
pub fn is_mach_o(data: &[u8]) -> bool {
    fat::is_fat(data)
        || data
            .pread_with::<u32>(0, BE)
            .is_ok_and(|magic| matches!(magic, MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64))
}

/// Byte ranges of every architecture slice (the whole buffer for a thin image)
fn slice_ranges(data: &[u8]) -> Result<Vec<Range<usize>>> {
    if fat::is_fat(data) {
        Ok(fat::slices(data)?.into_iter().map(|s| s.range).collect())
    } else {
        Ok(vec![0..data.len()])
    }
}

/// Borrow every architecture slice of a thin or universal image
pub fn slices(data: &[u8]) -> Result<Vec<&[u8]>> {
    Ok(slice_ranges(data)?
        .into_iter()
        .map(|range| &data[range])
        .collect())
}

/// Parse every slice and describe its load command table
pub fn summarize(data: &[u8]) -> Result<Vec<SliceSummary>> {
    slice_ranges(data)?
        .into_iter()
        .map(|range| {
            let slice = &data[range];
            let layout = SliceLayout::parse(slice)?;
            Ok(SliceSummary {
                cputype: layout.cputype,
                filetype: layout.filetype,
                encrypted: layout.encrypted,
                free_space: layout.free_space(slice),
                references: layout.references(),
            })
        })
        .collect()
}

/// Return a copy of `data` with a load command for `path` added to every slice
///
/// Fails with `AlreadyPresent` if any slice already references `path`, and
/// with `CapacityExceeded` if any slice lacks header padding for the command.
pub fn add_module_reference(data: &[u8], path: &str, weak: bool) -> Result<Vec<u8>> {
    let mut patched = data.to_vec();
    for range in slice_ranges(data)? {
        macho::add_reference(&mut patched[range], path, weak)?;
    }
    log::debug!("added load command for {path} (weak: {weak})");
    Ok(patched)
}

/// Return a copy of `data` with every load command for `path` removed
///
/// Slices that never referenced `path` are left alone; `NotPresent` is
/// returned only when no slice references it.
pub fn remove_module_reference(data: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut patched = data.to_vec();
    let mut removed = 0usize;
    for range in slice_ranges(data)? {
        match macho::remove_reference(&mut patched[range], path) {
            Ok(count) => removed += count,
            Err(GraftError::NotPresent { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    if removed == 0 {
        return Err(crate::error::patch::not_present(path));
    }
    log::debug!("removed {removed} load command(s) for {path}");
    Ok(patched)
}

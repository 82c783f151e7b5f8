//! Universal (fat) container handling

use std::ops::Range;

use goblin::mach::cputype::CpuType;
use goblin::mach::fat::{FAT_MAGIC, FatArch, FatHeader, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use scroll::{BE, Pread};

use crate::error::Result;
use crate::error::patch::malformed;

/// Upper bound on architecture entries; anything larger is not a real fat header
const MAX_FAT_ARCHES: u32 = 32;

/// An architecture slice inside a universal binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FatSlice {
    pub cputype: CpuType,
    pub range: Range<usize>,
}

pub(crate) fn is_fat(data: &[u8]) -> bool {
    data.pread_with::<u32>(0, BE).is_ok_and(|magic| magic == FAT_MAGIC)
}

/// List the slices of a fat binary, validating that each lies inside the file
/// and that no two overlap.
pub(crate) fn slices(data: &[u8]) -> Result<Vec<FatSlice>> {
    let header: FatHeader = data.pread_with(0, BE)?;
    if header.magic != FAT_MAGIC {
        return Err(malformed("missing fat magic"));
    }
    if header.nfat_arch == 0 || header.nfat_arch > MAX_FAT_ARCHES {
        return Err(malformed(format!(
            "implausible architecture count {}",
            header.nfat_arch
        )));
    }

    let mut slices: Vec<FatSlice> = Vec::with_capacity(header.nfat_arch as usize);
    for index in 0..header.nfat_arch as usize {
        let arch: FatArch = data.pread_with(SIZEOF_FAT_HEADER + index * SIZEOF_FAT_ARCH, BE)?;
        let start = arch.offset as usize;
        let end = start
            .checked_add(arch.size as usize)
            .filter(|end| *end <= data.len() && start >= SIZEOF_FAT_HEADER)
            .ok_or_else(|| malformed(format!("architecture slice {index} is out of bounds")))?;

        if slices
            .iter()
            .any(|other| start < other.range.end && other.range.start < end)
        {
            return Err(malformed(format!("architecture slice {index} overlaps another")));
        }
        slices.push(FatSlice {
            cputype: arch.cputype,
            range: start..end,
        });
    }
    Ok(slices)
}

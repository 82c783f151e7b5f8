//! Entitlements embedded in an executable's code signature

use std::collections::BTreeMap;

use goblin::mach::header::Header;
use goblin::mach::load_command::LC_CODE_SIGNATURE;
use goblin::mach::parse_magic_and_ctx;
use scroll::ctx::SizeWith;
use scroll::{BE, Pread};

use crate::error::Result;
use crate::error::patch::malformed;
use crate::patcher;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;
const CSSLOT_ENTITLEMENTS: u32 = 5;

/// Read the entitlements dictionary of the first slice of `data`
///
/// Unsigned executables and signatures without an entitlements blob yield an
/// empty map.
pub(crate) fn read_entitlements(data: &[u8]) -> Result<BTreeMap<String, plist::Value>> {
    let slices = patcher::slices(data)?;
    let Some(slice) = slices.first() else {
        return Ok(BTreeMap::new());
    };
    let Some(signature) = code_signature(slice)? else {
        return Ok(BTreeMap::new());
    };
    match entitlements_blob(signature) {
        Some(xml) => Ok(plist::from_bytes(xml)?),
        None => Ok(BTreeMap::new()),
    }
}

/// Locate the `LC_CODE_SIGNATURE` payload of a thin image
fn code_signature(slice: &[u8]) -> Result<Option<&[u8]>> {
    let (_, ctx) = parse_magic_and_ctx(slice, 0)?;
    let ctx = ctx.ok_or_else(|| malformed("not a thin Mach-O image"))?;
    let header: Header = slice.pread_with(0, ctx)?;

    let mut offset = Header::size_with(&ctx);
    for _ in 0..header.ncmds {
        let cmd: u32 = slice.pread_with(offset, ctx.le)?;
        let cmdsize = slice.pread_with::<u32>(offset + 4, ctx.le)? as usize;
        if cmdsize < 8 {
            return Err(malformed("zero-sized load command"));
        }
        if cmd == LC_CODE_SIGNATURE {
            let dataoff = slice.pread_with::<u32>(offset + 8, ctx.le)? as usize;
            let datasize = slice.pread_with::<u32>(offset + 12, ctx.le)? as usize;
            return Ok(slice.get(dataoff..dataoff.saturating_add(datasize)));
        }
        offset += cmdsize;
    }
    Ok(None)
}

/// Find the XML entitlements blob inside an embedded signature SuperBlob
fn entitlements_blob(signature: &[u8]) -> Option<&[u8]> {
    let magic: u32 = signature.pread_with(0, BE).ok()?;
    if magic != CSMAGIC_EMBEDDED_SIGNATURE {
        return None;
    }
    let count = signature.pread_with::<u32>(8, BE).ok()? as usize;
    for index in 0..count {
        let entry = 12 + index * 8;
        let slot: u32 = signature.pread_with(entry, BE).ok()?;
        let blob_offset = signature.pread_with::<u32>(entry + 4, BE).ok()? as usize;
        if slot != CSSLOT_ENTITLEMENTS {
            continue;
        }
        let blob_magic: u32 = signature.pread_with(blob_offset, BE).ok()?;
        let blob_len = signature.pread_with::<u32>(blob_offset + 4, BE).ok()? as usize;
        if blob_magic == CSMAGIC_EMBEDDED_ENTITLEMENTS && blob_len >= 8 {
            return signature.get(blob_offset + 8..blob_offset + blob_len);
        }
    }
    None
}

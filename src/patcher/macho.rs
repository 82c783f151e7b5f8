//! Single-slice Mach-O load command table editing
//!
//! The load command table sits directly after the header and is followed by
//! zeroed padding up to the first byte of segment content. Adding a command
//! consumes padding; removing one compacts the table and gives the bytes back.
//! File size and every other offset in the slice are left untouched.

use goblin::container::{Container, Ctx};
use goblin::mach::cputype::{
    CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86, CPU_TYPE_X86_64, CpuType,
};
use goblin::mach::header::Header;
use goblin::mach::load_command::{
    LC_ENCRYPTION_INFO, LC_ENCRYPTION_INFO_64, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_SEGMENT,
    LC_SEGMENT_64,
};
use goblin::mach::parse_magic_and_ctx;
use scroll::ctx::SizeWith;
use scroll::{Endian, Pread, Pwrite};

use crate::error::patch::{already_present, malformed, not_present};
use crate::error::{GraftError, Result};

/// Architectures whose load command layout we know how to edit
const SUPPORTED_CPU_TYPES: &[CpuType] = &[
    CPU_TYPE_ARM,
    CPU_TYPE_ARM64,
    CPU_TYPE_ARM64_32,
    CPU_TYPE_X86,
    CPU_TYPE_X86_64,
];

/// Fixed part of `dylib_command`: cmd, cmdsize, name offset, timestamp, versions
const DYLIB_COMMAND_SIZE: usize = 24;

/// Field offsets of a segment command and its section records
struct SegmentShape {
    fileoff: usize,
    filesize: usize,
    nsects: usize,
    header_len: usize,
    section_len: usize,
    section_offset: usize,
    section_flags: usize,
}

const SEGMENT_64: SegmentShape = SegmentShape {
    fileoff: 40,
    filesize: 48,
    nsects: 64,
    header_len: 72,
    section_len: 80,
    section_offset: 48,
    section_flags: 64,
};

const SEGMENT_32: SegmentShape = SegmentShape {
    fileoff: 32,
    filesize: 36,
    nsects: 48,
    header_len: 56,
    section_len: 68,
    section_offset: 40,
    section_flags: 56,
};

const SECTION_TYPE_MASK: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;
const S_GB_ZEROFILL: u32 = 0xc;
const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;

/// A dynamic library load command found in a slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibReference {
    pub path: String,
    pub weak: bool,
}

#[derive(Debug, Clone, Copy)]
struct LoadCommand {
    offset: usize,
    cmd: u32,
    size: usize,
}

/// Parsed view of a thin Mach-O load command table
#[derive(Debug)]
pub(crate) struct SliceLayout {
    endian: Endian,
    is_64: bool,
    pub cputype: CpuType,
    pub filetype: u32,
    header_size: usize,
    commands: Vec<LoadCommand>,
    table_end: usize,
    content_start: usize,
    pub encrypted: bool,
    pub dylibs: Vec<(DylibReference, usize)>,
}

impl SliceLayout {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (_, ctx) = parse_magic_and_ctx(data, 0)?;
        let ctx: Ctx = ctx.ok_or_else(|| malformed("not a thin Mach-O image"))?;
        let header: Header = data.pread_with(0, ctx)?;

        if !SUPPORTED_CPU_TYPES.contains(&header.cputype) {
            return Err(GraftError::UnsupportedArchitecture {
                cputype: header.cputype,
            });
        }

        let endian = ctx.le;
        let is_64 = ctx.container == Container::Big;
        let header_size = Header::size_with(&ctx);
        let table_end = header_size
            .checked_add(header.sizeofcmds as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| malformed("load command table extends past end of image"))?;
        // Every command is at least 8 bytes, which bounds ncmds by the table size.
        if header
            .ncmds
            .checked_mul(8)
            .is_none_or(|needed| needed > header.sizeofcmds as usize)
        {
            return Err(malformed(format!(
                "{} load commands cannot fit in {} bytes",
                header.ncmds, header.sizeofcmds
            )));
        }

        let mut layout = SliceLayout {
            endian,
            is_64,
            cputype: header.cputype,
            filetype: header.filetype,
            header_size,
            commands: Vec::with_capacity(header.ncmds),
            table_end,
            content_start: data.len(),
            encrypted: false,
            dylibs: Vec::new(),
        };

        let mut offset = header_size;
        for index in 0..header.ncmds {
            if offset + 8 > table_end {
                return Err(malformed(format!(
                    "load command {index} starts past the end of the table"
                )));
            }
            let cmd: u32 = data.pread_with(offset, endian)?;
            let size = data.pread_with::<u32>(offset + 4, endian)? as usize;
            if size < 8 || size % 4 != 0 || offset + size > table_end {
                return Err(malformed(format!(
                    "load command {index} (cmd {cmd:#x}) has invalid size {size}"
                )));
            }
            let command = LoadCommand { offset, cmd, size };
            layout.inspect_command(data, command)?;
            layout.commands.push(command);
            offset += size;
        }

        if offset != table_end {
            return Err(malformed(format!(
                "sizeofcmds is {} but commands occupy {} bytes",
                header.sizeofcmds,
                offset - header_size
            )));
        }
        if layout.content_start < table_end {
            return Err(malformed("load command table overlaps segment content"));
        }

        Ok(layout)
    }

    fn inspect_command(&mut self, data: &[u8], command: LoadCommand) -> Result<()> {
        let LoadCommand { offset, cmd, size } = command;
        let body = &data[offset..offset + size];
        match cmd {
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB => {
                let path = read_dylib_name(body, self.endian)?;
                self.dylibs.push((
                    DylibReference {
                        path,
                        weak: cmd == LC_LOAD_WEAK_DYLIB,
                    },
                    offset,
                ));
            }
            LC_SEGMENT_64 if self.is_64 => self.inspect_segment(body, &SEGMENT_64)?,
            LC_SEGMENT if !self.is_64 => self.inspect_segment(body, &SEGMENT_32)?,
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                let cryptid: u32 = body.pread_with(16, self.endian)?;
                self.encrypted |= cryptid != 0;
            }
            _ => {}
        }
        Ok(())
    }

    /// Lowers `content_start` to the first file byte used by this segment
    fn inspect_segment(&mut self, body: &[u8], shape: &SegmentShape) -> Result<()> {
        let (fileoff, filesize) = if self.is_64 {
            (
                body.pread_with::<u64>(shape.fileoff, self.endian)?,
                body.pread_with::<u64>(shape.filesize, self.endian)?,
            )
        } else {
            (
                u64::from(body.pread_with::<u32>(shape.fileoff, self.endian)?),
                u64::from(body.pread_with::<u32>(shape.filesize, self.endian)?),
            )
        };
        if fileoff > 0 && filesize > 0 {
            self.lower_content_start(fileoff);
        }

        let nsects = body.pread_with::<u32>(shape.nsects, self.endian)? as usize;
        if shape.header_len + nsects * shape.section_len > body.len() {
            return Err(malformed("segment sections extend past the load command"));
        }
        for index in 0..nsects {
            let base = shape.header_len + index * shape.section_len;
            let flags: u32 = body.pread_with(base + shape.section_flags, self.endian)?;
            if matches!(
                flags & SECTION_TYPE_MASK,
                S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
            ) {
                continue;
            }
            let section_offset: u32 = body.pread_with(base + shape.section_offset, self.endian)?;
            if section_offset > 0 {
                self.lower_content_start(u64::from(section_offset));
            }
        }
        Ok(())
    }

    fn lower_content_start(&mut self, candidate: u64) {
        if let Ok(candidate) = usize::try_from(candidate) {
            self.content_start = self.content_start.min(candidate);
        }
    }

    /// Zeroed bytes available between the table end and the first content byte
    pub fn free_space(&self, data: &[u8]) -> usize {
        data[self.table_end..self.content_start]
            .iter()
            .take_while(|byte| **byte == 0)
            .count()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.dylibs.iter().any(|(dylib, _)| dylib.path == path)
    }

    pub fn references(&self) -> Vec<DylibReference> {
        self.dylibs.iter().map(|(dylib, _)| dylib.clone()).collect()
    }

    fn alignment(&self) -> usize {
        if self.is_64 { 8 } else { 4 }
    }
}

/// Read the NUL-terminated install name of a `dylib_command`
fn read_dylib_name(body: &[u8], endian: Endian) -> Result<String> {
    let name_offset = body.pread_with::<u32>(8, endian)? as usize;
    if name_offset < 12 || name_offset >= body.len() {
        return Err(malformed("dylib command name offset out of range"));
    }
    let raw = &body[name_offset..];
    let end = raw
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| malformed("dylib command name is not terminated"))?;
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| malformed("dylib command name is not valid UTF-8"))
}

/// Append a dylib load command for `path` to the slice in place
pub(crate) fn add_reference(data: &mut [u8], path: &str, weak: bool) -> Result<()> {
    if path.is_empty() || path.contains('\0') {
        return Err(malformed(format!("invalid dylib path {path:?}")));
    }
    let layout = SliceLayout::parse(data)?;
    if layout.contains(path) {
        return Err(already_present(path));
    }

    let align = layout.alignment();
    let needed = (DYLIB_COMMAND_SIZE + path.len() + 1).div_ceil(align) * align;
    let available = layout.free_space(data);
    if needed > available {
        return Err(GraftError::CapacityExceeded { needed, available });
    }

    let endian = layout.endian;
    let at = layout.table_end;
    let command = &mut data[at..at + needed];
    let cmd = if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB };
    command.pwrite_with(cmd, 0, endian)?;
    command.pwrite_with(u32_len(needed)?, 4, endian)?;
    command.pwrite_with(u32_len(DYLIB_COMMAND_SIZE)?, 8, endian)?;
    command.pwrite_with(2u32, 12, endian)?;
    command.pwrite_with(0x0001_0000u32, 16, endian)?;
    command.pwrite_with(0x0001_0000u32, 20, endian)?;
    command[DYLIB_COMMAND_SIZE..DYLIB_COMMAND_SIZE + path.len()].copy_from_slice(path.as_bytes());

    let ncmds = u32_len(layout.commands.len() + 1)?;
    let sizeofcmds = u32_len(layout.table_end - layout.header_size + needed)?;
    data.pwrite_with(ncmds, 16, endian)?;
    data.pwrite_with(sizeofcmds, 20, endian)?;
    Ok(())
}

/// Delete every dylib load command naming `path` and compact the table in place
///
/// Returns how many commands were removed.
pub(crate) fn remove_reference(data: &mut [u8], path: &str) -> Result<usize> {
    let layout = SliceLayout::parse(data)?;
    let doomed: Vec<usize> = layout
        .dylibs
        .iter()
        .filter(|(dylib, _)| dylib.path == path)
        .map(|(_, offset)| *offset)
        .collect();
    if doomed.is_empty() {
        return Err(not_present(path));
    }

    let mut table = Vec::with_capacity(layout.table_end - layout.header_size);
    let mut kept = 0usize;
    for command in &layout.commands {
        if doomed.contains(&command.offset) {
            continue;
        }
        table.extend_from_slice(&data[command.offset..command.offset + command.size]);
        kept += 1;
    }

    let start = layout.header_size;
    data[start..start + table.len()].copy_from_slice(&table);
    data[start + table.len()..layout.table_end].fill(0);

    data.pwrite_with(u32_len(kept)?, 16, layout.endian)?;
    data.pwrite_with(u32_len(table.len())?, 20, layout.endian)?;
    Ok(doomed.len())
}

fn u32_len(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed("load command table exceeds 4 GiB"))
}

//! Test fixtures for building synthetic Mach-O executables and app bundles.
//!
//! ```ignore
//! use crate::test_fixtures::{MachOBuilder, fat_binary, create_app};
//!
//! let thin = MachOBuilder::arm64().dylib("/usr/lib/libc++.1.dylib").build();
//! let fat = fat_binary(&[MachOBuilder::armv7().build(), thin.clone()]);
//! let (temp, app) = create_app("com.example.demo", "Demo", &fat);
//! ```

#![allow(clippy::expect_used, clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_EXECUTE: u32 = 0x2;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_POWERPC: u32 = 18;

const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
const LC_ENCRYPTION_INFO: u32 = 0x21;
const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
const LC_CODE_SIGNATURE: u32 = 0x1d;

/// Builder for a minimal thin Mach-O executable
///
/// The produced layout is: header, one `__TEXT` segment with one `__text`
/// section, the dylib commands, an optional encryption command, zeroed header
/// padding, then the section contents.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    is_64: bool,
    cputype: u32,
    dylibs: Vec<(String, bool)>,
    padding: usize,
    cryptid: Option<u32>,
    entitlements: Option<String>,
    code: Vec<u8>,
}

impl MachOBuilder {
    pub fn arm64() -> Self {
        Self {
            is_64: true,
            cputype: CPU_TYPE_ARM64,
            dylibs: vec![("/usr/lib/libSystem.B.dylib".to_string(), false)],
            padding: 1024,
            cryptid: None,
            entitlements: None,
            code: vec![0xc0, 0x03, 0x5f, 0xd6].repeat(16),
        }
    }

    pub fn armv7() -> Self {
        Self {
            is_64: false,
            cputype: CPU_TYPE_ARM,
            ..Self::arm64()
        }
    }

    pub fn cputype(mut self, cputype: u32) -> Self {
        self.cputype = cputype;
        self
    }

    pub fn dylib(mut self, path: &str) -> Self {
        self.dylibs.push((path.to_string(), false));
        self
    }

    pub fn weak_dylib(mut self, path: &str) -> Self {
        self.dylibs.push((path.to_string(), true));
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn encrypted(mut self, cryptid: u32) -> Self {
        self.cryptid = Some(cryptid);
        self
    }

    /// Embed a code signature carrying `xml` as its entitlements blob
    pub fn entitlements(mut self, xml: &str) -> Self {
        self.entitlements = Some(xml.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let header_size = if self.is_64 { 32 } else { 28 };
        let segment_size = if self.is_64 { 72 + 80 } else { 56 + 68 };

        let mut commands: Vec<Vec<u8>> = Vec::new();
        for (path, weak) in &self.dylibs {
            commands.push(self.dylib_command(path, *weak));
        }
        if let Some(cryptid) = self.cryptid {
            commands.push(self.encryption_command(cryptid));
        }

        let signature = self.entitlements.as_deref().map(signature_blob);
        let signature_cmd_size = if signature.is_some() { 16 } else { 0 };

        let sizeofcmds =
            segment_size + commands.iter().map(Vec::len).sum::<usize>() + signature_cmd_size;
        let code_offset = header_size + sizeofcmds + self.padding;
        let total = code_offset + self.code.len();

        if let Some(blob) = &signature {
            let mut cmd = Vec::new();
            put32(&mut cmd, LC_CODE_SIGNATURE);
            put32(&mut cmd, 16);
            put32(&mut cmd, u32::try_from(total).expect("dataoff"));
            put32(&mut cmd, u32::try_from(blob.len()).expect("datasize"));
            commands.push(cmd);
        }

        let mut out = Vec::with_capacity(total);
        put32(&mut out, if self.is_64 { MH_MAGIC_64 } else { MH_MAGIC });
        put32(&mut out, self.cputype);
        put32(&mut out, 0);
        put32(&mut out, MH_EXECUTE);
        put32(&mut out, u32::try_from(commands.len() + 1).expect("ncmds"));
        put32(&mut out, u32::try_from(sizeofcmds).expect("sizeofcmds"));
        put32(&mut out, 0);
        if self.is_64 {
            put32(&mut out, 0);
        }

        out.extend(self.text_segment(total, code_offset));
        for command in commands {
            out.extend(command);
        }
        out.resize(code_offset, 0);
        out.extend(&self.code);
        if let Some(blob) = signature {
            out.extend(blob);
        }
        out
    }

    fn text_segment(&self, total: usize, code_offset: usize) -> Vec<u8> {
        let mut seg = Vec::new();
        let total = u32::try_from(total).expect("total");
        let code_offset = u32::try_from(code_offset).expect("offset");
        let code_len = u32::try_from(self.code.len()).expect("code");
        if self.is_64 {
            put32(&mut seg, LC_SEGMENT_64);
            put32(&mut seg, 72 + 80);
            seg.extend(name16("__TEXT"));
            put64(&mut seg, 0x1_0000_0000);
            put64(&mut seg, u64::from(total));
            put64(&mut seg, 0);
            put64(&mut seg, u64::from(total));
            put32(&mut seg, 5);
            put32(&mut seg, 5);
            put32(&mut seg, 1);
            put32(&mut seg, 0);
            seg.extend(name16("__text"));
            seg.extend(name16("__TEXT"));
            put64(&mut seg, 0x1_0000_0000 + u64::from(code_offset));
            put64(&mut seg, u64::from(code_len));
            put32(&mut seg, code_offset);
            put32(&mut seg, 2);
            put32(&mut seg, 0);
            put32(&mut seg, 0);
            put32(&mut seg, 0x8000_0400);
            put32(&mut seg, 0);
            put32(&mut seg, 0);
            put32(&mut seg, 0);
        } else {
            put32(&mut seg, LC_SEGMENT);
            put32(&mut seg, 56 + 68);
            seg.extend(name16("__TEXT"));
            put32(&mut seg, 0x4000);
            put32(&mut seg, total);
            put32(&mut seg, 0);
            put32(&mut seg, total);
            put32(&mut seg, 5);
            put32(&mut seg, 5);
            put32(&mut seg, 1);
            put32(&mut seg, 0);
            seg.extend(name16("__text"));
            seg.extend(name16("__TEXT"));
            put32(&mut seg, 0x4000 + code_offset);
            put32(&mut seg, code_len);
            put32(&mut seg, code_offset);
            put32(&mut seg, 2);
            put32(&mut seg, 0);
            put32(&mut seg, 0);
            put32(&mut seg, 0x8000_0400);
            put32(&mut seg, 0);
            put32(&mut seg, 0);
        }
        seg
    }

    fn dylib_command(&self, path: &str, weak: bool) -> Vec<u8> {
        let align = if self.is_64 { 8 } else { 4 };
        let size = (24 + path.len() + 1).div_ceil(align) * align;
        let mut cmd = Vec::with_capacity(size);
        put32(&mut cmd, if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB });
        put32(&mut cmd, u32::try_from(size).expect("cmdsize"));
        put32(&mut cmd, 24);
        put32(&mut cmd, 2);
        put32(&mut cmd, 0x0001_0000);
        put32(&mut cmd, 0x0001_0000);
        cmd.extend(path.as_bytes());
        cmd.resize(size, 0);
        cmd
    }

    fn encryption_command(&self, cryptid: u32) -> Vec<u8> {
        let mut cmd = Vec::new();
        put32(
            &mut cmd,
            if self.is_64 { LC_ENCRYPTION_INFO_64 } else { LC_ENCRYPTION_INFO },
        );
        put32(&mut cmd, if self.is_64 { 24 } else { 20 });
        put32(&mut cmd, 0x4000);
        put32(&mut cmd, 0x1000);
        put32(&mut cmd, cryptid);
        if self.is_64 {
            put32(&mut cmd, 0);
        }
        cmd
    }
}

/// Wrap thin slices in a universal (fat) container, each slice aligned to 4 KiB
pub fn fat_binary(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: usize = 0x1000;
    let mut out = Vec::new();
    out.extend(0xcafe_babe_u32.to_be_bytes());
    out.extend(u32::try_from(slices.len()).expect("nfat").to_be_bytes());

    let mut offset = ALIGN;
    let mut placed = Vec::new();
    for slice in slices {
        let cputype = u32::from_le_bytes(slice[4..8].try_into().expect("cputype"));
        out.extend(cputype.to_be_bytes());
        out.extend(0u32.to_be_bytes());
        out.extend(u32::try_from(offset).expect("offset").to_be_bytes());
        out.extend(u32::try_from(slice.len()).expect("size").to_be_bytes());
        out.extend(12u32.to_be_bytes());
        placed.push(offset);
        offset = (offset + slice.len()).div_ceil(ALIGN) * ALIGN;
    }

    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend(slice);
    }
    out
}

/// Create a user application bundle laid out like `<root>/<uuid>/<Name>.app`.
///
/// Returns the temp dir (the applications root) and the `.app` path.
pub fn create_app(id: &str, name: &str, executable: &[u8]) -> (TempDir, PathBuf) {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let app = write_app(temp.path(), "6B1A7C2E-0000-4000-8000-000000000001", id, name, executable);
    (temp, app)
}

/// Write an application bundle under `<root>/<container>/<Name>.app`
pub fn write_app(root: &Path, container: &str, id: &str, name: &str, executable: &[u8]) -> PathBuf {
    let app = root.join(container).join(format!("{name}.app"));
    std::fs::create_dir_all(&app).expect("Failed to create bundle");
    let info = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>{id}</string>
    <key>CFBundleExecutable</key>
    <string>{name}</string>
    <key>CFBundleDisplayName</key>
    <string>{name}</string>
    <key>CFBundleShortVersionString</key>
    <string>1.0</string>
</dict>
</plist>
"#
    );
    std::fs::write(app.join("Info.plist"), info).expect("Failed to write Info.plist");
    std::fs::write(app.join(name), executable).expect("Failed to write executable");
    app
}

/// Create a standalone dylib module file named `file_name` inside `dir`
pub fn write_dylib(dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    let body = MachOBuilder::arm64().build();
    std::fs::write(&path, body).expect("Failed to write dylib");
    path
}

/// Embedded signature SuperBlob holding a single entitlements blob
fn signature_blob(xml: &str) -> Vec<u8> {
    let blob_len = 8 + xml.len();
    let total = 12 + 8 + blob_len;
    let mut out = Vec::with_capacity(total);
    out.extend(0xfade_0cc0_u32.to_be_bytes());
    out.extend(u32::try_from(total).expect("len").to_be_bytes());
    out.extend(1u32.to_be_bytes());
    out.extend(5u32.to_be_bytes());
    out.extend(20u32.to_be_bytes());
    out.extend(0xfade_7171_u32.to_be_bytes());
    out.extend(u32::try_from(blob_len).expect("len").to_be_bytes());
    out.extend(xml.as_bytes());
    out
}

fn put32(out: &mut Vec<u8>, value: u32) {
    out.extend(value.to_le_bytes());
}

fn put64(out: &mut Vec<u8>, value: u64) {
    out.extend(value.to_le_bytes());
}

fn name16(name: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Write a `<Name>.metadata.plist` next to `app` with the given boolean flags
pub fn write_flags(app: &Path, flags: &[(&str, bool)]) {
    let stem = app.file_stem().expect("bundle stem").to_string_lossy();
    let entries: String = flags
        .iter()
        .map(|(key, value)| format!("    <key>{key}</key>\n    <{value}/>\n"))
        .collect();
    let plist = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n{entries}</dict>\n</plist>\n"
    );
    let path = app
        .parent()
        .expect("bundle parent")
        .join(format!("{stem}.metadata.plist"));
    std::fs::write(path, plist).expect("Failed to write metadata plist");
}

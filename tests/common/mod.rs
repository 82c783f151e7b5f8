//! Common test utilities for Graft integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

pub const APP_ID: &str = "com.example.demo";
pub const APP_NAME: &str = "Demo";

const CONTAINER: &str = "0B7E31A4-1111-4000-8000-00000000CAFE";

/// A fake device: application roots plus a state directory, all temporary
pub struct TestDevice {
    pub temp: TempDir,
    pub apps_root: PathBuf,
    pub system_apps_root: PathBuf,
    pub state_dir: PathBuf,
    pub modules: PathBuf,
}

impl TestDevice {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let root = temp.path().to_path_buf();
        let device = Self {
            apps_root: root.join("apps"),
            system_apps_root: root.join("system"),
            state_dir: root.join("state"),
            modules: root.join("modules"),
            temp,
        };
        for dir in [&device.apps_root, &device.system_apps_root, &device.modules] {
            std::fs::create_dir_all(dir).expect("Failed to create directory");
        }
        device
    }

    /// Install the demo application with a thin arm64 executable
    pub fn install_demo(&self) -> PathBuf {
        self.install_app(APP_ID, APP_NAME, &thin_executable(1024))
    }

    pub fn install_app(&self, id: &str, name: &str, executable: &[u8]) -> PathBuf {
        let app = self
            .apps_root
            .join(CONTAINER)
            .join(format!("{name}.app"));
        std::fs::create_dir_all(&app).expect("Failed to create bundle");
        let info = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>{id}</string>
    <key>CFBundleExecutable</key>
    <string>{name}</string>
    <key>CFBundleShortVersionString</key>
    <string>2.1</string>
</dict>
</plist>
"#
        );
        std::fs::write(app.join("Info.plist"), info).expect("Failed to write Info.plist");
        std::fs::write(app.join(name), executable).expect("Failed to write executable");
        app
    }

    pub fn executable(&self) -> PathBuf {
        self.apps_root
            .join(CONTAINER)
            .join(format!("{APP_NAME}.app"))
            .join(APP_NAME)
    }

    pub fn bundle(&self) -> PathBuf {
        self.apps_root.join(CONTAINER).join(format!("{APP_NAME}.app"))
    }

    /// A loadable dylib module ready to inject
    pub fn dylib(&self, file_name: &str) -> PathBuf {
        let path = self.modules.join(file_name);
        std::fs::write(&path, thin_executable(64)).expect("Failed to write dylib");
        path
    }

    /// A resource bundle module (no load command)
    pub fn resource_bundle(&self, file_name: &str) -> PathBuf {
        let path = self.modules.join(file_name);
        std::fs::create_dir_all(&path).expect("Failed to create bundle module");
        std::fs::write(path.join("strings.json"), "{}").expect("Failed to write resource");
        path
    }

    pub fn manifest(&self) -> PathBuf {
        self.state_dir.join("manifests").join(format!("{APP_ID}.json"))
    }

    /// Persisted copies of modules injected into the demo application
    pub fn persisted(&self) -> PathBuf {
        self.state_dir.join("persistent").join(APP_ID)
    }

    pub fn transactions(&self) -> PathBuf {
        self.state_dir.join("transactions")
    }

    pub fn write_settings(&self, yaml: &str) {
        std::fs::create_dir_all(&self.state_dir).expect("Failed to create state dir");
        std::fs::write(self.state_dir.join("graft.yaml"), yaml).expect("Failed to write settings");
    }

    /// The real graft binary pointed at this device
    pub fn graft(&self) -> Command {
        let mut cmd = graft_cmd();
        cmd.env("GRAFT_APPS_ROOT", &self.apps_root)
            .env("GRAFT_SYSTEM_APPS_ROOT", &self.system_apps_root)
            .env("GRAFT_STATE_DIR", &self.state_dir)
            .env_remove("GRAFT_CONFIG")
            .env_remove("RUST_LOG");
        cmd
    }
}

impl Default for TestDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(deprecated)]
pub fn graft_cmd() -> Command {
    Command::cargo_bin("graft").expect("graft binary")
}

/// Load command paths of a thin little-endian Mach-O
pub fn dylib_references(binary: &[u8]) -> Vec<String> {
    let ncmds = read32(binary, 16) as usize;
    let mut offset = 32;
    let mut out = Vec::new();
    for _ in 0..ncmds {
        let cmd = read32(binary, offset);
        let size = read32(binary, offset + 4) as usize;
        if cmd == LC_LOAD_DYLIB || cmd == LC_LOAD_WEAK_DYLIB {
            let name_at = offset + read32(binary, offset + 8) as usize;
            let raw = &binary[name_at..offset + size];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            out.push(String::from_utf8_lossy(&raw[..end]).into_owned());
        }
        offset += size;
    }
    out
}

pub fn file_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("Failed to read file")
}

const LC_SEGMENT_64: u32 = 0x19;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;

/// Minimal arm64 executable linking libSystem, with `padding` spare header bytes
pub fn thin_executable(padding: usize) -> Vec<u8> {
    let dylib = "/usr/lib/libSystem.B.dylib";
    let dylib_size = (24 + dylib.len() + 1).div_ceil(8) * 8;
    let segment_size = 72 + 80;
    let sizeofcmds = segment_size + dylib_size;
    let code = [0xc0, 0x03, 0x5f, 0xd6].repeat(8);
    let code_offset = 32 + sizeofcmds + padding;
    let total = (code_offset + code.len()) as u64;

    let mut out = Vec::new();
    put32(&mut out, 0xfeed_facf);
    put32(&mut out, 0x0100_000c);
    put32(&mut out, 0);
    put32(&mut out, 0x2);
    put32(&mut out, 2);
    put32(&mut out, sizeofcmds as u32);
    put32(&mut out, 0);
    put32(&mut out, 0);

    put32(&mut out, LC_SEGMENT_64);
    put32(&mut out, segment_size as u32);
    out.extend(name16("__TEXT"));
    out.extend(0x1_0000_0000u64.to_le_bytes());
    out.extend(total.to_le_bytes());
    out.extend(0u64.to_le_bytes());
    out.extend(total.to_le_bytes());
    for value in [5, 5, 1, 0] {
        put32(&mut out, value);
    }
    out.extend(name16("__text"));
    out.extend(name16("__TEXT"));
    out.extend((0x1_0000_0000u64 + code_offset as u64).to_le_bytes());
    out.extend((code.len() as u64).to_le_bytes());
    for value in [code_offset as u32, 2, 0, 0, 0x8000_0400, 0, 0, 0] {
        put32(&mut out, value);
    }

    let start = out.len();
    put32(&mut out, LC_LOAD_DYLIB);
    put32(&mut out, dylib_size as u32);
    for value in [24, 2, 0x0001_0000, 0x0001_0000] {
        put32(&mut out, value);
    }
    out.extend(dylib.as_bytes());
    out.resize(start + dylib_size, 0);

    out.resize(code_offset, 0);
    out.extend(code);
    out
}

fn read32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().expect("u32"))
}

fn put32(out: &mut Vec<u8>, value: u32) {
    out.extend(value.to_le_bytes());
}

fn name16(name: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thin_executable_lists_libsystem() {
        let binary = thin_executable(256);
        assert_eq!(dylib_references(&binary), vec!["/usr/lib/libSystem.B.dylib"]);
    }

    #[test]
    fn test_device_layout() {
        let device = TestDevice::new();
        device.install_demo();
        assert!(device.executable().is_file());
        assert!(device.bundle().join("Info.plist").is_file());
    }
}

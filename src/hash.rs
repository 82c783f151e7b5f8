//! BLAKE3 content hashes for staged modules

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use blake3::Hasher;
use walkdir::WalkDir;

use crate::error::{GraftError, Result, fs::read_failed};
use crate::store::MARKER_FILE_NAME;

/// Hash prefix for BLAKE3 hashes
pub const HASH_PREFIX: &str = "blake3:";

/// Hash a module on disk, whether it is a single file or a bundle directory
pub fn hash_module(path: &Path) -> Result<String> {
    if path.is_dir() {
        hash_directory(path)
    } else {
        hash_file(path)
    }
}

/// Calculate BLAKE3 hash of a file
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    feed_file(&mut hasher, path)?;
    Ok(format!("{}{}", HASH_PREFIX, hasher.finalize().to_hex()))
}

/// Calculate BLAKE3 hash of a directory's contents
///
/// Files are visited in sorted relative-path order. The ownership marker is
/// excluded so a staged bundle hashes the same as its source.
pub fn hash_directory(path: &Path) -> Result<String> {
    if !path.is_dir() {
        return Err(GraftError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let mut hasher = Hasher::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| GraftError::FileReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() || entry.file_name() == MARKER_FILE_NAME {
            continue;
        }
        files.push(entry.into_path());
    }

    for file_path in files {
        let relative_path = file_path
            .strip_prefix(path)
            .unwrap_or(&file_path)
            .to_string_lossy()
            .replace('\\', "/");
        hasher.update(relative_path.as_bytes());
        hasher.update(b"\0");
        feed_file(&mut hasher, &file_path)?;
        hasher.update(b"\0");
    }

    Ok(format!("{}{}", HASH_PREFIX, hasher.finalize().to_hex()))
}

fn feed_file(hasher: &mut Hasher, path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| read_failed(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| read_failed(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(())
}

/// Verify a hash matches the expected value
pub fn verify_hash(expected: &str, actual: &str) -> bool {
    let normalize = |h: &str| h.strip_prefix(HASH_PREFIX).unwrap_or(h).to_string();
    normalize(expected) == normalize(actual)
}

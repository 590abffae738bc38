//! Content hashes used for idempotency and merge collision detection.

use crate::manifest::Manifest;
use blake3::Hasher;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const SEP: u8 = 0x1f;
const CHECKSUM_PREFIX: &str = "sha256:";

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// `sha256:<hex>` of a file's content, streamed.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{}{:x}", CHECKSUM_PREFIX, hasher.finalize()))
}

/// `sha256:<hex>` of an in-memory buffer.
pub fn bytes_checksum(bytes: &[u8]) -> String {
    format!("{}{:x}", CHECKSUM_PREFIX, Sha256::digest(bytes))
}

/// Stable fingerprint of a unit's active content.
///
/// Components:
/// - unit_id
/// - (current_name, checksum) of every active file, sorted by name
///
/// Two sources with the same fingerprint are the same unit; the Merger uses
/// this to tell an already-merged unit from a colliding one.
pub fn unit_fingerprint(manifest: &Manifest) -> String {
    let mut files: Vec<(&str, &str)> = manifest
        .active_files()
        .map(|f| (f.current_name.as_str(), f.checksum.as_str()))
        .collect();
    files.sort_unstable();

    let mut parts: Vec<&str> = Vec::with_capacity(1 + files.len() * 2);
    parts.push(manifest.unit_id.as_str());
    for (name, checksum) in files {
        parts.push(name);
        parts.push(checksum);
    }
    hash_parts(&parts)
}

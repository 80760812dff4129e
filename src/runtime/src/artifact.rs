//! Opaque file-backed artifacts.
//!
//! Hardware models, machine identifiers, EFI variable stores and save files
//! are binary payloads owned by the hypervisor. They are written and read
//! back byte-for-byte; nothing here interprets them.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use vmbridge_core::error::Result;

/// Write `bytes` to `path` atomically (temp file in the same directory, then rename).
pub fn store(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    tracing::trace!(path = %path.display(), len = bytes.len(), "stored artifact");
    Ok(())
}

/// Read an artifact back exactly as stored.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// SHA-256 of a payload, hex encoded.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

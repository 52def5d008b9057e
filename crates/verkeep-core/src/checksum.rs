use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub file_count: u64,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    feed_reader(&mut hasher, file)
        .with_context(|| format!("failed to read for hashing: {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<()> {
    let actual = sha256_file_hex(path)?;
    if actual.eq_ignore_ascii_case(expected_hex.trim()) {
        return Ok(());
    }
    Err(anyhow!(
        "sha256 mismatch for {}: expected {}, got {}",
        path.display(),
        expected_hex.trim(),
        actual
    ))
}

/// Digest over every entry below `root`: relative paths in sorted order, file
/// contents, and symlink targets. Directory metadata is not included.
pub fn tree_sha256(root: &Path) -> Result<TreeDigest> {
    let mut entries = Vec::new();
    collect_entries(root, root, &mut entries)?;
    entries.sort();

    let mut hasher = Sha256::new();
    let mut file_count = 0_u64;
    for rel in &entries {
        let path = root.join(rel);
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            hasher.update(b"link:");
            hasher.update(target.to_string_lossy().as_bytes());
        } else {
            let file = fs::File::open(&path)
                .with_context(|| format!("failed to open for hashing: {}", path.display()))?;
            feed_reader(&mut hasher, file)
                .with_context(|| format!("failed to read for hashing: {}", path.display()))?;
        }
        hasher.update([0]);
        file_count += 1;
    }

    Ok(TreeDigest {
        file_count,
        sha256: hex::encode(hasher.finalize()),
    })
}

fn collect_entries(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            collect_entries(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", path.display()))?;
        out.push(rel.to_path_buf());
    }
    Ok(())
}

fn feed_reader(hasher: &mut Sha256, mut reader: impl Read) -> io::Result<()> {
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buf[..read]);
    }
}

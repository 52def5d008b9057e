use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}

/// `<parent>/.<file name>.<tag>-<pid>`, a sibling on the same filesystem so a
/// later rename stays atomic.
pub(crate) fn sibling_path(path: &Path, tag: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    Ok(parent.join(format!(".{name}.{tag}-{}", std::process::id())))
}

pub(crate) fn make_tmp_dir(base: &Path, prefix: &str) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .subsec_nanos();
    let dir = base.join(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        current_unix_timestamp()?,
        nanos
    ));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating tmp dir: {}", dir.display()))?;
    Ok(dir)
}

/// Write-to-temp, fsync, then rename over `path`; a crash leaves either the old
/// or the new file, never a torn one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp_path = sibling_path(path, "tmp")?;
    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            )
        })
    })();

    if write_result.is_err() {
        let _ = remove_file_if_exists(&tmp_path);
    }
    write_result
}

pub(crate) fn move_dir_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create install parent: {}", parent.display()))?;
    }

    match fs::rename(src, dst) {
        Ok(_) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            fs::remove_dir_all(src)
                .with_context(|| format!("failed to cleanup staging dir: {}", src.display()))?;
            Ok(())
        }
    }
}

pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat source path: {}", src.display()))?;

    if metadata.is_dir() {
        fs::create_dir_all(dst)
            .with_context(|| format!("failed to create directory: {}", dst.display()))?;
        for entry in
            fs::read_dir(src).with_context(|| format!("failed to read directory: {}", src.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", src.display()))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, metadata.permissions())
            .with_context(|| format!("failed to set permissions on {}", dst.display()))?;
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink: {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to copy symlink {} -> {}",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(());
    }

    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

pub(crate) fn copy_with_strip(src_root: &Path, dst_root: &Path, strip_components: usize) -> Result<()> {
    let mut copied_any = false;
    copy_with_strip_recursive(
        src_root,
        src_root,
        dst_root,
        strip_components,
        &mut copied_any,
    )?;
    if !copied_any {
        return Err(anyhow!(
            "no files copied during extraction; strip_components={} may be too large",
            strip_components
        ));
    }
    Ok(())
}

fn copy_with_strip_recursive(
    src_root: &Path,
    current: &Path,
    dst_root: &Path,
    strip_components: usize,
    copied_any: &mut bool,
) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if metadata.is_dir() {
            copy_with_strip_recursive(src_root, &path, dst_root, strip_components, copied_any)?;
            continue;
        }

        let rel = path
            .strip_prefix(src_root)
            .with_context(|| format!("failed to relativize {}", path.display()))?;
        let Some(stripped_rel) = strip_rel_components(rel, strip_components) else {
            continue;
        };

        copy_tree(&path, &dst_root.join(&stripped_rel))?;
        *copied_any = true;
    }

    Ok(())
}

pub(crate) fn strip_rel_components(path: &Path, strip_components: usize) -> Option<PathBuf> {
    let components: Vec<_> = path.components().collect();
    if components.len() <= strip_components {
        return None;
    }
    let mut stripped = PathBuf::new();
    for component in &components[strip_components..] {
        stripped.push(component.as_os_str());
    }
    Some(stripped)
}

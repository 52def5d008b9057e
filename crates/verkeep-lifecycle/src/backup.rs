use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use verkeep_core::{tree_sha256, ComponentId};

use crate::error::LifecycleError;
use crate::fs_utils::{
    copy_tree, current_unix_timestamp, remove_dir_if_exists, sibling_path, write_atomic,
};

const MANIFEST_FILE: &str = "backup.json";
const TREE_DIR: &str = "tree";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub component: ComponentId,
    pub version: String,
    pub source_path: PathBuf,
    pub created_at_unix: u64,
    pub file_count: u64,
    pub tree_sha256: String,
}

/// Version-keyed snapshots of install roots: `<root>/<component>/<version>/`
/// holding `tree/` and `backup.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn component_dir(&self, component: &ComponentId) -> PathBuf {
        self.root.join(component.as_str())
    }

    fn entry_dir(&self, component: &ComponentId, version: &str) -> PathBuf {
        self.component_dir(component).join(version)
    }

    pub fn exists(&self, component: &ComponentId, version: &str) -> bool {
        let entry = self.entry_dir(component, version);
        entry.join(MANIFEST_FILE).is_file() && entry.join(TREE_DIR).is_dir()
    }

    pub fn manifest(
        &self,
        component: &ComponentId,
        version: &str,
    ) -> Result<Option<BackupManifest>, LifecycleError> {
        let path = self.entry_dir(component, version).join(MANIFEST_FILE);
        read_manifest(&path).map_err(|err| backup_io(component, version, err))
    }

    /// Snapshots `source` as the backup of `(component, version)`, replacing any
    /// earlier snapshot of the same key only once the new one is complete.
    pub fn save(
        &self,
        component: &ComponentId,
        version: &str,
        source: &Path,
    ) -> Result<BackupManifest, LifecycleError> {
        self.save_inner(component, version, source)
            .map_err(|err| backup_io(component, version, err))
    }

    fn save_inner(
        &self,
        component: &ComponentId,
        version: &str,
        source: &Path,
    ) -> Result<BackupManifest> {
        if !source.is_dir() {
            return Err(anyhow!(
                "install root does not exist or is not a directory: {}",
                source.display()
            ));
        }

        let entry = self.entry_dir(component, version);
        let staging = sibling_path(&entry, "staging")?;
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let staged = (|| -> Result<BackupManifest> {
            let tree = staging.join(TREE_DIR);
            copy_tree(source, &tree)?;
            let digest = tree_sha256(&tree)?;
            let manifest = BackupManifest {
                component: component.clone(),
                version: version.to_string(),
                source_path: source.to_path_buf(),
                created_at_unix: current_unix_timestamp()?,
                file_count: digest.file_count,
                tree_sha256: digest.sha256,
            };
            let content = serde_json::to_string_pretty(&manifest)
                .context("failed to serialize backup manifest")?;
            write_atomic(&staging.join(MANIFEST_FILE), content.as_bytes())?;
            Ok(manifest)
        })();

        let manifest = match staged {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = remove_dir_if_exists(&staging);
                return Err(err);
            }
        };

        let retired = sibling_path(&entry, "retired")?;
        if entry.exists() {
            remove_dir_if_exists(&retired)?;
            fs::rename(&entry, &retired).with_context(|| {
                format!("failed to retire previous backup {}", entry.display())
            })?;
        }
        if let Err(err) = fs::rename(&staging, &entry) {
            if retired.exists() {
                let _ = fs::rename(&retired, &entry);
            }
            let _ = remove_dir_if_exists(&staging);
            return Err(err)
                .with_context(|| format!("failed to move backup into place: {}", entry.display()));
        }
        discard_leftover(&retired);

        info!(
            component = %component,
            version,
            files = manifest.file_count,
            "saved backup"
        );
        Ok(manifest)
    }

    /// Replaces `dest` with the backup of `(component, version)`. The backup is
    /// verified and staged next to `dest` before the old contents are removed.
    pub fn restore(
        &self,
        component: &ComponentId,
        version: &str,
        dest: &Path,
    ) -> Result<(), LifecycleError> {
        if !self.exists(component, version) {
            return Err(LifecycleError::BackupNotFound {
                component: component.clone(),
                version: version.to_string(),
            });
        }
        self.restore_inner(component, version, dest)
            .map_err(|err| backup_io(component, version, err))
    }

    fn restore_inner(&self, component: &ComponentId, version: &str, dest: &Path) -> Result<()> {
        let entry = self.entry_dir(component, version);
        let tree = entry.join(TREE_DIR);
        let manifest = read_manifest(&entry.join(MANIFEST_FILE))?
            .ok_or_else(|| anyhow!("backup manifest disappeared: {}", entry.display()))?;
        let digest = tree_sha256(&tree)?;
        if digest.sha256 != manifest.tree_sha256 {
            return Err(anyhow!(
                "backup content does not match its manifest (expected {}, found {})",
                manifest.tree_sha256,
                digest.sha256
            ));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let staged = sibling_path(dest, "restore")?;
        remove_dir_if_exists(&staged)?;
        if let Err(err) = copy_tree(&tree, &staged) {
            let _ = remove_dir_if_exists(&staged);
            return Err(err);
        }

        let replaced = sibling_path(dest, "replaced")?;
        if dest.exists() {
            remove_dir_if_exists(&replaced)?;
            fs::rename(dest, &replaced)
                .with_context(|| format!("failed to move aside {}", dest.display()))?;
        }
        if let Err(err) = fs::rename(&staged, dest) {
            if replaced.exists() {
                let _ = fs::rename(&replaced, dest);
            }
            let _ = remove_dir_if_exists(&staged);
            return Err(err)
                .with_context(|| format!("failed to move restored tree to {}", dest.display()));
        }
        discard_leftover(&replaced);

        info!(component = %component, version, dest = %dest.display(), "restored backup");
        Ok(())
    }

    /// Backups of `component`, oldest first.
    pub fn list(&self, component: &ComponentId) -> Result<Vec<BackupManifest>, LifecycleError> {
        let mut manifests = Vec::new();
        for version in self
            .versions(component)
            .map_err(|err| backup_io(component, "*", err))?
        {
            if let Some(manifest) = self.manifest(component, &version)? {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| {
            a.created_at_unix
                .cmp(&b.created_at_unix)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(manifests)
    }

    /// Removes every backup of `component` whose version is not in `keep`.
    pub fn prune(
        &self,
        component: &ComponentId,
        keep: &BTreeSet<String>,
    ) -> Result<Vec<String>, LifecycleError> {
        let mut removed = Vec::new();
        for version in self
            .versions(component)
            .map_err(|err| backup_io(component, "*", err))?
        {
            if keep.contains(&version) {
                continue;
            }
            remove_dir_if_exists(&self.entry_dir(component, &version))
                .map_err(|err| backup_io(component, &version, err))?;
            debug!(component = %component, version = %version, "pruned backup");
            removed.push(version);
        }
        Ok(removed)
    }

    fn versions(&self, component: &ComponentId) -> Result<Vec<String>> {
        let dir = self.component_dir(component);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read backup dir {}", dir.display()));
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            versions.push(name);
        }
        versions.sort();
        Ok(versions)
    }
}

fn read_manifest(path: &Path) -> Result<Option<BackupManifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read backup manifest {}", path.display()));
        }
    };
    let manifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse backup manifest {}", path.display()))?;
    Ok(Some(manifest))
}

/// Best-effort removal of a tree already swapped out of place; the swap
/// itself has succeeded, so failure here only leaves clutter behind.
pub(crate) fn discard_leftover(path: &Path) {
    if let Err(err) = remove_dir_if_exists(path) {
        warn!(path = %path.display(), error = %format!("{err:#}"), "could not remove leftover tree");
    }
}

fn backup_io(component: &ComponentId, version: &str, err: anyhow::Error) -> LifecycleError {
    LifecycleError::BackupIo {
        component: component.clone(),
        version: version.to_string(),
        detail: format!("{err:#}"),
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use verkeep_core::ComponentId;

use crate::error::LifecycleError;
use crate::fs_utils::{current_unix_timestamp, write_atomic};

const LEDGER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub component: ComponentId,
    pub version: String,
    pub recorded_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LedgerDocument {
    format: u32,
    #[serde(default)]
    installed: BTreeMap<ComponentId, Option<String>>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            format: LEDGER_FORMAT_VERSION,
            installed: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

/// Durable record of the installed version per component plus a bounded
/// per-component history of the versions they replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLedger {
    path: PathBuf,
    history_limit: usize,
    document: LedgerDocument,
}

impl VersionLedger {
    /// Loads the ledger at `path`; a missing file is an empty ledger, an
    /// unparsable one is `CorruptLedger` and is never treated as empty.
    pub fn load(path: &Path, history_limit: usize) -> Result<Self, LifecycleError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger yet, starting empty");
                return Ok(Self::empty(path, history_limit));
            }
            Err(err) => {
                return Err(LifecycleError::LedgerIo {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                });
            }
        };

        let document: LedgerDocument =
            serde_json::from_str(&raw).map_err(|err| LifecycleError::CorruptLedger {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })?;
        if document.format != LEDGER_FORMAT_VERSION {
            return Err(LifecycleError::CorruptLedger {
                path: path.to_path_buf(),
                detail: format!("unsupported ledger format {}", document.format),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            history_limit: history_limit.max(1),
            document,
        })
    }

    /// Operator-confirmed recovery from `CorruptLedger`: the unreadable file is
    /// kept as `<ledger>.corrupt-<unix>` and an empty ledger is written.
    pub fn reset(
        path: &Path,
        history_limit: usize,
    ) -> Result<(Self, Option<PathBuf>), LifecycleError> {
        let io_err = |detail: String| LifecycleError::LedgerIo {
            path: path.to_path_buf(),
            detail,
        };

        let preserved = if path.exists() {
            let stamp = current_unix_timestamp().map_err(|err| io_err(format!("{err:#}")))?;
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("ledger.json");
            let aside = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
            fs::rename(path, &aside).map_err(|err| io_err(err.to_string()))?;
            warn!(preserved = %aside.display(), "ledger reset, previous file preserved");
            Some(aside)
        } else {
            None
        };

        let ledger = Self::empty(path, history_limit);
        ledger.persist()?;
        Ok((ledger, preserved))
    }

    fn empty(path: &Path, history_limit: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            history_limit: history_limit.max(1),
            document: LedgerDocument::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_version(&self, component: &ComponentId) -> Option<&str> {
        self.document
            .installed
            .get(component)
            .and_then(|version| version.as_deref())
    }

    /// Rollback target: the newest history entry that is not the current version.
    pub fn previous_version(&self, component: &ComponentId) -> Option<&str> {
        let current = self.current_version(component);
        self.document
            .history
            .iter()
            .rev()
            .filter(|entry| &entry.component == component)
            .map(|entry| entry.version.as_str())
            .find(|version| Some(*version) != current)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.document.history
    }

    pub fn history_for(&self, component: &ComponentId) -> Vec<HistoryEntry> {
        self.document
            .history
            .iter()
            .filter(|entry| &entry.component == component)
            .cloned()
            .collect()
    }

    pub fn installed(&self) -> impl Iterator<Item = (&ComponentId, &str)> {
        self.document
            .installed
            .iter()
            .filter_map(|(id, version)| version.as_deref().map(|version| (id, version)))
    }

    pub fn record_transition(
        &mut self,
        component: &ComponentId,
        new_version: &str,
    ) -> Result<(), LifecycleError> {
        let now = current_unix_timestamp().map_err(|err| LifecycleError::LedgerIo {
            path: self.path.clone(),
            detail: format!("{err:#}"),
        })?;
        self.record_transition_at(component, new_version, now)
    }

    /// Makes `new_version` current. The outgoing version, if any, is appended to
    /// history and the oldest entries of this component beyond the limit are
    /// evicted. Re-recording the current version changes nothing.
    pub fn record_transition_at(
        &mut self,
        component: &ComponentId,
        new_version: &str,
        now_unix: u64,
    ) -> Result<(), LifecycleError> {
        let outgoing = self.current_version(component).map(ToOwned::to_owned);
        if outgoing.as_deref() == Some(new_version) {
            return Ok(());
        }

        let previous = self.document.clone();
        if let Some(outgoing) = outgoing {
            self.document.history.push(HistoryEntry {
                component: component.clone(),
                version: outgoing,
                recorded_at_unix: now_unix,
            });
            self.evict_excess_history(component);
        }
        self.document
            .installed
            .insert(component.clone(), Some(new_version.to_string()));

        if let Err(err) = self.persist() {
            self.document = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn clear_installed(&mut self, component: &ComponentId) -> Result<(), LifecycleError> {
        let now = current_unix_timestamp().map_err(|err| LifecycleError::LedgerIo {
            path: self.path.clone(),
            detail: format!("{err:#}"),
        })?;
        self.clear_installed_at(component, now)
    }

    /// Marks `component` as not installed. The outgoing version goes to history
    /// so a later rollback can bring it back.
    pub fn clear_installed_at(
        &mut self,
        component: &ComponentId,
        now_unix: u64,
    ) -> Result<(), LifecycleError> {
        let Some(outgoing) = self.current_version(component).map(ToOwned::to_owned) else {
            return Ok(());
        };

        let previous = self.document.clone();
        self.document.history.push(HistoryEntry {
            component: component.clone(),
            version: outgoing,
            recorded_at_unix: now_unix,
        });
        self.evict_excess_history(component);
        self.document.installed.insert(component.clone(), None);
        if let Err(err) = self.persist() {
            self.document = previous;
            return Err(err);
        }
        Ok(())
    }

    fn evict_excess_history(&mut self, component: &ComponentId) {
        let count = self
            .document
            .history
            .iter()
            .filter(|entry| &entry.component == component)
            .count();
        let mut excess = count.saturating_sub(self.history_limit);
        self.document.history.retain(|entry| {
            if excess > 0 && &entry.component == component {
                excess -= 1;
                return false;
            }
            true
        });
    }

    fn persist(&self) -> Result<(), LifecycleError> {
        let mut content =
            serde_json::to_string_pretty(&self.document).map_err(|err| LifecycleError::LedgerIo {
                path: self.path.clone(),
                detail: err.to_string(),
            })?;
        content.push('\n');
        write_atomic(&self.path, content.as_bytes()).map_err(|err| LifecycleError::LedgerIo {
            path: self.path.clone(),
            detail: format!("{err:#}"),
        })
    }
}

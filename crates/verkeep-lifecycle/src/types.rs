use std::fmt;
use std::path::PathBuf;

use verkeep_core::ComponentId;

use crate::backup::BackupManifest;
use crate::ledger::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Install,
    Upgrade,
    Rollback,
    Uninstall,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
            Self::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One install/upgrade/rollback/uninstall applied to a single component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub component: ComponentId,
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: TransitionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded(Transition),
    /// The target was already installed; nothing was touched.
    Skipped {
        component: ComponentId,
        version: String,
    },
}

impl UpgradeOutcome {
    pub fn component(&self) -> &ComponentId {
        match self {
            Self::Upgraded(transition) => &transition.component,
            Self::Skipped { component, .. } => component,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub transition: Transition,
    /// False when the target was already in place and only units were re-applied.
    pub restored_from_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallOutcome {
    NotInstalled { component: ComponentId },
    Uninstalled(Transition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentStatus {
    pub component: ComponentId,
    pub desired_version: String,
    pub installed_version: Option<String>,
    pub install_root: Option<PathBuf>,
    /// False when the ledger names a version whose install root is missing.
    pub install_root_present: bool,
    pub service: Option<String>,
    pub service_active: Option<bool>,
    pub history: Vec<HistoryEntry>,
    pub backups: Vec<BackupManifest>,
}

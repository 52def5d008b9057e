use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use verkeep_core::ComponentId;

use crate::types::TransitionKind;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("backup of {component} {version} failed: {detail}")]
    BackupIo {
        component: ComponentId,
        version: String,
        detail: String,
    },

    #[error("no backup found for {component} {version}")]
    BackupNotFound {
        component: ComponentId,
        version: String,
    },

    #[error("install of {component} {version} failed at step '{step}': {detail}")]
    InstallFailure {
        component: ComponentId,
        version: String,
        step: &'static str,
        detail: String,
    },

    #[error("service '{service}' for {component} failed to reload: {detail}")]
    ServiceReloadFailure {
        component: ComponentId,
        service: String,
        detail: String,
    },

    #[error("no rollback target for {component}: no version given and no prior version recorded")]
    NoRollbackTarget { component: ComponentId },

    #[error("version ledger is corrupt ({}): {detail}", path.display())]
    CorruptLedger { path: PathBuf, detail: String },

    #[error("version ledger I/O failed ({}): {detail}", path.display())]
    LedgerIo { path: PathBuf, detail: String },

    #[error("another lifecycle operation holds {}{}", path.display(), format_holder(*holder))]
    Locked { path: PathBuf, holder: Option<u32> },

    #[error("unknown component: {0}")]
    UnknownComponent(ComponentId),

    #[error("invalid version '{version}': {detail}")]
    InvalidVersion { version: String, detail: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{component} is already installed at {version}; allow overwrite to replace it")]
    AlreadyInstalled {
        component: ComponentId,
        version: String,
    },

    #[error("cannot uninstall {component}: installed dependents {}", dependents.join(", "))]
    BlockedByDependents {
        component: ComponentId,
        dependents: Vec<String>,
    },

    #[error("{kind} of {component} to {to} failed: {cause}; {rollback}")]
    TransitionFailed {
        kind: TransitionKind,
        component: ComponentId,
        from: Option<String>,
        to: String,
        cause: Box<LifecycleError>,
        rollback: RollbackStatus,
    },

    #[error("{cause}; compensating rollback of {component} failed: {detail}")]
    CompensationFailed {
        cause: Box<LifecycleError>,
        component: ComponentId,
        detail: String,
    },
}

/// What happened to the automatic rollback after a destructive step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    Recovered { version: String },
    Failed { detail: String },
    NothingToRestore,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recovered { version } => write!(f, "automatic rollback recovered {version}"),
            Self::Failed { detail } => write!(
                f,
                "automatic rollback also failed: {detail}; manual intervention required"
            ),
            Self::NothingToRestore => f.write_str("no prior version to roll back to"),
        }
    }
}

impl LifecycleError {
    /// The failure that triggered an automatic rollback, or `self` otherwise.
    pub fn root_cause(&self) -> &LifecycleError {
        match self {
            Self::TransitionFailed { cause, .. } | Self::CompensationFailed { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    pub fn rollback_status(&self) -> Option<&RollbackStatus> {
        match self {
            Self::TransitionFailed { rollback, .. } => Some(rollback),
            Self::CompensationFailed { cause, .. } => cause.rollback_status(),
            _ => None,
        }
    }

    /// True only when the host may be left without a working installation.
    pub fn requires_manual_intervention(&self) -> bool {
        match self {
            Self::TransitionFailed { rollback, .. } => {
                matches!(rollback, RollbackStatus::Failed { .. })
            }
            Self::CompensationFailed { .. } => true,
            _ => false,
        }
    }
}

fn format_holder(holder: Option<u32>) -> String {
    holder
        .map(|pid| format!(" (pid {pid})"))
        .unwrap_or_default()
}

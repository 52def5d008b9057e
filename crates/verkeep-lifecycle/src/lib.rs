mod backup;
mod coordinator;
mod environment;
mod error;
mod fs_utils;
mod installer;
mod layout;
mod ledger;
mod lock;
mod shell;
mod types;

pub use backup::{BackupManifest, BackupStore};
pub use coordinator::LifecycleCoordinator;
pub use environment::{apply_env_assignment, rewrite_env_file};
pub use error::{LifecycleError, RollbackStatus};
pub use fs_utils::current_unix_timestamp;
pub use installer::{ComponentInstaller, TarballInstaller};
pub use layout::StateLayout;
pub use ledger::{HistoryEntry, VersionLedger};
pub use lock::LedgerLock;
pub use shell::{CommandLine, ShellFailure, ShellOutput, ShellRunner, SystemShellRunner};
pub use types::{
    ComponentStatus, RollbackOutcome, Transition, TransitionKind, UninstallOutcome,
    UpgradeOutcome,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use verkeep_core::{validate_version, ComponentId, ComponentSpec, HostConfig};

use crate::backup::BackupStore;
use crate::error::{LifecycleError, RollbackStatus};
use crate::fs_utils::remove_dir_if_exists;
use crate::installer::{ComponentInstaller, TarballInstaller};
use crate::layout::StateLayout;
use crate::ledger::VersionLedger;
use crate::lock::LedgerLock;
use crate::shell::ShellRunner;
use crate::types::{
    ComponentStatus, RollbackOutcome, Transition, TransitionKind, UninstallOutcome,
    UpgradeOutcome,
};

const STEP_STOP_SERVICE: &str = "stop_service";
const STEP_REMOVE_ROOT: &str = "remove_root";
const STEP_MATERIALIZE: &str = "materialize";
const STEP_ENVIRONMENT: &str = "environment";
const STEP_SERVICE_UNIT: &str = "service_unit";
const STEP_RECORD: &str = "record";

/// Drives install, upgrade, rollback and uninstall as multi-step transitions.
///
/// Every public operation holds the ledger lock for its whole duration. The
/// previous installation is backed up before anything destructive runs, and a
/// failure in the destructive phase of an upgrade restores it automatically.
pub struct LifecycleCoordinator {
    layout: StateLayout,
    config: HostConfig,
    installers: BTreeMap<ComponentId, Box<dyn ComponentInstaller>>,
    backups: BackupStore,
}

impl LifecycleCoordinator {
    pub fn new(
        config: HostConfig,
        installers: BTreeMap<ComponentId, Box<dyn ComponentInstaller>>,
    ) -> Self {
        let layout = StateLayout::new(config.state_dir.clone());
        let backups = BackupStore::new(layout.backups_dir());
        Self {
            layout,
            config,
            installers,
            backups,
        }
    }

    /// One `TarballInstaller` per configured component, all sharing `shell`.
    pub fn with_tarball_installers(config: HostConfig, shell: Arc<dyn ShellRunner>) -> Self {
        let work_dir = StateLayout::new(config.state_dir.clone()).tmp_dir();
        let installers = config
            .components
            .iter()
            .map(|(id, spec)| {
                let installer: Box<dyn ComponentInstaller> = Box::new(TarballInstaller::new(
                    spec.clone(),
                    Arc::clone(&shell),
                    work_dir.clone(),
                ));
                (id.clone(), installer)
            })
            .collect();
        Self::new(config, installers)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn install(
        &self,
        component: &ComponentId,
        version: &str,
        allow_overwrite: bool,
    ) -> Result<Transition, LifecycleError> {
        self.spec(component)?;
        check_version(version)?;
        let (_lock, mut ledger) = self.begin()?;

        match ledger.current_version(component).map(ToOwned::to_owned) {
            None => self.replace_locked(&mut ledger, component, None, version, TransitionKind::Install),
            Some(current) if !allow_overwrite => Err(LifecycleError::AlreadyInstalled {
                component: component.clone(),
                version: current,
            }),
            Some(current) if current == version => self.replace_locked(
                &mut ledger,
                component,
                Some(&current),
                version,
                TransitionKind::Install,
            ),
            Some(_) => match self.upgrade_locked(&mut ledger, component, version)? {
                UpgradeOutcome::Upgraded(transition) => Ok(transition),
                UpgradeOutcome::Skipped { component, version } => Ok(Transition {
                    component,
                    from: Some(version.clone()),
                    to: Some(version),
                    kind: TransitionKind::Install,
                }),
            },
        }
    }

    pub fn upgrade(
        &self,
        component: &ComponentId,
        target: &str,
    ) -> Result<UpgradeOutcome, LifecycleError> {
        self.spec(component)?;
        check_version(target)?;
        let (_lock, mut ledger) = self.begin()?;
        self.upgrade_locked(&mut ledger, component, target)
    }

    /// Upgrades every configured component to its configured version,
    /// dependencies first. When one fails, components already upgraded in this
    /// run are rolled back, dependents before their dependencies.
    pub fn upgrade_all(&self) -> Result<Vec<UpgradeOutcome>, LifecycleError> {
        let (_lock, mut ledger) = self.begin()?;
        let mut outcomes = Vec::new();
        let mut upgraded: Vec<(ComponentId, String)> = Vec::new();

        for component in self.config.dependency_order() {
            let target = self.spec(&component)?.version.clone();
            let result = check_version(&target)
                .and_then(|()| self.upgrade_locked(&mut ledger, &component, &target));
            match result {
                Ok(outcome) => {
                    if let UpgradeOutcome::Upgraded(Transition {
                        from: Some(from), ..
                    }) = &outcome
                    {
                        upgraded.push((component.clone(), from.clone()));
                    }
                    outcomes.push(outcome);
                }
                Err(err) => return Err(self.compensate(&mut ledger, upgraded, err)),
            }
        }
        Ok(outcomes)
    }

    pub fn rollback(
        &self,
        component: &ComponentId,
        explicit_version: Option<&str>,
    ) -> Result<RollbackOutcome, LifecycleError> {
        self.spec(component)?;
        let (_lock, mut ledger) = self.begin()?;
        self.rollback_locked(&mut ledger, component, explicit_version)
    }

    /// Rolls every installed component with a recorded prior version back to
    /// it, dependents first. Uninstalled components stay uninstalled.
    pub fn rollback_all(&self) -> Result<Vec<RollbackOutcome>, LifecycleError> {
        let (_lock, mut ledger) = self.begin()?;
        let mut outcomes = Vec::new();
        for component in self.config.dependency_order().into_iter().rev() {
            if ledger.current_version(&component).is_none()
                || ledger.previous_version(&component).is_none()
            {
                continue;
            }
            outcomes.push(self.rollback_locked(&mut ledger, &component, None)?);
        }
        Ok(outcomes)
    }

    pub fn uninstall(&self, component: &ComponentId) -> Result<UninstallOutcome, LifecycleError> {
        let spec = self.spec(component)?;
        let installer = self.installer(component)?;
        let (_lock, mut ledger) = self.begin()?;

        let Some(current) = ledger.current_version(component).map(ToOwned::to_owned) else {
            return Ok(UninstallOutcome::NotInstalled {
                component: component.clone(),
            });
        };

        let dependents: Vec<String> = self
            .config
            .dependents_of(component)
            .into_iter()
            .filter(|dependent| ledger.current_version(dependent).is_some())
            .map(|dependent| dependent.to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(LifecycleError::BlockedByDependents {
                component: component.clone(),
                dependents,
            });
        }

        let root = install_root(spec, &current)?;
        if root.exists() {
            self.backups.save(component, &current, &root)?;
        }
        installer
            .remove_service_unit(&current)
            .map_err(|err| step_failure(component, &current, STEP_SERVICE_UNIT, err))?;
        installer
            .export_environment(None)
            .map_err(|err| step_failure(component, &current, STEP_ENVIRONMENT, err))?;
        remove_dir_if_exists(&root)
            .map_err(|err| step_failure(component, &current, STEP_REMOVE_ROOT, err))?;
        ledger.clear_installed(component)?;

        info!(component = %component, version = %current, "uninstalled");
        Ok(UninstallOutcome::Uninstalled(Transition {
            component: component.clone(),
            from: Some(current),
            to: None,
            kind: TransitionKind::Uninstall,
        }))
    }

    /// Deletes backups of versions that are neither current nor in history.
    pub fn prune_backups(&self, component: &ComponentId) -> Result<Vec<String>, LifecycleError> {
        self.spec(component)?;
        let (_lock, ledger) = self.begin()?;
        let mut keep: BTreeSet<String> = ledger
            .history_for(component)
            .into_iter()
            .map(|entry| entry.version)
            .collect();
        if let Some(current) = ledger.current_version(component) {
            keep.insert(current.to_string());
        }
        let removed = self.backups.prune(component, &keep)?;
        if !removed.is_empty() {
            info!(component = %component, removed = ?removed, "pruned backups");
        }
        Ok(removed)
    }

    /// Read-only view of every component. Does not take the ledger lock; ledger
    /// writes are atomic renames so a concurrent reader sees a whole document.
    pub fn status(&self) -> Result<Vec<ComponentStatus>, LifecycleError> {
        let ledger = VersionLedger::load(&self.layout.ledger_path(), self.config.history_limit)?;
        let mut statuses = Vec::new();

        for component in self.config.dependency_order() {
            let spec = self.spec(&component)?;
            let installed_version = ledger.current_version(&component).map(ToOwned::to_owned);
            let install_root = match &installed_version {
                Some(version) => Some(install_root(spec, version)?),
                None => None,
            };
            let install_root_present = install_root.as_deref().is_some_and(Path::exists);
            let service = match &installed_version {
                Some(version) => spec.service_name(version).ok().flatten(),
                None => None,
            };
            let service_active = match (&service, self.installers.get(&component)) {
                (Some(service), Some(installer)) => match installer.service_active(service) {
                    Ok(active) => Some(active),
                    Err(err) => {
                        warn!(service = %service, error = %format!("{err:#}"), "could not query service state");
                        None
                    }
                },
                _ => None,
            };

            statuses.push(ComponentStatus {
                component: component.clone(),
                desired_version: spec.version.clone(),
                installed_version,
                install_root,
                install_root_present,
                service,
                service_active,
                history: ledger.history_for(&component),
                backups: self.backups.list(&component)?,
            });
        }
        Ok(statuses)
    }

    /// Replaces an unreadable ledger with an empty one, keeping the old file.
    pub fn reset_ledger(&self) -> Result<Option<PathBuf>, LifecycleError> {
        self.ensure_dirs()?;
        let _lock = LedgerLock::acquire(&self.layout.lock_path())?;
        let (_, preserved) =
            VersionLedger::reset(&self.layout.ledger_path(), self.config.history_limit)?;
        Ok(preserved)
    }

    fn begin(&self) -> Result<(LedgerLock, VersionLedger), LifecycleError> {
        self.ensure_dirs()?;
        let lock = LedgerLock::acquire(&self.layout.lock_path())?;
        let ledger = VersionLedger::load(&self.layout.ledger_path(), self.config.history_limit)?;
        Ok((lock, ledger))
    }

    fn ensure_dirs(&self) -> Result<(), LifecycleError> {
        self.layout
            .ensure_base_dirs()
            .map_err(|err| LifecycleError::LedgerIo {
                path: self.layout.state_dir().to_path_buf(),
                detail: format!("{err:#}"),
            })
    }

    fn spec(&self, component: &ComponentId) -> Result<&ComponentSpec, LifecycleError> {
        self.config
            .component(component)
            .ok_or_else(|| LifecycleError::UnknownComponent(component.clone()))
    }

    fn installer(&self, component: &ComponentId) -> Result<&dyn ComponentInstaller, LifecycleError> {
        self.installers
            .get(component)
            .map(|installer| installer.as_ref())
            .ok_or_else(|| {
                LifecycleError::Configuration(format!("no installer registered for '{component}'"))
            })
    }

    fn upgrade_locked(
        &self,
        ledger: &mut VersionLedger,
        component: &ComponentId,
        target: &str,
    ) -> Result<UpgradeOutcome, LifecycleError> {
        let current = ledger.current_version(component).map(ToOwned::to_owned);
        if current.as_deref() == Some(target) {
            info!(component = %component, version = target, "already at target version, skipping");
            return Ok(UpgradeOutcome::Skipped {
                component: component.clone(),
                version: target.to_string(),
            });
        }
        self.replace_locked(
            ledger,
            component,
            current.as_deref(),
            target,
            TransitionKind::Upgrade,
        )
        .map(UpgradeOutcome::Upgraded)
    }

    /// Backs up `from`, swaps in `to` and records it. A failure after the backup
    /// restores `from`; with no `from` there is nothing to restore.
    fn replace_locked(
        &self,
        ledger: &mut VersionLedger,
        component: &ComponentId,
        from: Option<&str>,
        to: &str,
        kind: TransitionKind,
    ) -> Result<Transition, LifecycleError> {
        let spec = self.spec(component)?;
        let installer = self.installer(component)?;
        let target_root = install_root(spec, to)?;
        let locator = spec
            .source_locator(to)
            .map_err(|err| LifecycleError::Configuration(format!("{err:#}")))?;
        let from_root = match from {
            Some(from) => Some(install_root(spec, from)?),
            None => None,
        };

        // Nothing destructive runs unless `from` has a backup to return to.
        if let (Some(from), Some(root)) = (from, &from_root) {
            if !root.exists() && self.backups.exists(component, from) {
                warn!(
                    component = %component,
                    version = from,
                    root = %root.display(),
                    "recorded install root is missing, keeping the existing backup"
                );
            } else {
                self.backups.save(component, from, root)?;
            }
        }

        info!(component = %component, kind = %kind, from = ?from, to, "starting transition");
        let applied = (|| -> Result<(), LifecycleError> {
            if let Some(from) = from {
                installer
                    .stop_service(from)
                    .map_err(|err| step_failure(component, to, STEP_STOP_SERVICE, err))?;
            }
            if let Some(root) = &from_root {
                remove_dir_if_exists(root)
                    .map_err(|err| step_failure(component, to, STEP_REMOVE_ROOT, err))?;
            }
            installer
                .materialize(to, &locator, &target_root)
                .map_err(|err| step_failure(component, to, STEP_MATERIALIZE, err))?;
            self.activate(ledger, component, to, &target_root)?;
            ledger
                .record_transition(component, to)
                .map_err(|err| step_failure(component, to, STEP_RECORD, anyhow::Error::new(err)))
        })();

        if let Err(cause) = applied {
            return Err(self.recover(
                ledger,
                component,
                from,
                from_root.as_deref(),
                to,
                &target_root,
                kind,
                cause,
            ));
        }

        if let Some(from) = from {
            self.retire_unit(component, from, to);
        }
        info!(component = %component, kind = %kind, version = to, "transition complete");
        Ok(Transition {
            component: component.clone(),
            from: from.map(ToOwned::to_owned),
            to: Some(to.to_string()),
            kind,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn recover(
        &self,
        ledger: &VersionLedger,
        component: &ComponentId,
        from: Option<&str>,
        from_root: Option<&Path>,
        to: &str,
        target_root: &Path,
        kind: TransitionKind,
        cause: LifecycleError,
    ) -> LifecycleError {
        warn!(component = %component, kind = %kind, to, error = %cause, "transition failed, recovering");

        if let Err(err) = remove_dir_if_exists(target_root) {
            warn!(root = %target_root.display(), error = %format!("{err:#}"), "failed to discard partial install");
        }
        if from != Some(to) {
            if let Ok(installer) = self.installer(component) {
                if let Err(err) = installer.remove_service_unit(to) {
                    warn!(component = %component, version = to, error = %format!("{err:#}"), "failed to remove unit of failed version");
                }
            }
        }

        let (Some(from), Some(from_root)) = (from, from_root) else {
            if environment_touched(&cause) {
                if let Ok(installer) = self.installer(component) {
                    if let Err(err) = installer.export_environment(None) {
                        warn!(component = %component, version = to, error = %format!("{err:#}"), "failed to clear environment export of failed install");
                    }
                }
            }
            if kind == TransitionKind::Install {
                return cause;
            }
            return LifecycleError::TransitionFailed {
                kind,
                component: component.clone(),
                from: None,
                to: to.to_string(),
                cause: Box::new(cause),
                rollback: RollbackStatus::NothingToRestore,
            };
        };

        let rollback = match self.restore_version(ledger, component, from, from_root) {
            Ok(()) => {
                info!(component = %component, version = from, "automatic rollback recovered previous version");
                RollbackStatus::Recovered {
                    version: from.to_string(),
                }
            }
            Err(err) => {
                warn!(component = %component, version = from, error = %err, "automatic rollback failed");
                RollbackStatus::Failed {
                    detail: err.to_string(),
                }
            }
        };

        LifecycleError::TransitionFailed {
            kind,
            component: component.clone(),
            from: Some(from.to_string()),
            to: to.to_string(),
            cause: Box::new(cause),
            rollback,
        }
    }

    fn restore_version(
        &self,
        ledger: &VersionLedger,
        component: &ComponentId,
        version: &str,
        root: &Path,
    ) -> Result<(), LifecycleError> {
        self.backups.restore(component, version, root)?;
        self.activate(ledger, component, version, root)
    }

    fn rollback_locked(
        &self,
        ledger: &mut VersionLedger,
        component: &ComponentId,
        explicit_version: Option<&str>,
    ) -> Result<RollbackOutcome, LifecycleError> {
        let spec = self.spec(component)?;
        let installer = self.installer(component)?;
        let target = match explicit_version {
            Some(version) => version.to_string(),
            None => ledger
                .previous_version(component)
                .map(ToOwned::to_owned)
                .ok_or_else(|| LifecycleError::NoRollbackTarget {
                    component: component.clone(),
                })?,
        };
        check_version(&target)?;

        let current = ledger.current_version(component).map(ToOwned::to_owned);
        let target_root = install_root(spec, &target)?;

        if current.as_deref() == Some(target.as_str()) {
            let restored = !target_root.exists();
            if restored {
                self.backups.restore(component, &target, &target_root)?;
            }
            self.activate(ledger, component, &target, &target_root)?;
            info!(component = %component, version = %target, restored, "already at rollback target, units re-applied");
            return Ok(RollbackOutcome {
                transition: Transition {
                    component: component.clone(),
                    from: current,
                    to: Some(target),
                    kind: TransitionKind::Rollback,
                },
                restored_from_backup: restored,
            });
        }

        let current_root = match &current {
            Some(version) => Some(install_root(spec, version)?),
            None => None,
        };
        if let (Some(version), Some(root)) = (&current, &current_root) {
            if root.exists() {
                self.backups.save(component, version, root)?;
            }
        }

        let restored = !target_root.exists();
        if restored {
            self.backups.restore(component, &target, &target_root)?;
        }
        if let Some(version) = &current {
            installer
                .stop_service(version)
                .map_err(|err| step_failure(component, &target, STEP_STOP_SERVICE, err))?;
        }
        self.activate(ledger, component, &target, &target_root)?;
        ledger.record_transition(component, &target)?;

        if let (Some(version), Some(root)) = (&current, &current_root) {
            if root != &target_root {
                if let Err(err) = remove_dir_if_exists(root) {
                    warn!(root = %root.display(), error = %format!("{err:#}"), "failed to remove replaced install root");
                }
            }
            self.retire_unit(component, version, &target);
        }

        info!(component = %component, from = ?current, to = %target, restored, "rolled back");
        Ok(RollbackOutcome {
            transition: Transition {
                component: component.clone(),
                from: current,
                to: Some(target),
                kind: TransitionKind::Rollback,
            },
            restored_from_backup: restored,
        })
    }

    fn compensate(
        &self,
        ledger: &mut VersionLedger,
        upgraded: Vec<(ComponentId, String)>,
        cause: LifecycleError,
    ) -> LifecycleError {
        for (component, from) in upgraded.into_iter().rev() {
            warn!(component = %component, version = %from, "rolling back earlier upgrade of this run");
            if let Err(err) = self.rollback_locked(ledger, &component, Some(&from)) {
                return LifecycleError::CompensationFailed {
                    cause: Box::new(cause),
                    component,
                    detail: err.to_string(),
                };
            }
        }
        cause
    }

    /// Points the environment export and service units at `root`, including
    /// the units of installed dependents that embed this component's path.
    fn activate(
        &self,
        ledger: &VersionLedger,
        component: &ComponentId,
        version: &str,
        root: &Path,
    ) -> Result<(), LifecycleError> {
        let installer = self.installer(component)?;
        installer
            .export_environment(Some(root))
            .map_err(|err| step_failure(component, version, STEP_ENVIRONMENT, err))?;
        self.apply_service(ledger, component, version, root, None)?;

        for dependent in self.config.dependents_of(component) {
            let Some(dependent_version) = ledger.current_version(&dependent) else {
                continue;
            };
            let dependent_root = install_root(self.spec(&dependent)?, dependent_version)?;
            self.apply_service(
                ledger,
                &dependent,
                dependent_version,
                &dependent_root,
                Some((component, root)),
            )?;
        }
        Ok(())
    }

    fn apply_service(
        &self,
        ledger: &VersionLedger,
        component: &ComponentId,
        version: &str,
        root: &Path,
        pending: Option<(&ComponentId, &Path)>,
    ) -> Result<(), LifecycleError> {
        let installer = self.installer(component)?;
        let dependencies = self.dependency_roots(ledger, component, pending)?;
        let service = installer
            .write_service_unit(version, root, &dependencies)
            .map_err(|err| step_failure(component, version, STEP_SERVICE_UNIT, err))?;
        if let Some(service) = service {
            installer.reload_and_restart(&service).map_err(|err| {
                LifecycleError::ServiceReloadFailure {
                    component: component.clone(),
                    service,
                    detail: format!("{err:#}"),
                }
            })?;
        }
        Ok(())
    }

    /// Install roots of the dependencies of `component`, with `pending`
    /// overriding the ledger for a component that is mid-transition.
    fn dependency_roots(
        &self,
        ledger: &VersionLedger,
        component: &ComponentId,
        pending: Option<(&ComponentId, &Path)>,
    ) -> Result<BTreeMap<ComponentId, PathBuf>, LifecycleError> {
        let mut roots = BTreeMap::new();
        let Some(dependency) = &self.spec(component)?.depends_on else {
            return Ok(roots);
        };
        match pending {
            Some((pending_id, pending_root)) if pending_id == dependency => {
                roots.insert(dependency.clone(), pending_root.to_path_buf());
            }
            _ => {
                if let Some(version) = ledger.current_version(dependency) {
                    let root = install_root(self.spec(dependency)?, version)?;
                    roots.insert(dependency.clone(), root);
                }
            }
        }
        Ok(roots)
    }

    /// Removes the unit of `old` when `new` runs under a differently named unit.
    fn retire_unit(&self, component: &ComponentId, old: &str, new: &str) {
        let Ok(spec) = self.spec(component) else {
            return;
        };
        if old == new || spec.unit_path(old).ok() == spec.unit_path(new).ok() {
            return;
        }
        let Ok(installer) = self.installer(component) else {
            return;
        };
        if let Err(err) = installer.remove_service_unit(old) {
            warn!(component = %component, version = old, error = %format!("{err:#}"), "failed to remove stale unit");
        }
    }
}

fn check_version(version: &str) -> Result<(), LifecycleError> {
    validate_version(version).map_err(|err| LifecycleError::InvalidVersion {
        version: version.to_string(),
        detail: err.to_string(),
    })
}

fn install_root(spec: &ComponentSpec, version: &str) -> Result<PathBuf, LifecycleError> {
    spec.install_root(version)
        .map_err(|err| LifecycleError::Configuration(format!("{err:#}")))
}

/// False when the transition failed before the environment export was rewritten.
fn environment_touched(cause: &LifecycleError) -> bool {
    !matches!(
        cause,
        LifecycleError::InstallFailure { step, .. }
            if [STEP_STOP_SERVICE, STEP_REMOVE_ROOT, STEP_MATERIALIZE].contains(step)
    )
}

fn step_failure(
    component: &ComponentId,
    version: &str,
    step: &'static str,
    err: anyhow::Error,
) -> LifecycleError {
    LifecycleError::InstallFailure {
        component: component.clone(),
        version: version.to_string(),
        step,
        detail: format!("{err:#}"),
    }
}

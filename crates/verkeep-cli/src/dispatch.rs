use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use verkeep_core::{default_config_path, ComponentId, HostConfig};
use verkeep_lifecycle::{LifecycleCoordinator, LifecycleError, ShellRunner, SystemShellRunner};

use crate::completion::write_completions_script;
use crate::render::{
    format_rollback_outcome, format_status_lines, format_transition, format_uninstall_outcome,
    format_upgrade_outcome, status_json, TerminalRenderer,
};
use crate::{Cli, Commands, LedgerCommands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Install {
            component,
            version,
            force,
        } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let component = ComponentId::new(component);
            let version = resolve_version(&coordinator, &component, version)?;
            let step = renderer.start_step("install", &format!("installing {component} {version}"));
            match coordinator.install(&component, &version, force) {
                Ok(transition) => {
                    step.finish();
                    renderer.print_status("ok", &format_transition(&transition));
                }
                Err(err) => {
                    step.abandon();
                    return Err(surface(renderer, err));
                }
            }
        }
        Commands::Upgrade { component, version } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let outcomes = match component {
                Some(component) => {
                    let component = ComponentId::new(component);
                    let version = resolve_version(&coordinator, &component, version)?;
                    let step = renderer
                        .start_step("upgrade", &format!("upgrading {component} to {version}"));
                    match coordinator.upgrade(&component, &version) {
                        Ok(outcome) => {
                            step.finish();
                            vec![outcome]
                        }
                        Err(err) => {
                            step.abandon();
                            return Err(surface(renderer, err));
                        }
                    }
                }
                None => {
                    let step = renderer.start_step("upgrade", "upgrading all components");
                    match coordinator.upgrade_all() {
                        Ok(outcomes) => {
                            step.finish();
                            outcomes
                        }
                        Err(err) => {
                            step.abandon();
                            return Err(surface(renderer, err));
                        }
                    }
                }
            };
            for outcome in &outcomes {
                let (status, message) = format_upgrade_outcome(outcome);
                renderer.print_status(status, &message);
            }
        }
        Commands::Rollback { component, to } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let step = renderer.start_step("rollback", "rolling back");
            let result = match component {
                Some(component) => coordinator
                    .rollback(&ComponentId::new(component), to.as_deref())
                    .map(|outcome| vec![outcome]),
                None => coordinator.rollback_all(),
            };
            let outcomes = match result {
                Ok(outcomes) => {
                    step.finish();
                    outcomes
                }
                Err(err) => {
                    step.abandon();
                    return Err(surface(renderer, err));
                }
            };
            if outcomes.is_empty() {
                renderer.print_status("skip", "no component has a prior version to roll back to");
            }
            for outcome in &outcomes {
                renderer.print_status("ok", &format_rollback_outcome(outcome));
            }
        }
        Commands::Uninstall { component } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let outcome = coordinator
                .uninstall(&ComponentId::new(component))
                .map_err(|err| surface(renderer, err))?;
            let (status, message) = format_uninstall_outcome(&outcome);
            renderer.print_status(status, &message);
        }
        Commands::Status { json } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let statuses = coordinator.status().map_err(|err| surface(renderer, err))?;
            if json {
                let rendered = serde_json::to_string_pretty(&status_json(&statuses))
                    .context("failed to serialize status")?;
                println!("{rendered}");
            } else {
                renderer.print_lines(&format_status_lines(&statuses, renderer.style()));
            }
        }
        Commands::Prune { component } => {
            let coordinator = load_coordinator(config_path.as_deref())?;
            let components = match component {
                Some(component) => vec![ComponentId::new(component)],
                None => coordinator.config().dependency_order(),
            };
            for component in components {
                let removed = coordinator
                    .prune_backups(&component)
                    .map_err(|err| surface(renderer, err))?;
                if removed.is_empty() {
                    renderer.print_status("skip", &format!("no stale backups for {component}"));
                } else {
                    renderer.print_status(
                        "ok",
                        &format!("pruned backups of {component}: {}", removed.join(", ")),
                    );
                }
            }
        }
        Commands::Ledger { command } => match command {
            LedgerCommands::Reset { confirm } => {
                if !confirm {
                    return Err(anyhow!(
                        "ledger reset discards the record of installed versions; re-run with --confirm"
                    ));
                }
                let coordinator = load_coordinator(config_path.as_deref())?;
                let preserved = coordinator
                    .reset_ledger()
                    .map_err(|err| surface(renderer, err))?;
                match preserved {
                    Some(path) => renderer.print_status(
                        "ok",
                        &format!("ledger reset, previous file kept at {}", path.display()),
                    ),
                    None => renderer.print_status("ok", "ledger reset"),
                }
            }
        },
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
        }
        Commands::Version => {
            println!("verkeep {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn load_coordinator(config_path: Option<&Path>) -> Result<LifecycleCoordinator> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let config = HostConfig::load(&path)?;
    debug!(config = %path.display(), components = config.components.len(), "loaded config");
    Ok(build_coordinator(config))
}

pub(crate) fn build_coordinator(config: HostConfig) -> LifecycleCoordinator {
    let timeout = step_timeout(config.step_timeout_secs);
    let shell: Arc<dyn ShellRunner> = Arc::new(SystemShellRunner::new(timeout));
    LifecycleCoordinator::with_tarball_installers(config, shell)
}

pub(crate) fn step_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn resolve_version(
    coordinator: &LifecycleCoordinator,
    component: &ComponentId,
    explicit: Option<String>,
) -> Result<String> {
    if let Some(version) = explicit {
        return Ok(version);
    }
    coordinator
        .config()
        .component(component)
        .map(|spec| spec.version.clone())
        .ok_or_else(|| anyhow!(LifecycleError::UnknownComponent(component.clone())))
}

/// Flags the one failure class that may leave the host without a working
/// installation before handing the error back to `main`.
fn surface(renderer: TerminalRenderer, err: LifecycleError) -> anyhow::Error {
    if err.requires_manual_intervention() {
        renderer.eprint_status(
            "err",
            "automatic rollback did not complete; manual intervention required",
        );
    }
    anyhow::Error::new(err)
}

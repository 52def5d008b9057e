use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use verkeep_core::{verify_sha256_file, ComponentId, ComponentSpec};

use crate::environment::rewrite_env_file;
use crate::fs_utils::{
    copy_tree, copy_with_strip, make_tmp_dir, move_dir_or_copy, remove_dir_if_exists,
    remove_file_if_exists, write_atomic,
};
use crate::shell::{CommandLine, ShellRunner};

/// Host-side mutations for one component. The coordinator decides when each
/// step runs; implementations only perform it.
pub trait ComponentInstaller {
    /// Produces the installed tree for `version` at `dest`.
    fn materialize(&self, version: &str, source_locator: &str, dest: &Path) -> Result<()>;

    /// Writes the supervisor unit for `version` installed at `install_root`,
    /// returning the service name, or `None` when the component has no service.
    fn write_service_unit(
        &self,
        version: &str,
        install_root: &Path,
        dependencies: &BTreeMap<ComponentId, PathBuf>,
    ) -> Result<Option<String>>;

    fn reload_and_restart(&self, service: &str) -> Result<()>;

    /// Stops the service of `version` if one is configured and present.
    fn stop_service(&self, version: &str) -> Result<()>;

    /// Stops, disables and deletes the unit of `version`.
    fn remove_service_unit(&self, version: &str) -> Result<()>;

    /// Points the exported environment variable at `install_root`, or removes it.
    fn export_environment(&self, install_root: Option<&Path>) -> Result<()>;

    fn service_active(&self, service: &str) -> Result<bool>;
}

/// Installs a component from a tarball (or an unpacked directory) and manages
/// its systemd unit through a `ShellRunner`.
pub struct TarballInstaller {
    spec: ComponentSpec,
    shell: Arc<dyn ShellRunner>,
    work_dir: PathBuf,
}

impl TarballInstaller {
    pub fn new(spec: ComponentSpec, shell: Arc<dyn ShellRunner>, work_dir: PathBuf) -> Self {
        Self {
            spec,
            shell,
            work_dir,
        }
    }

    pub fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    fn run(&self, command: CommandLine, context_message: &str) -> Result<String> {
        let output = self
            .shell
            .run(&command)
            .map_err(|err| anyhow!("{context_message}: {err}"))?;
        Ok(output.stdout)
    }

    fn systemctl(&self, args: &[&str], context_message: &str) -> Result<()> {
        let command = CommandLine::new("systemctl").args(args.iter().copied());
        self.run(command, context_message).map(|_| ())
    }

    fn fetch(&self, source_locator: &str, tmp: &Path) -> Result<PathBuf> {
        if is_remote(source_locator) {
            let file_name = source_locator
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or("artifact");
            let archive = tmp.join(file_name);
            let out = archive.display().to_string();
            let curl = CommandLine::new("curl")
                .args(["-fL", "--retry", "2", "-o"])
                .arg(out.clone())
                .arg(source_locator);
            let downloaded = self.run(curl, "curl download failed").or_else(|curl_err| {
                debug!(error = %format!("{curl_err:#}"), "curl failed, trying wget");
                let _ = remove_file_if_exists(&archive);
                let wget = CommandLine::new("wget")
                    .arg("-O")
                    .arg(out.clone())
                    .arg(source_locator);
                self.run(wget, "wget download failed")
            });
            if let Err(err) = downloaded {
                let _ = remove_file_if_exists(&archive);
                return Err(err);
            }
            return Ok(archive);
        }

        let local = PathBuf::from(source_locator.strip_prefix("file://").unwrap_or(source_locator));
        if !local.exists() {
            return Err(anyhow!("source does not exist: {}", local.display()));
        }
        Ok(local)
    }

    fn unpack(&self, artifact: &Path, tmp: &Path) -> Result<PathBuf> {
        if artifact.is_dir() {
            return Ok(artifact.to_path_buf());
        }
        if let Some(expected) = &self.spec.sha256 {
            verify_sha256_file(artifact, expected)?;
        }

        let extract_dir = tmp.join("extract");
        fs::create_dir_all(&extract_dir)
            .with_context(|| format!("failed to create {}", extract_dir.display()))?;
        let tar = CommandLine::new("tar")
            .arg("-xf")
            .arg(artifact.display().to_string())
            .arg("-C")
            .arg(extract_dir.display().to_string());
        self.run(tar, "failed to extract archive")?;
        Ok(extract_dir)
    }

    fn stage_and_move(&self, unpacked: &Path, tmp: &Path, dest: &Path) -> Result<()> {
        let staging = tmp.join("staging");
        let strip = self.spec.strip_components as usize;
        if strip == 0 {
            copy_tree(unpacked, &staging)?;
        } else {
            copy_with_strip(unpacked, &staging, strip)?;
        }

        remove_dir_if_exists(dest)?;
        move_dir_or_copy(&staging, dest)
    }

    fn installed_unit(&self, version: &str) -> Result<Option<(String, PathBuf)>> {
        let Some(service) = self.spec.service_name(version)? else {
            return Ok(None);
        };
        let Some(unit_path) = self.spec.unit_path(version)? else {
            return Ok(None);
        };
        Ok(Some((service, unit_path)))
    }
}

fn is_remote(source_locator: &str) -> bool {
    source_locator.starts_with("https://") || source_locator.starts_with("http://")
}

impl ComponentInstaller for TarballInstaller {
    fn materialize(&self, version: &str, source_locator: &str, dest: &Path) -> Result<()> {
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create {}", self.work_dir.display()))?;
        let tmp = make_tmp_dir(&self.work_dir, &format!("materialize-{}", self.spec.id))?;

        let result = (|| -> Result<()> {
            let artifact = self.fetch(source_locator, &tmp)?;
            let unpacked = self.unpack(&artifact, &tmp)?;
            self.stage_and_move(&unpacked, &tmp, dest)?;
            if let Some(owner) = &self.spec.owner {
                let chown = CommandLine::new("chown")
                    .arg("-R")
                    .arg(owner.clone())
                    .arg(dest.display().to_string());
                self.run(chown, "failed to set ownership")?;
            }
            Ok(())
        })();

        if let Err(err) = remove_dir_if_exists(&tmp) {
            warn!(path = %tmp.display(), error = %format!("{err:#}"), "failed to clean work dir");
        }
        result?;

        info!(component = %self.spec.id, version, dest = %dest.display(), "materialized");
        Ok(())
    }

    fn write_service_unit(
        &self,
        version: &str,
        install_root: &Path,
        dependencies: &BTreeMap<ComponentId, PathBuf>,
    ) -> Result<Option<String>> {
        let Some(unit) = self.spec.render_unit(version, dependencies)? else {
            return Ok(None);
        };
        let Some((service, unit_path)) = self.installed_unit(version)? else {
            return Ok(None);
        };
        write_atomic(&unit_path, unit.as_bytes())
            .with_context(|| format!("failed to write unit {}", unit_path.display()))?;
        debug!(
            service = %service,
            unit = %unit_path.display(),
            install_root = %install_root.display(),
            "wrote service unit"
        );
        Ok(Some(service))
    }

    fn reload_and_restart(&self, service: &str) -> Result<()> {
        self.systemctl(&["daemon-reload"], "failed to reload systemd")?;
        self.systemctl(&["enable", service], "failed to enable service")?;
        self.systemctl(&["restart", service], "failed to restart service")
    }

    fn stop_service(&self, version: &str) -> Result<()> {
        let Some((service, unit_path)) = self.installed_unit(version)? else {
            return Ok(());
        };
        if !unit_path.exists() {
            return Ok(());
        }
        self.systemctl(&["stop", &service], "failed to stop service")
    }

    fn remove_service_unit(&self, version: &str) -> Result<()> {
        let Some((service, unit_path)) = self.installed_unit(version)? else {
            return Ok(());
        };
        if !unit_path.exists() {
            return Ok(());
        }
        self.systemctl(&["stop", &service], "failed to stop service")?;
        self.systemctl(&["disable", &service], "failed to disable service")?;
        remove_file_if_exists(&unit_path)
            .with_context(|| format!("failed to remove unit {}", unit_path.display()))?;
        self.systemctl(&["daemon-reload"], "failed to reload systemd")?;
        info!(service = %service, "removed service unit");
        Ok(())
    }

    fn export_environment(&self, install_root: Option<&Path>) -> Result<()> {
        let Some(env) = &self.spec.env else {
            return Ok(());
        };
        let value = install_root.map(|root| root.display().to_string());
        rewrite_env_file(&env.file, &env.var, value.as_deref())?;
        debug!(var = %env.var, file = %env.file.display(), value = ?value, "exported environment");
        Ok(())
    }

    fn service_active(&self, service: &str) -> Result<bool> {
        let command = CommandLine::new("systemctl").args(["is-active", "--quiet", service]);
        match self.shell.run(&command) {
            Ok(_) => Ok(true),
            Err(crate::shell::ShellFailure::NonZero { .. }) => Ok(false),
            Err(err) => Err(anyhow!("failed to query service state: {err}")),
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::template::{render_template, TemplateVars};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One statically configured component, as declared under `[components.<id>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSpec {
    #[serde(skip)]
    pub id: ComponentId,
    /// Desired version for `install` / `upgrade` when none is given explicitly.
    pub version: String,
    pub source: String,
    pub sha256: Option<String>,
    pub install_root: String,
    #[serde(default)]
    pub strip_components: u32,
    pub depends_on: Option<ComponentId>,
    pub owner: Option<String>,
    pub env: Option<EnvExport>,
    pub service: Option<ServiceSpec>,
}

/// Persists `var=<install root>` into an environment file such as `/etc/environment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvExport {
    pub file: PathBuf,
    pub var: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
    pub description: Option<String>,
    #[serde(default = "default_exec_start")]
    pub exec_start: String,
    pub exec_stop: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Full unit text; replaces the generated unit when set.
    pub template: Option<String>,
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_exec_start() -> String {
    "{install_root}/bin/start".to_string()
}

impl ComponentSpec {
    pub fn install_root(&self, version: &str) -> Result<PathBuf> {
        let rendered = render_template(&self.install_root, &TemplateVars::version(version))
            .with_context(|| format!("invalid install_root template for '{}'", self.id))?;
        Ok(PathBuf::from(rendered))
    }

    pub fn source_locator(&self, version: &str) -> Result<String> {
        render_template(&self.source, &TemplateVars::version(version))
            .with_context(|| format!("invalid source template for '{}'", self.id))
    }

    pub fn service_name(&self, version: &str) -> Result<Option<String>> {
        let Some(service) = &self.service else {
            return Ok(None);
        };
        let name = render_template(&service.name, &TemplateVars::version(version))
            .with_context(|| format!("invalid service name template for '{}'", self.id))?;
        Ok(Some(name))
    }

    pub fn unit_path(&self, version: &str) -> Result<Option<PathBuf>> {
        let Some(service) = &self.service else {
            return Ok(None);
        };
        let Some(name) = self.service_name(version)? else {
            return Ok(None);
        };
        Ok(Some(service.unit_dir.join(format!("{name}.service"))))
    }

    /// Renders the supervisor unit for `version`, with `dependencies` mapping each
    /// dependency to its currently installed root.
    pub fn render_unit(
        &self,
        version: &str,
        dependencies: &BTreeMap<ComponentId, PathBuf>,
    ) -> Result<Option<String>> {
        let Some(service) = &self.service else {
            return Ok(None);
        };
        let install_root = self.install_root(version)?;
        let service_name = self.service_name(version)?.unwrap_or_default();
        let vars = TemplateVars {
            version,
            install_root: Some(&install_root),
            service: Some(&service_name),
            dependencies: Some(dependencies),
        };

        if let Some(template) = &service.template {
            let unit = render_template(template, &vars)
                .with_context(|| format!("failed rendering unit template for '{}'", self.id))?;
            return Ok(Some(unit));
        }

        let description = match &service.description {
            Some(description) => render_template(description, &vars)?,
            None => format!("{} {}", self.id, version),
        };
        let mut unit = String::new();
        unit.push_str("[Unit]\n");
        unit.push_str(&format!("Description={description}\n"));
        unit.push_str("After=network.target\n\n");
        unit.push_str("[Service]\n");
        if let Some(user) = &service.user {
            unit.push_str(&format!("User={user}\n"));
        }
        if let Some(group) = &service.group {
            unit.push_str(&format!("Group={group}\n"));
        }
        for (key, value) in &service.environment {
            let value = render_template(value, &vars).with_context(|| {
                format!("failed rendering environment '{key}' for '{}'", self.id)
            })?;
            unit.push_str(&format!("Environment=\"{key}={value}\"\n"));
        }
        unit.push_str(&format!(
            "ExecStart={}\n",
            render_template(&service.exec_start, &vars)?
        ));
        if let Some(exec_stop) = &service.exec_stop {
            unit.push_str(&format!("ExecStop={}\n", render_template(exec_stop, &vars)?));
        }
        unit.push_str("Restart=always\n\n");
        unit.push_str("[Install]\n");
        unit.push_str("WantedBy=multi-user.target\n");
        Ok(Some(unit))
    }
}

/// Versions become directory names under the backup root, so they must be a
/// single plain path segment.
pub fn validate_version(version: &str) -> Result<()> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("version must not be empty"));
    }
    if trimmed != version {
        return Err(anyhow!("version must not have surrounding whitespace: '{version}'"));
    }
    if version == "." || version == ".." || version.starts_with('.') {
        return Err(anyhow!("version must not start with '.': '{version}'"));
    }
    if version
        .chars()
        .any(|ch| ch == '/' || ch == '\\' || ch.is_whitespace() || ch.is_control())
    {
        return Err(anyhow!("version contains invalid character(s): '{version}'"));
    }
    Ok(())
}

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::component::{ComponentId, ComponentSpec};
use crate::template::template_varies_with_version;

const DEFAULT_CONFIG_PATH: &str = "/etc/verkeep/verkeep.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub components: BTreeMap<ComponentId, ComponentSpec>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/verkeep")
}

fn default_history_limit() -> usize {
    2
}

fn default_step_timeout_secs() -> u64 {
    900
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

impl HostConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(input).context("failed to parse verkeep config")?;
        for (id, spec) in config.components.iter_mut() {
            spec.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn component(&self, id: &ComponentId) -> Option<&ComponentSpec> {
        self.components.get(id)
    }

    /// Component ids ordered so that every dependency precedes its dependents.
    pub fn dependency_order(&self) -> Vec<ComponentId> {
        let mut ordered = Vec::with_capacity(self.components.len());
        let mut placed = BTreeSet::new();
        for id in self.components.keys() {
            self.place_with_dependencies(id, &mut placed, &mut ordered);
        }
        ordered
    }

    /// Components whose `depends_on` names `id`.
    pub fn dependents_of(&self, id: &ComponentId) -> Vec<ComponentId> {
        self.components
            .values()
            .filter(|spec| spec.depends_on.as_ref() == Some(id))
            .map(|spec| spec.id.clone())
            .collect()
    }

    fn place_with_dependencies(
        &self,
        id: &ComponentId,
        placed: &mut BTreeSet<ComponentId>,
        ordered: &mut Vec<ComponentId>,
    ) {
        if placed.contains(id) {
            return;
        }
        if let Some(dependency) = self
            .components
            .get(id)
            .and_then(|spec| spec.depends_on.as_ref())
        {
            self.place_with_dependencies(dependency, placed, ordered);
        }
        placed.insert(id.clone());
        ordered.push(id.clone());
    }

    fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be at least 1"));
        }

        for (id, spec) in &self.components {
            if id.as_str().trim().is_empty() {
                return Err(anyhow!("component id must not be empty"));
            }
            if id.as_str().contains(['/', '\\']) || id.as_str() == "." || id.as_str() == ".." {
                return Err(anyhow!("component id '{id}' must be a plain name"));
            }
            if spec.version.trim().is_empty() {
                return Err(anyhow!("component '{id}' must declare a version"));
            }
            let varies = template_varies_with_version(&spec.install_root)
                .with_context(|| format!("component '{id}' has an invalid install_root template"))?;
            if !varies {
                return Err(anyhow!(
                    "component '{id}' install_root must contain {{version}}: {}",
                    spec.install_root
                ));
            }
            let varies = template_varies_with_version(&spec.source)
                .with_context(|| format!("component '{id}' has an invalid source template"))?;
            if !varies {
                return Err(anyhow!(
                    "component '{id}' source must contain {{version}}: {}",
                    spec.source
                ));
            }
            if let Some(dependency) = &spec.depends_on {
                if dependency == id {
                    return Err(anyhow!("component '{id}' depends on itself"));
                }
                if !self.components.contains_key(dependency) {
                    return Err(anyhow!(
                        "component '{id}' depends on unknown component '{dependency}'"
                    ));
                }
            }
            if let Some(env) = &spec.env {
                if env.var.trim().is_empty() || env.var.contains(['=', ' ']) {
                    return Err(anyhow!(
                        "component '{id}' env var name is invalid: '{}'",
                        env.var
                    ));
                }
            }
        }

        for id in self.components.keys() {
            let mut seen = BTreeSet::new();
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(anyhow!("dependency cycle detected at component '{id}'"));
                }
                cursor = self
                    .components
                    .get(current)
                    .and_then(|spec| spec.depends_on.as_ref());
            }
        }

        Ok(())
    }
}

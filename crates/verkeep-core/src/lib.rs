mod checksum;
mod component;
mod config;
mod template;

pub use checksum::{sha256_file_hex, sha256_hex, tree_sha256, verify_sha256_file, TreeDigest};
pub use component::{validate_version, ComponentId, ComponentSpec, EnvExport, ServiceSpec};
pub use config::{default_config_path, HostConfig};
pub use template::{render_template, TemplateVars};

#[cfg(test)]
mod tests;

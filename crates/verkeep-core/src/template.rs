use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::component::ComponentId;

#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub version: &'a str,
    pub install_root: Option<&'a Path>,
    pub service: Option<&'a str>,
    pub dependencies: Option<&'a BTreeMap<ComponentId, PathBuf>>,
}

impl<'a> TemplateVars<'a> {
    pub fn version(version: &'a str) -> Self {
        Self {
            version,
            install_root: None,
            service: None,
            dependencies: None,
        }
    }
}

/// Expands `{version}`, `{install_root}`, `{service}` and `{dep:<component>}`.
///
/// `{{` and `}}` produce literal braces. Unknown or unavailable placeholders are
/// errors rather than being passed through, so a typo in a unit template never
/// reaches the process supervisor.
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    key.push(next);
                }
                if !closed {
                    return Err(anyhow!("unterminated placeholder '{{{key}' in template"));
                }
                out.push_str(&resolve_placeholder(key.trim(), vars)?);
            }
            '}' => return Err(anyhow!("unmatched '}}' in template")),
            other => out.push(other),
        }
    }

    Ok(out)
}

fn resolve_placeholder(key: &str, vars: &TemplateVars<'_>) -> Result<String> {
    match key {
        "version" => Ok(vars.version.to_string()),
        "install_root" => vars
            .install_root
            .map(|path| path.display().to_string())
            .ok_or_else(|| anyhow!("placeholder {{install_root}} is not available here")),
        "service" => vars
            .service
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow!("placeholder {{service}} is not available here")),
        _ => {
            let Some(dependency) = key.strip_prefix("dep:") else {
                return Err(anyhow!("unknown template placeholder: {{{key}}}"));
            };
            let id = ComponentId::new(dependency.trim());
            vars.dependencies
                .and_then(|deps| deps.get(&id))
                .map(|path| path.display().to_string())
                .ok_or_else(|| {
                    anyhow!("dependency '{id}' has no installed root for placeholder {{{key}}}")
                })
        }
    }
}

/// True when `template` renders differently for different versions. Escaped
/// `{{version}}` is literal text and does not count.
pub(crate) fn template_varies_with_version(template: &str) -> Result<bool> {
    let first = render_template(template, &TemplateVars::version("0"))?;
    let second = render_template(template, &TemplateVars::version("1"))?;
    Ok(first != second)
}

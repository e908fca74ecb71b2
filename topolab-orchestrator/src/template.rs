//! Template rendering.
//!
//! Day-0 payloads, cloud-init files and simulator configurations are
//! rendered from text templates using `$name` / `${name}` placeholders.
//! Braced names may contain dashes (`${device-name}`). Unknown variables
//! render as empty strings and `$$` is a literal dollar.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Variables passed to a template.
pub type Variables = BTreeMap<String, String>;

/// Renders a named template to text.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, template: &str, variables: &Variables) -> Result<String>;
}

/// Substitute placeholders in `text`.
pub fn substitute(text: &str, variables: &Variables) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_braced_name(&braced[..end]) => {
                    out.push_str(lookup(variables, &braced[..end]));
                    rest = &braced[end + 1..];
                }
                _ => {
                    out.push('$');
                    rest = after;
                }
            }
        } else {
            let len = name_len(after);
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(lookup(variables, &after[..len]));
            }
            rest = &after[len..];
        }
    }

    out.push_str(rest);
    out
}

fn lookup<'a>(variables: &'a Variables, name: &str) -> &'a str {
    variables.get(name).map(String::as_str).unwrap_or("")
}

fn is_braced_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn name_len(s: &str) -> usize {
    let mut len = 0;
    for (i, c) in s.char_indices() {
        let valid = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !valid {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

/// Renderer over templates held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryRenderer {
    templates: HashMap<String, String>,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(name.into(), text.into());
        self
    }
}

#[async_trait]
impl TemplateRenderer for MemoryRenderer {
    async fn render(&self, template: &str, variables: &Variables) -> Result<String> {
        let text = self
            .templates
            .get(template)
            .ok_or_else(|| OrchestratorError::Render(format!("Template {} not found", template)))?;
        Ok(substitute(text, variables))
    }
}

/// Renderer reading templates from a directory.
#[derive(Debug, Clone)]
pub struct DirectoryRenderer {
    root: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TemplateRenderer for DirectoryRenderer {
    async fn render(&self, template: &str, variables: &Variables) -> Result<String> {
        if template.split('/').any(|part| part == "..") {
            return Err(OrchestratorError::Render(format!("Invalid template name {}", template)));
        }
        let path = self.root.join(template);
        debug!(path = %path.display(), "Loading template");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::Render(format!("{}: {}", path.display(), e)))?;
        Ok(substitute(&text, variables))
    }
}

//! Role templates — named Markdown fragments injected into the
//! prompt's role block.
//!
//! Two layers: a system directory shipped with the install and a user
//! directory under the data dir. User templates shadow system ones
//! with the same name; create/update/delete only ever touch the user
//! layer.

use std::path::{Path, PathBuf};

use serde::Serialize;

use ag_domain::error::{Error, Result};

const TEMPLATE_EXT: &str = "md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSource {
    System,
    User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub name: String,
    pub source: TemplateSource,
}

pub struct TemplateStore {
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl TemplateStore {
    pub fn new(system_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            system_dir: system_dir.into(),
            user_dir: user_dir.into(),
        }
    }

    fn validate_name(name: &str) -> Result<()> {
        let ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "invalid template name '{name}': use letters, digits, '-' and '_'"
            )))
        }
    }

    fn file_in(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.{TEMPLATE_EXT}"))
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_owned)
            })
            .collect();
        names.sort();
        names
    }

    /// List all templates; a user template shadows the system one with
    /// the same name.
    pub fn list(&self) -> Vec<TemplateInfo> {
        let user: Vec<String> = Self::names_in(&self.user_dir);
        let mut templates: Vec<TemplateInfo> = user
            .iter()
            .map(|name| TemplateInfo {
                name: name.clone(),
                source: TemplateSource::User,
            })
            .collect();
        for name in Self::names_in(&self.system_dir) {
            if !user.contains(&name) {
                templates.push(TemplateInfo {
                    name,
                    source: TemplateSource::System,
                });
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub fn get(&self, name: &str) -> Result<String> {
        Self::validate_name(name)?;
        for dir in [&self.user_dir, &self.system_dir] {
            let path = Self::file_in(dir, name);
            if path.exists() {
                return Ok(std::fs::read_to_string(&path)?);
            }
        }
        Err(Error::not_found("template", name))
    }

    /// Create a new user template. Fails if a user template with the
    /// name exists (shadowing a system template is fine).
    pub fn create(&self, name: &str, content: &str) -> Result<()> {
        Self::validate_name(name)?;
        let path = Self::file_in(&self.user_dir, name);
        if path.exists() {
            return Err(Error::Validation(format!(
                "template '{name}' already exists"
            )));
        }
        std::fs::create_dir_all(&self.user_dir)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Write a user template, creating or overwriting (and shadowing
    /// any system template of the same name).
    pub fn update(&self, name: &str, content: &str) -> Result<()> {
        Self::validate_name(name)?;
        std::fs::create_dir_all(&self.user_dir)?;
        std::fs::write(Self::file_in(&self.user_dir, name), content)?;
        Ok(())
    }

    /// Delete a user template. System templates cannot be deleted —
    /// deleting a shadowing user template reveals the system one.
    pub fn delete(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        let path = Self::file_in(&self.user_dir, name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(());
        }
        if Self::file_in(&self.system_dir, name).exists() {
            return Err(Error::Validation(format!(
                "'{name}' is a system template and cannot be deleted"
            )));
        }
        Err(Error::not_found("template", name))
    }
}

//! Configuration templates shipped by addons.
//!
//! Files ending in `.tmpl` are rendered in place at install time: the output
//! is written beside the template under the name without the extension and
//! the template is deleted.

use crate::config::types::{GearError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const TEMPLATE_EXT: &str = ".tmpl";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)?)\}").expect("valid placeholder regex")
});

pub trait TemplateRenderer {
    /// Render one template body
    fn render(
        &self,
        input: &str,
        env: &BTreeMap<String, String>,
        config: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Replace `${NAME}` placeholders using `lookup`, leaving unknown ones intact
pub fn expand_placeholders<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// `${NAME}` from the environment, `${config.NAME}` from the global
/// template configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(
        &self,
        input: &str,
        env: &BTreeMap<String, String>,
        config: &BTreeMap<String, String>,
    ) -> Result<String> {
        Ok(expand_placeholders(input, |name| match name.strip_prefix("config.") {
            Some(key) => config.get(key).cloned(),
            None => env.get(name).cloned(),
        }))
    }
}

/// Render every template under `dir`, returning the outputs written
pub fn process_templates(
    renderer: &dyn TemplateRenderer,
    dir: &Path,
    env: &BTreeMap<String, String>,
    config: &BTreeMap<String, String>,
) -> Result<Vec<PathBuf>> {
    let templates: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(TEMPLATE_EXT))
        .map(|e| e.into_path())
        .collect();

    let mut outputs = Vec::with_capacity(templates.len());
    for input in templates {
        let name = input.to_string_lossy();
        let output = PathBuf::from(&name[..name.len() - TEMPLATE_EXT.len()]);

        let body = std::fs::read_to_string(&input).map_err(|e| GearError::fs(&input, e))?;
        let rendered = renderer.render(&body, env, config)?;
        std::fs::write(&output, rendered).map_err(|e| GearError::fs(&output, e))?;
        std::fs::remove_file(&input).map_err(|e| GearError::fs(&input, e))?;

        log::debug!("Rendered {}", output.display());
        outputs.push(output);
    }
    Ok(outputs)
}

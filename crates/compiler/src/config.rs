//! Project configuration (`brio.toml`).
//!
//! An optional per-project file read by the CLI tools. It carries the
//! settings that belong to the project rather than to one invocation,
//! chiefly the module search path.
//!
//! ```toml
//! [project]
//! import-paths = ["lib", "vendor"]
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name the tools look for next to the file being compiled or run.
pub const CONFIG_FILE: &str = "brio.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project: ProjectSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectSection {
    /// Module search prefixes, relative to the config file's directory.
    #[serde(default, rename = "import-paths")]
    pub import_paths: Vec<PathBuf>,
}

impl ProjectConfig {
    /// Parse a configuration from TOML text.
    pub fn parse(text: &str) -> Result<ProjectConfig, String> {
        toml::from_str(text).map_err(|e| format!("invalid {}: {}", CONFIG_FILE, e))
    }

    /// Load the config next to `source`, if one exists. Import paths are
    /// resolved relative to the config file's directory.
    pub fn discover(source: &Path) -> Result<Option<ProjectConfig>, String> {
        let dir = source.parent().unwrap_or_else(|| Path::new("."));
        let candidate = dir.join(CONFIG_FILE);
        if !candidate.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&candidate)
            .map_err(|e| format!("failed to read {}: {}", candidate.display(), e))?;
        let mut config = ProjectConfig::parse(&text)?;
        for p in &mut config.project.import_paths {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        }
        Ok(Some(config))
    }
}

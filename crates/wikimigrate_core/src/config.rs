use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "wikimigrate.toml";
pub const VALIDATION_STATE_FILENAME: &str = ".validation-state.json";
pub const NAME_FIXES_FILENAME: &str = ".page-name-fixes.json";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub wiki: WikiSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub space_key: Option<String>,
    pub root_parent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub root_dir: Option<String>,
    pub project_name: Option<String>,
}

impl MigrationConfig {
    /// Confluence base URL: env CONFLUENCE_BASE_URL > config. Trailing slashes
    /// are stripped so link construction can always append `/pages/{id}`.
    pub fn base_url(&self) -> Result<String> {
        match resolve("CONFLUENCE_BASE_URL", &self.confluence.base_url) {
            Some(value) => Ok(value.trim_end_matches('/').to_string()),
            None => bail!(
                "Confluence base URL is not configured.\n\
                 Set CONFLUENCE_BASE_URL or [confluence].base_url in {DEFAULT_CONFIG_FILENAME}."
            ),
        }
    }

    pub fn username(&self) -> Result<String> {
        resolve("CONFLUENCE_USERNAME", &self.confluence.username).ok_or_else(|| {
            anyhow::anyhow!(
                "Confluence username is not configured.\n\
                 Set CONFLUENCE_USERNAME or [confluence].username in {DEFAULT_CONFIG_FILENAME}."
            )
        })
    }

    pub fn api_token(&self) -> Result<String> {
        resolve("CONFLUENCE_API_TOKEN", &self.confluence.api_token).ok_or_else(|| {
            anyhow::anyhow!(
                "Confluence API token is not configured.\n\
                 Set CONFLUENCE_API_TOKEN (recommended, keeps the credential out of the\n\
                 config file) or [confluence].api_token in {DEFAULT_CONFIG_FILENAME}."
            )
        })
    }

    pub fn space_key(&self) -> Result<String> {
        resolve("CONFLUENCE_SPACE_KEY", &self.confluence.space_key).ok_or_else(|| {
            anyhow::anyhow!(
                "Confluence space key is not configured.\n\
                 Set CONFLUENCE_SPACE_KEY or [confluence].space_key in {DEFAULT_CONFIG_FILENAME}."
            )
        })
    }

    /// Optional: when absent the publisher parents root pages under the space homepage.
    pub fn root_parent_id(&self) -> Option<String> {
        resolve("CONFLUENCE_ROOT_PARENT_ID", &self.confluence.root_parent_id)
    }

    /// Wiki export root: flag > env WIKI_ROOT_DIR > config.
    pub fn wiki_root(&self, flag_override: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = flag_override {
            return Ok(path.to_path_buf());
        }
        match resolve("WIKI_ROOT_DIR", &self.wiki.root_dir) {
            Some(value) => Ok(PathBuf::from(value)),
            None => bail!(
                "Wiki root directory is not configured.\n\
                 Pass --wiki-dir, set WIKI_ROOT_DIR, or set [wiki].root_dir in {DEFAULT_CONFIG_FILENAME}."
            ),
        }
    }

    /// Project name used as the collision-breaking title prefix. Falls back to the
    /// space key so `fix-names` works without extra configuration.
    pub fn project_name(&self) -> Result<String> {
        if let Some(value) = resolve("WIKI_PROJECT_NAME", &self.wiki.project_name) {
            return Ok(value);
        }
        self.space_key()
    }

    /// State files live next to the wiki root so the reconciliation queue travels
    /// with the export it describes.
    pub fn validation_state_path(&self, wiki_root: &Path) -> PathBuf {
        wiki_root.join(VALIDATION_STATE_FILENAME)
    }

    pub fn name_fixes_path(&self, wiki_root: &Path) -> PathBuf {
        wiki_root.join(NAME_FIXES_FILENAME)
    }
}

fn resolve(env_key: &str, config_value: &Option<String>) -> Option<String> {
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    config_value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if the file
/// doesn't exist; the accessors produce the per-field remediation messages.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

//! Configuration types and file loading for the workbench service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mask::SensitivityPolicy;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub guard: GuardConfig,
    pub fonts: FontConfig,
    pub sensitivity: SensitivityPolicy,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// Where the database, artifacts and case data live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file for drafts, mappings, templates and the
    /// security log.
    pub db_path: PathBuf,
    /// Filesystem root backing the artifact store. Storage URIs such as
    /// `/cases/<id>/drafts/...` resolve underneath it.
    pub artifact_root: PathBuf,
    /// Directory of per-case JSON records consumed by the autofill map.
    pub case_data_dir: PathBuf,
    /// Storage URI prefix scanned at startup to seed the template registry.
    pub template_uri_root: String,
}

/// Access Guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Extra root scopes allowed on top of the built-in case/template/export
    /// roots.
    pub extra_roots: Vec<String>,
}

/// Font asset service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FontConfig {
    pub font_dir: PathBuf,
    /// Exact file names that may be served. Anything else is a 404 even if
    /// present on disk.
    pub allowed: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/workbench.db"),
            artifact_root: PathBuf::from("data/artifacts"),
            case_data_dir: PathBuf::from("data/case-data"),
            template_uri_root: "/templates".to_string(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            extra_roots: Vec::new(),
        }
    }
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            font_dir: PathBuf::from("assets/fonts"),
            allowed: vec![
                "Inter-SemiBold.ttf".to_string(),
                "NotoSans-Regular.ttf".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Loads configuration from a JSON or YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .or_else(|_| serde_yaml::from_str(&content))
            .map_err(|e| Error::Config(format!("failed to parse {path}: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind_addr.is_empty() {
            return Err(Error::Config("bind_addr must be non-empty".into()));
        }
        if !self.storage.template_uri_root.starts_with('/') {
            return Err(Error::Config(
                "template_uri_root must be an absolute storage URI".into(),
            ));
        }
        if self.fonts.allowed.is_empty() {
            return Err(Error::Config("font allow-list must not be empty".into()));
        }
        Ok(())
    }
}

//! Engine configuration for tf-pilot.
//!
//! Supports layered configuration: defaults → user → explicit file → env

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Repo config filename used unless the operator overrides it
pub const DEFAULT_REPO_CONFIG: &str = "atlantis.yaml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where lock state and repo checkouts live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Repo config filename, relative to the repo root
    #[serde(default = "default_repo_config_filename")]
    pub repo_config_filename: String,
    /// Permit a non-default `repo_config_filename`
    #[serde(default)]
    pub allow_repo_config: bool,
    /// Version used when a project doesn't pin one; unset means whatever is installed
    #[serde(default)]
    pub default_terraform_version: Option<String>,
    #[serde(default)]
    pub terraform: TerraformConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            repo_config_filename: default_repo_config_filename(),
            allow_repo_config: false,
            default_terraform_version: None,
            terraform: TerraformConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration with hierarchy: defaults → user → explicit file → env
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();

        // 1. Start with defaults
        builder = builder.add_source(
            config::File::from_str(
                include_str!("../default_config.toml"),
                config::FileFormat::Toml,
            )
            .required(false),
        );

        // 2. User config (~/.config/tf-pilot/config.toml)
        if let Some(config_dir) = directories::ProjectDirs::from("com", "tf-pilot", "tf-pilot") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(File::from(user_config).required(false));
            }
        }

        // 3. Explicit --config file must exist
        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        // 4. Environment variables (TF_PILOT__*)
        builder = builder.add_source(
            Environment::with_prefix("TF_PILOT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut loaded: Self = config
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        loaded.data_dir = expand_home(&loaded.data_dir);
        loaded.validate()?;
        Ok(loaded)
    }

    /// Startup checks; failures here abort before any command is served
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo_config_filename != DEFAULT_REPO_CONFIG && !self.allow_repo_config {
            return Err(ConfigError::Invalid(
                "custom repo_config_filename cannot be specified if allow_repo_config is false"
                    .to_string(),
            ));
        }
        if self.repo_config_filename.is_empty()
            || Path::new(&self.repo_config_filename).is_absolute()
        {
            return Err(ConfigError::Invalid(format!(
                "repo_config_filename {:?} must be a relative path",
                self.repo_config_filename
            )));
        }
        self.default_version()?;
        if self.terraform.step_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "terraform.step_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The parsed default terraform version
    pub fn default_version(&self) -> Result<Option<semver::Version>, ConfigError> {
        self.default_terraform_version
            .as_deref()
            .map(|v| {
                crate::domain::parse_version(v).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "default_terraform_version {:?} is not a valid version: {}",
                        v, e
                    ))
                })
            })
            .transpose()
    }

    /// File holding the persisted lock arena
    pub fn locks_file(&self) -> PathBuf {
        self.data_dir.join("locks.json")
    }

    /// Directory holding pull request checkouts
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}

/// Terraform invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerraformConfig {
    /// Binary name; versioned runs use `<binary><version>`, e.g. `terraform0.11.7`
    #[serde(default = "default_terraform_binary")]
    pub binary: String,
    /// Upper bound on a single step; a hung process fails the run
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: default_terraform_binary(),
            step_timeout_seconds: default_step_timeout_seconds(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.tf-pilot")
}

fn default_repo_config_filename() -> String {
    DEFAULT_REPO_CONFIG.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_terraform_binary() -> String {
    "terraform".to_string()
}

fn default_step_timeout_seconds() -> u64 {
    3600
}

/// Replace a leading `~` with the user's home directory
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

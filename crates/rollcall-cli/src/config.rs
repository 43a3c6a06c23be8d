use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rollcall_core::{DescriptorSpec, Policy};
use serde::{Deserialize, Serialize};

/// CLI configuration: TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance a match must stay strictly below.
    pub threshold: f32,
    /// Timeout in seconds for one descriptor extraction.
    pub extraction_timeout_secs: u64,
    /// Descriptor length produced by the embedding model.
    pub descriptor_dim: usize,
    /// Tag stamped on every descriptor; stored descriptors with another tag are rejected.
    pub model_version: String,
    /// Embedding program and its arguments.
    pub provider_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("attendance.db"),
            threshold: rollcall_core::DEFAULT_THRESHOLD,
            extraction_timeout_secs: 10,
            descriptor_dim: 128,
            model_version: "faceapi-resnet-v1".to_string(),
            provider_command: vec!["rollcall-embed".to_string()],
        }
    }
}

impl Config {
    /// Load from `path` (or the default location) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `ROLLCALL_*` variables. Unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&mut self.threshold, var("ROLLCALL_THRESHOLD"));
        override_parsed(
            &mut self.extraction_timeout_secs,
            var("ROLLCALL_EXTRACTION_TIMEOUT_SECS"),
        );
        override_parsed(&mut self.descriptor_dim, var("ROLLCALL_DESCRIPTOR_DIM"));
        if let Some(v) = var("ROLLCALL_MODEL_VERSION") {
            self.model_version = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if self.descriptor_dim == 0 {
            bail!("descriptor_dim must be greater than zero");
        }
        if self.extraction_timeout_secs == 0 {
            bail!("extraction_timeout_secs must be greater than zero");
        }
        if self.model_version.trim().is_empty() {
            bail!("model_version must not be empty");
        }
        if self.provider_command.is_empty() {
            bail!("provider_command must name a program");
        }
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy::new(DescriptorSpec::new(self.descriptor_dim, &self.model_version))
            .with_threshold(self.threshold)
            .with_extraction_timeout(Duration::from_secs(self.extraction_timeout_secs))
    }
}

fn override_parsed<T: std::str::FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *field = parsed;
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("ROLLCALL_CONFIG") {
        return PathBuf::from(p);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("rollcall")
        .join("config.toml")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("rollcall")
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

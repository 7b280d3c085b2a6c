//! Dispatcher configuration: defaults, JSON file, environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path of a JSON config file loaded before the other overrides.
pub const ENV_CONFIG: &str = "SAGE_DISPATCH_CONFIG";
pub const ENV_DISABLE: &str = "SAGE_DISPATCH_DISABLE";
pub const ENV_LIBRARY: &str = "SAGE_DISPATCH_LIB";
pub const ENV_MIN_MAJOR: &str = "SAGE_DISPATCH_MIN_MAJOR";
pub const ENV_HEAD_DIMS: &str = "SAGE_DISPATCH_HEAD_DIMS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Capabilities of the optimized kernel, known before it is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelProfile {
    pub name: String,
    pub supports_mask: bool,
    pub supports_dropout: bool,
    /// Allowed head dimensions; `None` accepts any.
    pub head_dims: Option<Vec<usize>>,
}

impl Default for KernelProfile {
    fn default() -> Self {
        Self::sage_attention()
    }
}

impl KernelProfile {
    /// SageAttention: no masks, no dropout, head dims 64/96/128.
    pub fn sage_attention() -> Self {
        Self {
            name: "SageAttention".to_string(),
            supports_mask: false,
            supports_dropout: false,
            head_dims: Some(vec![64, 96, 128]),
        }
    }

    /// A kernel that accepts every call the reference accepts.
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supports_mask: true,
            supports_dropout: true,
            head_dims: None,
        }
    }

    pub fn accepts_head_dim(&self, head_dim: usize) -> bool {
        self.head_dims
            .as_ref()
            .map_or(true, |dims| dims.contains(&head_dim))
    }
}

/// Where and how to load the optimized kernel library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Candidate library paths or names, tried in order.
    pub search_paths: Vec<PathBuf>,
    pub forward_symbol: String,
    /// Optional one-time setup entry point (kernel compilation).
    pub init_symbol: String,
    /// Optional last-error message accessor.
    pub error_symbol: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("libsageattention.so"),
                PathBuf::from("/usr/local/lib/libsageattention.so"),
                PathBuf::from("/opt/sageattention/lib/libsageattention.so"),
            ],
            forward_symbol: "sageattn_forward".to_string(),
            init_symbol: "sageattn_init".to_string(),
            error_symbol: "sageattn_last_error".to_string(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// When false, installation leaves the host untouched.
    pub enabled: bool,
    pub min_compute_major: i32,
    pub kernel: KernelProfile,
    pub library: LibraryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_compute_major: 8,
            kernel: KernelProfile::default(),
            library: LibraryConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// The file named by `SAGE_DISPATCH_CONFIG` (or defaults), then the
    /// remaining `SAGE_DISPATCH_*` overrides on top.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_json_file(path.trim())?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Load a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded dispatch config from: {:?}", path);
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DISABLE) {
            self.enabled = !parse_flag(ENV_DISABLE, &value)?;
        }

        if let Some(value) = lookup(ENV_LIBRARY) {
            // An explicit library goes first; defaults stay as fallbacks.
            self.library.search_paths.insert(0, PathBuf::from(value));
        }

        if let Some(value) = lookup(ENV_MIN_MAJOR) {
            self.min_compute_major = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_MIN_MAJOR,
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(ENV_HEAD_DIMS) {
            let trimmed = value.trim();
            self.kernel.head_dims = if trimmed.is_empty() || trimmed == "any" {
                None
            } else {
                let dims = trimmed
                    .split(',')
                    .map(|d| d.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::Env {
                        var: ENV_HEAD_DIMS,
                        value: value.clone(),
                    })?;
                Some(dims)
            };
        }

        Ok(())
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert!(config.enabled);
        assert_eq!(config.min_compute_major, 8);
        assert!(!config.kernel.supports_mask);
        assert!(config.kernel.accepts_head_dim(128));
        assert!(!config.kernel.accepts_head_dim(80));
        assert_eq!(config.library.forward_symbol, "sageattn_forward");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DispatchConfig::default();
        config
            .apply_env(env(&[
                (ENV_DISABLE, "yes"),
                (ENV_LIBRARY, "/tmp/libcustom.so"),
                (ENV_MIN_MAJOR, "9"),
                (ENV_HEAD_DIMS, "64, 128"),
            ]))
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.min_compute_major, 9);
        assert_eq!(config.kernel.head_dims, Some(vec![64, 128]));
        assert_eq!(config.library.search_paths[0], PathBuf::from("/tmp/libcustom.so"));

        config.apply_env(env(&[(ENV_HEAD_DIMS, "any")])).unwrap();
        assert!(config.kernel.accepts_head_dim(80));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = DispatchConfig::default();
        let err = config.apply_env(env(&[(ENV_MIN_MAJOR, "eight")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_MIN_MAJOR, .. }));
        assert!(config.apply_env(env(&[(ENV_DISABLE, "maybe")])).is_err());
    }

    #[test]
    fn test_json_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(
            &path,
            r#"{ "min_compute_major": 9, "kernel": { "name": "fa3", "supports_mask": true } }"#,
        )
        .unwrap();

        let config = DispatchConfig::from_json_file(&path).unwrap();
        assert_eq!(config.min_compute_major, 9);
        assert_eq!(config.kernel.name, "fa3");
        assert!(config.kernel.supports_mask);
        assert!(config.enabled);
        assert_eq!(config.library, LibraryConfig::default());
    }

    #[test]
    fn test_config_file_from_env_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(&path, r#"{ "min_compute_major": 9, "kernel": { "name": "fa3" } }"#).unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = DispatchConfig::from_lookup(env(&[(ENV_CONFIG, path_str.as_str())])).unwrap();
        assert_eq!(config.min_compute_major, 9);
        assert_eq!(config.kernel.name, "fa3");

        let config = DispatchConfig::from_lookup(env(&[
            (ENV_CONFIG, path_str.as_str()),
            (ENV_MIN_MAJOR, "10"),
        ]))
        .unwrap();
        assert_eq!(config.min_compute_major, 10);
        assert_eq!(config.kernel.name, "fa3");

        let config = DispatchConfig::from_lookup(env(&[(ENV_CONFIG, " ")])).unwrap();
        assert_eq!(config, DispatchConfig::default());

        let missing = dir.path().join("missing.json").to_string_lossy().into_owned();
        assert!(matches!(
            DispatchConfig::from_lookup(env(&[(ENV_CONFIG, missing.as_str())])),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DispatchConfig::from_json_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            DispatchConfig::from_json_file(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}

use super::Config;
use crate::core::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name looked up in the base directory when no explicit file is given.
pub const DEFAULT_CONFIG_FILE: &str = "device-test-runner.toml";

/// Configuration loader that supports multiple sources.
pub struct ConfigLoader {
    /// Directory searched for [`DEFAULT_CONFIG_FILE`].
    base_dir: Option<PathBuf>,
    /// Explicit configuration file path; must exist when set.
    config_file: Option<PathBuf>,
    /// Whether profile selection and env overrides are honored.
    use_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader.
    pub fn new() -> Self {
        Self {
            base_dir: None,
            config_file: None,
            use_env: true,
        }
    }

    /// Set the directory searched for `device-test-runner.toml`.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Set a standalone configuration file path.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Ignore `DEVICE_TEST_RUNNER_*` variables.
    pub fn no_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Load configuration from all enabled sources.
    ///
    /// Priority (later sources override earlier):
    /// 1. Default values
    /// 2. Standalone TOML file
    /// 3. Profile overlay (`DEVICE_TEST_RUNNER_PROFILE`)
    /// 4. Individual env var overrides (`DEVICE_TEST_RUNNER_*`)
    pub fn load(self) -> Result<Config> {
        let mut config = Config::default();
        let mut profiles: HashMap<String, serde_json::Value> = HashMap::new();

        if let Some(path) = self.resolve_config_file()? {
            let value = Self::load_toml_file(&path)?;
            extract_profiles(&value, &mut profiles);
            config = serde_json::from_value(value).map_err(|e| {
                Error::config(format!("invalid config file {}: {}", path.display(), e))
            })?;
            tracing::debug!(path = %path.display(), "loaded configuration file");
        }

        if !self.use_env {
            return Ok(config);
        }

        if let Some(profile_name) = super::env::get_profile_name() {
            config = apply_profile(config, &profile_name, &profiles)?;
        }

        super::env::apply_env_overrides(&mut config);

        Ok(config)
    }

    fn resolve_config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(Error::FileNotFound(path.clone()));
            }
            return Ok(Some(path.clone()));
        }

        Ok(self
            .base_dir
            .as_ref()
            .map(|dir| dir.join(DEFAULT_CONFIG_FILE))
            .filter(|p| p.is_file()))
    }

    /// Load a standalone TOML file as a JSON value so profiles can be split off.
    fn load_toml_file(path: &Path) -> Result<serde_json::Value> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file: {}", e)))?;

        let value: toml::Value = toml::from_str(&content)
            .map_err(|e| Error::config(format!("failed to parse TOML config: {}", e)))?;

        Ok(serde_json::to_value(value)?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_profile(
    config: Config,
    profile_name: &str,
    profiles: &HashMap<String, serde_json::Value>,
) -> Result<Config> {
    let profile_value = profiles.get(profile_name).ok_or_else(|| {
        let mut available: Vec<&str> = profiles.keys().map(|s| s.as_str()).collect();
        available.sort_unstable();
        if available.is_empty() {
            Error::config(format!(
                "profile '{}' not found (no profiles defined)",
                profile_name,
            ))
        } else {
            Error::config(format!(
                "profile '{}' not found. Available profiles: {}",
                profile_name,
                available.join(", "),
            ))
        }
    })?;

    let mut base_value = serde_json::to_value(&config)
        .map_err(|e| Error::config(format!("failed to serialize config: {}", e)))?;
    deep_merge(&mut base_value, profile_value);
    serde_json::from_value(base_value)
        .map_err(|e| Error::config(format!("failed to apply profile '{}': {}", profile_name, e)))
}

/// Extract profile definitions from a config JSON value.
///
/// Profiles live at `value["profiles"]` as `{ name: { ...config fields... } }`.
fn extract_profiles(value: &serde_json::Value, profiles: &mut HashMap<String, serde_json::Value>) {
    if let Some(serde_json::Value::Object(map)) = value.get("profiles") {
        for (name, profile_value) in map {
            profiles.insert(name.clone(), profile_value.clone());
        }
    }
}

/// Recursively deep-merge `overlay` into `base`.
///
/// - Objects: keys are merged recursively (overlay keys win for conflicts).
/// - Scalars and arrays: overlay replaces base entirely.
pub(crate) fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let entry = base_map
                    .entry(key.clone())
                    .or_insert(serde_json::Value::Null);
                deep_merge(entry, overlay_val);
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

//! TOML configuration loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `~/.chorus/config.toml` (or the path in `CHORUS_CONFIG`)
//! 2. Apply `CHORUS_*` environment variable overrides
//! 3. Fall back to [`AppConfig::default()`] if the file is missing
//!
//! # Atomic save
//! Writes to `<path>.tmp` then renames to `<path>` so a crash mid-write
//! cannot corrupt the config file.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::AppConfig;

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.chorus/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".chorus").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`AppConfig`] from the given path, falling back to defaults if the
/// file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load config from the default path (or `CHORUS_CONFIG`).
pub fn load_default_config() -> AppConfig {
    let path = env::var("CHORUS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
        });

    load_config(&path).unwrap_or_default()
}

// ─── save_config ─────────────────────────────────────────────────────────────

/// Atomically persist `config` to `path`.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), String> {
    let serialized =
        toml::to_string_pretty(config).map_err(|e| format!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, serialized).map_err(|e| format!("failed to write {tmp:?}: {e}"))?;
    fs::rename(&tmp, path).map_err(|e| format!("failed to move config into place: {e}"))?;
    Ok(())
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply `CHORUS_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `CHORUS_HOME`            → `runtime.home`
/// - `CHORUS_PROVIDER_KIND`   → `provider.default_kind`
/// - `CHORUS_PROVIDER_MODEL`  → `provider.default_model`
/// - `CHORUS_PROVIDER_URL`    → `provider.base_url`
/// - `CHORUS_MAX_ITERATIONS`  → `runtime.max_iterations`
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("CHORUS_HOME") {
        config.runtime.home = PathBuf::from(v);
    }
    if let Ok(v) = env::var("CHORUS_PROVIDER_KIND") {
        config.provider.default_kind = v;
    }
    if let Ok(v) = env::var("CHORUS_PROVIDER_MODEL") {
        config.provider.default_model = v;
    }
    if let Ok(v) = env::var("CHORUS_PROVIDER_URL") {
        config.provider.base_url = v;
    }
    if let Ok(v) = env::var("CHORUS_MAX_ITERATIONS")
        && let Ok(n) = v.parse()
    {
        config.runtime.max_iterations = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.runtime.max_iterations, 25);
    }

    #[test]
    fn malformed_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is [not toml").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = AppConfig::default();
        cfg.provider.default_model = "test-model".into();
        save_config(&cfg, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.provider.default_model, "test-model");
        // No temp file left behind.
        assert!(!path.with_extension("toml.tmp").exists());
    }
}

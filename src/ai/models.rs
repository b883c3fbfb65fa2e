//! On-disk cache of known model ids (`<home>/available_models`).
//!
//! Refreshed opportunistically; consumers treat it as advisory.  A model id
//! missing from the cache is flagged, not rejected — the provider remains
//! the authority.

use std::path::{Path, PathBuf};

/// One model id per line.
#[derive(Debug, Clone)]
pub struct ModelCache {
    path: PathBuf,
}

impl ModelCache {
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join("available_models"),
        }
    }

    /// All cached model ids; empty when the cache has never been written.
    pub fn load(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .map(|s| {
                s.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the cache contents.
    pub fn save(&self, models: &[String]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, models.join("\n"))
    }

    /// Advisory membership check.  An empty cache knows nothing and vouches
    /// for everything.
    pub fn is_known(&self, model: &str) -> bool {
        let models = self.load();
        models.is_empty() || models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_cache_vouches_for_everything() {
        let home = TempDir::new().unwrap();
        let cache = ModelCache::new(home.path());
        assert!(cache.load().is_empty());
        assert!(cache.is_known("anything"));
    }

    #[test]
    fn save_then_check() {
        let home = TempDir::new().unwrap();
        let cache = ModelCache::new(home.path());
        cache
            .save(&["claude-sonnet-4-5".into(), "gpt-4o".into()])
            .unwrap();
        assert!(cache.is_known("gpt-4o"));
        assert!(!cache.is_known("made-up-model"));
        assert_eq!(cache.load().len(), 2);
    }

    #[test]
    fn blank_lines_ignored() {
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join("available_models"), "a\n\n  \nb\n").unwrap();
        let cache = ModelCache::new(home.path());
        assert_eq!(cache.load(), vec!["a", "b"]);
    }
}

//! Configuration for the snapshot engine: a TOML document under
//! `.claude-rewind/config.toml`, merged over built-in defaults and
//! validated on load.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RewindError};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub max_snapshots: u32,
    pub compression_enabled: bool,
    pub cleanup_after_days: u32,
    pub max_disk_usage_mb: u64,
    pub compression_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 100,
            compression_enabled: true,
            cleanup_after_days: 30,
            max_disk_usage_mb: 1000,
            compression_level: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub theme: String,
    pub diff_algorithm: String,
    pub show_line_numbers: bool,
    pub context_lines: u32,
    pub syntax_highlighting: bool,
    pub progress_indicators: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            diff_algorithm: "unified".to_string(),
            show_line_numbers: true,
            context_lines: 3,
            syntax_highlighting: true,
            progress_indicators: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HooksConfig {
    pub pre_snapshot_script: Option<PathBuf>,
    pub post_rollback_script: Option<PathBuf>,
    pub claude_integration_enabled: bool,
    pub auto_snapshot_enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GitIntegrationConfig {
    pub respect_gitignore: bool,
    pub auto_commit_rollbacks: bool,
    pub include_git_metadata: bool,
    pub track_git_changes: bool,
}

impl Default for GitIntegrationConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            auto_commit_rollbacks: false,
            include_git_metadata: true,
            track_git_changes: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_file_size_mb: u64,
    pub parallel_processing: bool,
    pub memory_limit_mb: u64,
    pub snapshot_timeout_seconds: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50,
            parallel_processing: true,
            memory_limit_mb: 500,
            snapshot_timeout_seconds: 30,
        }
    }
}

/// Complete, validated configuration for one project's `.claude-rewind`
/// directory.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RewindConfig {
    pub storage: StorageConfig,
    pub display: DisplayConfig,
    pub hooks: HooksConfig,
    pub git_integration: GitIntegrationConfig,
    pub performance: PerformanceConfig,
}

const ALLOWED_THEMES: [&str; 3] = ["dark", "light", "auto"];
const ALLOWED_DIFF_ALGORITHMS: [&str; 3] = ["unified", "side-by-side", "patch"];

impl RewindConfig {
    pub const FILE_NAME: &'static str = "config.toml";

    /// Load configuration from `path`. A missing file yields all-defaults;
    /// a present-but-malformed file is always a hard `Config` error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let text = fs::read_to_string(path)?;
        let config: RewindConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text =
            toml::to_string_pretty(self).map_err(|e| RewindError::config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Enforce every invariant from the on-disk config table: positive
    /// counts/sizes, bounded ranges, and that any configured hook script
    /// actually exists.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.storage.max_snapshots == 0 {
            errors.push("storage.max_snapshots must be greater than 0".to_string());
        }
        if self.storage.max_disk_usage_mb == 0 {
            errors.push("storage.max_disk_usage_mb must be greater than 0".to_string());
        }
        if !(1..=22).contains(&self.storage.compression_level) {
            errors.push("storage.compression_level must be between 1 and 22".to_string());
        }

        if !ALLOWED_THEMES.contains(&self.display.theme.as_str()) {
            errors.push("display.theme must be 'dark', 'light', or 'auto'".to_string());
        }
        if !ALLOWED_DIFF_ALGORITHMS.contains(&self.display.diff_algorithm.as_str()) {
            errors.push(
                "display.diff_algorithm must be 'unified', 'side-by-side', or 'patch'"
                    .to_string(),
            );
        }

        if self.performance.max_file_size_mb == 0 {
            errors.push("performance.max_file_size_mb must be greater than 0".to_string());
        }
        if self.performance.memory_limit_mb == 0 {
            errors.push("performance.memory_limit_mb must be greater than 0".to_string());
        }
        if self.performance.snapshot_timeout_seconds == 0 {
            errors.push("performance.snapshot_timeout_seconds must be greater than 0".to_string());
        }

        for script in [
            &self.hooks.pre_snapshot_script,
            &self.hooks.post_rollback_script,
        ]
        .into_iter()
        .flatten()
        {
            if !script.exists() {
                errors.push(format!(
                    "hook script does not exist: {}",
                    script.display()
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RewindError::config(errors.join("; ")))
        }
    }

    /// Size threshold in bytes above which the scanner skips a file.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.performance.max_file_size_mb * 1024 * 1024
    }

    /// Size threshold in bytes above which the disk retention cap fires.
    pub fn max_disk_usage_bytes(&self) -> u64 {
        self.storage.max_disk_usage_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RewindConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_compression_level() {
        let mut config = RewindConfig::default();
        config.storage.compression_level = 99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_theme() {
        let mut config = RewindConfig::default();
        config.display.theme = "neon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_hook_script() {
        let mut config = RewindConfig::default();
        config.hooks.pre_snapshot_script = Some(PathBuf::from("/nonexistent/hook.sh"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RewindConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, RewindConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = RewindConfig::default();
        config.storage.max_snapshots = 42;
        config.save(&path).unwrap();
        let loaded = RewindConfig::load(&path).unwrap();
        assert_eq!(loaded.storage.max_snapshots, 42);
    }

    #[test]
    fn malformed_file_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not valid toml {{{").unwrap();
        assert!(RewindConfig::load(&path).is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "unknown_section = true\n").unwrap();
        assert!(RewindConfig::load(&path).is_err());
    }
}

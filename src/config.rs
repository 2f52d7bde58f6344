//! On-disk JSON configuration document (spec §6) and CLI surface.
//!
//! The teacher crate has no config-file story of its own; `serde`+`serde_json`
//! are pulled in here because the spec is explicit that the wire format is a
//! single JSON document (§6), the same way `clap` (already a teacher
//! dependency) gives us the `--config`/`--data-dir`/`--log-level`/
//! `--foreground` flag set (§6 "CLI surface").

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::model::{ConflictStrategy, EvictionStrategy, SyncDirection, SyncPair};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,
    #[serde(default)]
    pub launch_at_login: bool,
    #[serde(default = "default_menu_bar_style")]
    pub menu_bar_style: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_true() -> bool {
    true
}
fn default_menu_bar_style() -> String {
    "icon".to_string()
}
fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub id: String,
    pub name: String,
    pub mount_path: PathBuf,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub file_system: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPairConfig {
    pub id: u32,
    pub disk_id: String,
    pub local_path: PathBuf,
    pub external_relative_path: String,
    #[serde(default = "default_direction")]
    pub direction: SyncDirection,
    #[serde(default)]
    pub create_symlink: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_size")]
    pub max_local_cache_size: u64,
    #[serde(default = "default_true")]
    pub auto_eviction_enabled: bool,
    #[serde(default)]
    pub target_free_space: u64,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub conflict_strategy: Option<ConflictStrategy>,
}

fn default_direction() -> SyncDirection {
    SyncDirection::Bidirectional
}
fn default_cache_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

impl SyncPairConfig {
    pub fn into_sync_pair(self) -> SyncPair {
        SyncPair {
            id: self.id,
            disk_id: self.disk_id,
            local_dir: self.local_path,
            external_relative_path: self.external_relative_path,
            direction: self.direction,
            create_symlink: self.create_symlink,
            enabled: self.enabled,
            max_local_cache_size: self.max_local_cache_size,
            auto_eviction_enabled: self.auto_eviction_enabled,
            target_free_space: self.target_free_space,
            exclude_patterns: self.exclude_patterns,
            include_patterns: self.include_patterns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_hidden: bool,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub min_file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_reserve_buffer")]
    pub reserve_buffer: u64,
    #[serde(default = "default_eviction_strategy")]
    pub eviction_strategy: EvictionStrategy,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval: u64,
}

fn default_reserve_buffer() -> u64 {
    512 * 1024 * 1024
}
fn default_eviction_strategy() -> EvictionStrategy {
    EvictionStrategy::AccessTime
}
fn default_check_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_delay: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_debounce_ms() -> u64 {
    5_000
}
fn default_batch_size() -> u32 {
    64
}
fn default_retry_count() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    3_600
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub sync_pairs: Vec<SyncPairConfig>,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            auto_sync_enabled: true,
            launch_at_login: false,
            menu_bar_style: default_menu_bar_style(),
            language: default_language(),
        }
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        FiltersConfig {
            exclude_patterns: Vec::new(),
            include_patterns: Vec::new(),
            exclude_hidden: false,
            max_file_size: None,
            min_file_size: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            reserve_buffer: default_reserve_buffer(),
            eviction_strategy: default_eviction_strategy(),
            check_interval: default_check_interval_secs(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        AdvancedConfig {
            debounce_delay: default_debounce_ms(),
            batch_size: default_batch_size(),
            retry_count: default_retry_count(),
            timeout: default_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig::default(),
            disks: Vec::new(),
            sync_pairs: Vec::new(),
            filters: FiltersConfig::default(),
            cache: CacheConfig::default(),
            advanced: AdvancedConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SyncError::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| SyncError::InvalidConfig(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Surfaced before any component starts (spec §6, exit code 1).
    pub fn validate(&self) -> SyncResult<()> {
        let mut seen_disk_ids = std::collections::HashSet::new();
        for disk in &self.disks {
            if !seen_disk_ids.insert(disk.id.clone()) {
                return Err(SyncError::InvalidConfig(format!("duplicate disk id {}", disk.id)));
            }
        }

        let mut seen_pair_ids = std::collections::HashSet::new();
        for pair in &self.sync_pairs {
            if !seen_pair_ids.insert(pair.id) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate sync pair id {}",
                    pair.id
                )));
            }
            if !self.disks.iter().any(|d| d.id == pair.disk_id) {
                return Err(SyncError::InvalidConfig(format!(
                    "sync pair {} references unknown disk {}",
                    pair.id, pair.disk_id
                )));
            }
            if crate::path_guard::validate_virtual(&pair.external_relative_path).is_err() {
                return Err(SyncError::InvalidConfig(format!(
                    "sync pair {} has an invalid externalRelativePath",
                    pair.id
                )));
            }
        }

        if self.advanced.retry_count > 10 {
            return Err(SyncError::InvalidConfig("advanced.retryCount is unreasonably large".into()));
        }

        Ok(())
    }
}

/// CLI surface (spec §6): `--config`, `--data-dir`, `--log-level`,
/// `--foreground`.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "syncd", about = "Mirrors directories between a local cache and removable external volumes")]
pub struct Cli {
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[arg(long)]
    pub foreground: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Process exit codes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Clean = 0,
    ConfigError = 1,
    StoreError = 2,
    PermissionError = 3,
    RuntimeError = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.advanced.log_level, "info");
    }

    #[test]
    fn validate_rejects_dangling_disk_reference() {
        let mut cfg = Config::default();
        cfg.sync_pairs.push(SyncPairConfig {
            id: 1,
            disk_id: "missing".into(),
            local_path: "/tmp/x".into(),
            external_relative_path: "x".into(),
            direction: SyncDirection::Bidirectional,
            create_symlink: false,
            enabled: true,
            max_local_cache_size: 1024,
            auto_eviction_enabled: true,
            target_free_space: 0,
            exclude_patterns: vec![],
            include_patterns: vec![],
            conflict_strategy: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_invalid_external_path() {
        let mut cfg = Config::default();
        cfg.disks.push(DiskConfig {
            id: "d1".into(),
            name: "Disk".into(),
            mount_path: "/Volumes/Disk".into(),
            priority: 0,
            enabled: true,
            file_system: None,
        });
        cfg.sync_pairs.push(SyncPairConfig {
            id: 1,
            disk_id: "d1".into(),
            local_path: "/tmp/x".into(),
            external_relative_path: "../escape".into(),
            direction: SyncDirection::Bidirectional,
            create_symlink: false,
            enabled: true,
            max_local_cache_size: 1024,
            auto_eviction_enabled: true,
            target_free_space: 0,
            exclude_patterns: vec![],
            include_patterns: vec![],
            conflict_strategy: None,
        });
        assert!(cfg.validate().is_err());
    }
}

//! Configuration types for Concord components.
//!
//! Every tunable (retry attempts, page sizes, record caps, batch sizes) lives in
//! one of the structs below and is handed to the component that needs it at
//! construction time. Defaults can be overridden from `concord.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::models::EntityKind;

/// HTTP client configuration for remote calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Pagination limits shared by the client and the cache builders.
#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub page_size: usize,
    /// Hard stop on accumulated records, whatever the server reports.
    pub record_cap: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            record_cap: 10_000,
        }
    }
}

/// Reconciliation engine tunables.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Concurrent custom-field writes per batch.
    pub secondary_batch_size: usize,
    /// Pause between secondary-write batches.
    pub batch_delay: Duration,
    /// Attempts for a backfill write that reports "not found".
    pub backfill_attempts: u32,
    /// Backfill delay grows linearly: `backfill_base_delay * attempt`.
    pub backfill_base_delay: Duration,
    /// Optional payload attributes that may be stripped when the remote
    /// rejects them.
    pub compensable_fields: Vec<String>,
    pub pagination: PaginationConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            secondary_batch_size: 5,
            batch_delay: Duration::from_millis(250),
            backfill_attempts: 3,
            backfill_base_delay: Duration::from_secs(1),
            compensable_fields: vec!["owner_email".to_string()],
            pagination: PaginationConfig::default(),
        }
    }
}

// =============================================================================
// Region selection
// =============================================================================

/// Hosting region of the remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Us,
    Eu,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Us => write!(f, "us"),
            Self::Eu => write!(f, "eu"),
        }
    }
}

impl FromStr for Region {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "us" => Ok(Self::Us),
            "eu" => Ok(Self::Eu),
            _ => Err(AppError::ConfigError(format!(
                "Unknown region: '{}'. Valid options: us, eu",
                s
            ))),
        }
    }
}

// =============================================================================
// concord.toml
// =============================================================================

/// How a collection is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// v1 `limit`/`offset` paging.
    #[default]
    Offset,
    /// v2 opaque-cursor paging.
    Cursor,
}

/// `[remote]` section of `concord.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSection {
    pub base_url: Option<String>,
    pub eu_base_url: Option<String>,
    /// Paging dialect per entity kind; unlisted kinds use offset paging.
    #[serde(default)]
    pub dialects: BTreeMap<EntityKind, Dialect>,
}

impl RemoteSection {
    /// Resolves the base URL for a region.
    pub fn base_url_for(&self, region: Region) -> Result<&str, AppError> {
        let url = match region {
            Region::Us => self.base_url.as_deref(),
            Region::Eu => self.eu_base_url.as_deref(),
        };
        url.ok_or_else(|| {
            AppError::ConfigError(format!("No base URL configured for region '{}'", region))
        })
    }

    pub fn dialect_for(&self, kind: EntityKind) -> Dialect {
        self.dialects.get(&kind).copied().unwrap_or_default()
    }
}

/// `[tuning]` section of `concord.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningSection {
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub page_size: Option<usize>,
    pub record_cap: Option<usize>,
    pub secondary_batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    pub backfill_attempts: Option<u32>,
    pub backfill_base_delay_ms: Option<u64>,
    pub compensable_fields: Option<Vec<String>>,
}

/// Root configuration structure for `concord.toml`.
///
/// # Example
///
/// ```toml
/// [remote]
/// base_url = "https://api.example.com"
/// eu_base_url = "https://api.eu.example.com"
///
/// [remote.dialects]
/// person = "cursor"
///
/// [tuning]
/// record_cap = 5000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcordConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub tuning: TuningSection,
}

impl ConcordConfig {
    pub fn http_config(&self) -> HttpConfig {
        let defaults = HttpConfig::default();
        let t = &self.tuning;
        HttpConfig {
            timeout: t
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_attempts: t.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            retry_base_delay: t
                .retry_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        let defaults = ReconcileConfig::default();
        let t = &self.tuning;
        ReconcileConfig {
            secondary_batch_size: t
                .secondary_batch_size
                .unwrap_or(defaults.secondary_batch_size)
                .max(1),
            batch_delay: t
                .batch_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            backfill_attempts: t
                .backfill_attempts
                .unwrap_or(defaults.backfill_attempts)
                .max(1),
            backfill_base_delay: t
                .backfill_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backfill_base_delay),
            compensable_fields: t
                .compensable_fields
                .clone()
                .unwrap_or(defaults.compensable_fields),
            pagination: PaginationConfig {
                page_size: t
                    .page_size
                    .unwrap_or(defaults.pagination.page_size)
                    .max(1),
                record_cap: t.record_cap.unwrap_or(defaults.pagination.record_cap),
            },
        }
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "concord.toml";

/// Returns the default configuration directory path (`~/.config/concord/`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("concord"))
}

/// Returns the default configuration file path.
///
/// Path: `~/.config/concord/concord.toml`
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Concord configuration
#
# Credentials are never stored here: use CONCORD_API_TOKEN and CONCORD_REGION.

[remote]
# base_url = "https://api.example.com"
# eu_base_url = "https://api.eu.example.com"

# [remote.dialects]
# person = "cursor"

[tuning]
# max_attempts = 3
# record_cap = 10000
# secondary_batch_size = 5
"#;

/// Load configuration from a TOML file.
///
/// # Returns
/// * `Ok(config)` - Configuration loaded, or defaults when the default file is absent
/// * `Err(e)` - An explicit path does not exist, or the file is invalid
///
/// When the default file does not exist a commented template is written there
/// so the user has something to edit.
pub fn load_config(path: Option<PathBuf>) -> Result<ConcordConfig, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(ConcordConfig::default()),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            if let Err(e) = create_default_config(&config_path) {
                tracing::warn!("Could not create default config template: {}", e);
            }
            return Ok(ConcordConfig::default());
        }
        return Err(AppError::ConfigError(format!(
            "Config file not found: {}",
            config_path.display()
        )));
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}

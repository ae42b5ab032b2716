//! Application configuration.
//!
//! Loads from a TOML file (a missing file means defaults), then applies environment
//! overrides, then validates:
//!
//! ```toml
//! [daemon]
//! max_concurrent_batches = 5
//! unit_size = 2
//!
//! [[sources]]
//! id = "1AbC"
//! name = "Genesis"
//! context_artifacts = ["reference_text", "templates"]
//!
//! [inference]
//! model = "claude-3-5-sonnet-20241022"
//!
//! [cache.ttl_secs]
//! reference_text = 3600
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::daemon::DaemonConfig;
use crate::domain::{ArtifactKind, SourceId};
use crate::error::{Result, VolleyError};

/// Upper bound accepted for any configured duration: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Convert milliseconds to a `chrono::Duration`, saturating at [`MAX_DURATION_SECS`].
pub(crate) fn millis(ms: u64) -> chrono::Duration {
    let ms = ms.min(MAX_DURATION_SECS * 1000);
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1000))
}

/// Reject a duration above [`MAX_DURATION_SECS`]. `per_sec` is how many units of `value` make a second.
pub(crate) fn check_duration(name: &str, value: u64, per_sec: u64) -> Result<()> {
    if value > MAX_DURATION_SECS * per_sec {
        return Err(VolleyError::Config(format!(
            "{name} must be at most {MAX_DURATION_SECS} seconds"
        )));
    }
    Ok(())
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub daemon: DaemonConfig,
    pub sources: Vec<SourceConfig>,
    pub inference: InferenceConfig,
    pub cache: CacheConfig,
}

/// One registered source of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    /// Human-readable name used in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Artifacts resolved through the content cache and sent as shared context with
    /// every batch from this source.
    #[serde(default)]
    pub context_artifacts: Vec<ArtifactKind>,
}

impl SourceConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: SourceId::from(id),
            name: None,
            context_artifacts: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_artifact(mut self, kind: &str) -> Self {
        self.context_artifacts.push(ArtifactKind::from(kind));
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    /// Value of the `anthropic-version` header.
    pub api_version: String,
    /// Mark shared context blocks as cacheable.
    pub enable_prompt_caching: bool,
    pub timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 2048,
            api_version: "2023-06-01".to_string(),
            enable_prompt_caching: true,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("api_version", &self.api_version)
            .field("enable_prompt_caching", &self.enable_prompt_caching)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Per-artifact-kind ttls for the content cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Used for any kind without an entry in `ttl_secs`.
    pub default_ttl_secs: u64,
    pub ttl_secs: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 24 * 60 * 60,
            ttl_secs: HashMap::from([
                (ArtifactKind::REFERENCE_TEXT.to_string(), 60 * 60),
                (ArtifactKind::TEMPLATES.to_string(), 24 * 60 * 60),
                (ArtifactKind::REFERENCE_TABLE.to_string(), 24 * 60 * 60),
            ]),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, kind: &ArtifactKind) -> chrono::Duration {
        let secs = self
            .ttl_secs
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_ttl_secs);
        millis(secs.saturating_mul(1000))
    }

    pub fn validate(&self) -> Result<()> {
        check_duration("cache.default_ttl_secs", self.default_ttl_secs, 1)?;
        for (kind, secs) in &self.ttl_secs {
            check_duration(&format!("cache.ttl_secs.{kind}"), *secs, 1)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("daemon", &self.daemon)
            .field("sources", &self.sources)
            .field("inference", &self.inference)
            .field("cache", &self.cache)
            .finish()
    }
}

impl AppConfig {
    /// Load from `path`, apply `VOLLEY_*` environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML file at `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            VolleyError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| VolleyError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| VolleyError::Config(format!("{name} must be a number, got {value:?}")))
        }

        if let Some(v) = lookup("VOLLEY_MAX_CONCURRENT_BATCHES") {
            self.daemon.max_concurrent_batches = parse("VOLLEY_MAX_CONCURRENT_BATCHES", &v)?;
        }
        if let Some(v) = lookup("VOLLEY_UNIT_SIZE") {
            self.daemon.unit_size = parse("VOLLEY_UNIT_SIZE", &v)?;
        }
        if let Some(v) = lookup("VOLLEY_POLL_INTERVAL_MS") {
            self.daemon.poll_interval_ms = parse("VOLLEY_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("VOLLEY_ACCESS_COOLDOWN_MS") {
            self.daemon.access_block_cooldown_ms = parse("VOLLEY_ACCESS_COOLDOWN_MS", &v)?;
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.inference.api_key = Some(key);
        }
        if let Some(model) = lookup("VOLLEY_MODEL") {
            self.inference.model = model;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.daemon.validate()?;
        self.cache.validate()?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(VolleyError::Config("source id must not be empty".into()));
            }
            if !seen.insert(&source.id) {
                return Err(VolleyError::Config(format!(
                    "source {} is registered more than once",
                    source.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.max_concurrent_batches, 5);
        assert_eq!(config.daemon.unit_size, 2);
        assert_eq!(config.daemon.include_triggers, vec!["YES", "GO"]);
        assert_eq!(config.daemon.exclude_triggers, vec!["AI"]);
        assert_eq!(
            config.cache.ttl_for(&ArtifactKind::from(ArtifactKind::REFERENCE_TEXT)),
            chrono::Duration::minutes(60)
        );
        assert_eq!(
            config.cache.ttl_for(&ArtifactKind::from("unknown")),
            chrono::Duration::hours(24)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("volley.toml")).unwrap();
        assert_eq!(config.daemon.max_concurrent_batches, 5);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volley.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
max_concurrent_batches = 2
include_triggers = ["*"]

[[sources]]
id = "sheet-a"
name = "Genesis"
context_artifacts = ["reference_text"]

[[sources]]
id = "sheet-b"

[cache.ttl_secs]
reference_text = 600
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon.max_concurrent_batches, 2);
        assert_eq!(config.daemon.unit_size, 2);
        assert_eq!(config.daemon.include_triggers, vec!["*"]);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].display_name(), "Genesis");
        assert_eq!(config.sources[1].display_name(), "sheet-b");
        assert_eq!(
            config.cache.ttl_for(&ArtifactKind::from(ArtifactKind::REFERENCE_TEXT)),
            chrono::Duration::minutes(10)
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volley.toml");
        std::fs::write(&path, "[daemon\nunit_size = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(VolleyError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        let env = HashMap::from([
            ("VOLLEY_MAX_CONCURRENT_BATCHES", "3"),
            ("VOLLEY_UNIT_SIZE", "4"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("VOLLEY_MODEL", "claude-test"),
        ]);
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.daemon.max_concurrent_batches, 3);
        assert_eq!(config.daemon.unit_size, 4);
        assert_eq!(config.inference.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.inference.model, "claude-test");
        assert!(!format!("{config:?}").contains("sk-test"));

        let bad = HashMap::from([("VOLLEY_UNIT_SIZE", "two")]);
        assert!(
            config
                .apply_overrides(|name| bad.get(name).map(|v| v.to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.daemon.max_concurrent_batches = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.daemon.unit_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.daemon.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sources = vec![SourceConfig::new("a"), SourceConfig::new("a")];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.daemon.status_log_interval_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_durations() {
        let max_ms = MAX_DURATION_SECS * 1000;

        let mut config = AppConfig::default();
        config.daemon.access_block_cooldown_ms = max_ms;
        config.daemon.max_batch_age_ms = max_ms;
        config.cache.default_ttl_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.daemon.access_block_cooldown_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(VolleyError::Config(_))));

        let mut config = AppConfig::default();
        config.daemon.max_batch_age_ms = max_ms + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.daemon.poll_interval_ms = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.daemon.status_log_interval_ms = Some(u64::MAX);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cache.default_ttl_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config
            .cache
            .ttl_secs
            .insert(ArtifactKind::TEMPLATES.to_string(), MAX_DURATION_SECS + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_saturate_instead_of_overflowing() {
        let ceiling = chrono::Duration::seconds(MAX_DURATION_SECS as i64);
        let cache = CacheConfig {
            default_ttl_secs: u64::MAX,
            ttl_secs: HashMap::new(),
        };
        assert_eq!(cache.ttl_for(&ArtifactKind::from("any")), ceiling);
        assert_eq!(millis(u64::MAX), ceiling);
        assert_eq!(millis(1_500), chrono::Duration::milliseconds(1_500));
    }
}

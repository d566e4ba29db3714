use crate::machine::MachineTuning;
use crate::retry::RetryPolicy;
use crate::shopify::config::DEFAULT_API_VERSION;
use crate::shopify::query::PRODUCT_EXPORT_QUERY;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no import target configured; set BULK_IMPORT_CONFIG or SHOPIFY_URL")]
    NoTargets,
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no access token available for target `{0}`")]
    MissingToken(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub shop_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Name of an environment variable holding the token.
    #[serde(default)]
    pub access_token_env: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Integration switch for the target as a whole.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selects the bulk importer over the paginated one.
    #[serde(default = "default_true")]
    pub bulk_import: bool,
    /// Replaces the default product export document.
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_secs: u64,
    pub batch_size: usize,
    pub batches_per_step: Option<usize>,
    pub max_attempts: u32,
    pub retry_window_secs: u64,
    pub retry_base_ms: u64,
    pub timeout_secs: u64,
    pub max_children: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            batch_size: 1,
            batches_per_step: None,
            max_attempts: 10,
            retry_window_secs: 3600,
            retry_base_ms: 1000,
            timeout_secs: 864_000,
            max_children: 100_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Settings {
    /// Load from the process environment.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = match non_empty(lookup("BULK_IMPORT_CONFIG")) {
            Some(path) => Self::from_file(&path)?,
            None => Self::from_env(&lookup)?,
        };
        settings.engine.apply_overrides(&lookup);
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::ReadFile {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, SettingsError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    fn from_env(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let shop_url = non_empty(lookup("SHOPIFY_URL")).ok_or(SettingsError::NoTargets)?;
        let flag = |key: &str| lookup(key).and_then(|v| parse_bool(&v)).unwrap_or(true);
        let target = TargetConfig {
            name: non_empty(lookup("SHOPIFY_TARGET")).unwrap_or_else(|| "default".to_string()),
            shop_url,
            access_token: non_empty(lookup("SHOPIFY_ACCESS_TOKEN")),
            access_token_env: None,
            api_version: non_empty(lookup("SHOPIFY_API_VERSION")),
            enabled: flag("SHOPIFY_ENABLED"),
            bulk_import: flag("BULK_IMPORT_ENABLED"),
            query: None,
        };
        Ok(Self {
            targets: vec![target],
            engine: EngineConfig::default(),
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.targets.is_empty() {
            return Err(SettingsError::NoTargets);
        }
        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(SettingsError::Invalid("target name is empty".into()));
            }
            if !names.insert(target.name.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "target `{}` is listed twice",
                    target.name
                )));
            }
            if target.shop_url.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "target `{}` has no shop_url",
                    target.name
                )));
            }
        }
        let engine = &self.engine;
        if engine.tick_interval_secs == 0 {
            return Err(SettingsError::Invalid("tick_interval_secs must be positive".into()));
        }
        if engine.batch_size == 0 || engine.batches_per_step == Some(0) {
            return Err(SettingsError::Invalid("batch sizes must be positive".into()));
        }
        if engine.max_attempts == 0 || engine.timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "max_attempts and timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse::<T>().ok())
        }
        if let Some(v) = parsed(lookup, "BULK_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = v;
        }
        if let Some(v) = parsed(lookup, "BULK_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = parsed(lookup, "BULK_BATCHES_PER_STEP") {
            self.batches_per_step = Some(v);
        }
        if let Some(v) = parsed(lookup, "BULK_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = parsed(lookup, "BULK_RETRY_WINDOW_SECS") {
            self.retry_window_secs = v;
        }
        if let Some(v) = parsed(lookup, "BULK_RETRY_BASE_MS") {
            self.retry_base_ms = v;
        }
        if let Some(v) = parsed(lookup, "BULK_TIMEOUT_SECS") {
            self.timeout_secs = v;
        }
        if let Some(v) = parsed(lookup, "BULK_MAX_CHILDREN") {
            self.max_children = v;
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Backoff never outgrows one driver tick.
    pub fn tuning(&self) -> MachineTuning {
        MachineTuning {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: self.tick_interval(),
                max_attempts: self.max_attempts,
                window: Duration::from_secs(self.retry_window_secs),
                timeout: Duration::from_secs(self.timeout_secs),
            },
            batch_size: self.batch_size,
            batches_per_step: self.batches_per_step,
            max_children: self.max_children,
        }
    }
}

impl TargetConfig {
    pub fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION.as_str())
    }

    pub fn query(&self) -> &str {
        self.query.as_deref().unwrap_or(PRODUCT_EXPORT_QUERY)
    }

    pub fn access_token(&self) -> Result<String, SettingsError> {
        self.access_token_with(|key| std::env::var(key).ok())
    }

    fn access_token_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String, SettingsError> {
        non_empty(self.access_token.clone())
            .or_else(|| {
                self.access_token_env
                    .as_deref()
                    .and_then(|key| non_empty(lookup(key)))
            })
            .ok_or_else(|| SettingsError::MissingToken(self.name.clone()))
    }
}

//! Connector configuration
//!
//! [`ReadonlyConfig`] is the resolved key/value tree handed to every
//! connector. Typed settings shared by all sinks (batching, retry, delivery
//! semantic) live here too, together with the prepare-time check helpers.

use crate::error::{ConnectorError, ConnectorResult, PluginType};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Expand `${VAR}` and `${VAR:-default}` references
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Immutable, already-resolved connector configuration.
///
/// Keys may be looked up by dotted path (`kafka.bootstrap.servers`). A key
/// that literally contains dots is found too, which keeps pass-through
/// properties of external clients addressable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadonlyConfig {
    root: Map<String, Value>,
}

impl ReadonlyConfig {
    /// Build from a JSON object
    pub fn from_json(value: Value) -> ConnectorResult<Self> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            other => Err(ConnectorError::config(format!(
                "connector config must be a map, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Build from a flat or nested key/value map
    pub fn from_map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            root: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Parse YAML text, expanding environment variables first
    pub fn from_yaml(content: &str) -> ConnectorResult<Self> {
        let expanded = expand_env_vars(content);
        let yaml: serde_yaml::Value = serde_yaml::from_str(&expanded)?;
        Self::from_json(serde_json::to_value(yaml)?)
    }

    /// Build from an opaque YAML value (as carried in pipeline definitions)
    pub fn from_yaml_value(value: serde_yaml::Value) -> ConnectorResult<Self> {
        Self::from_json(serde_json::to_value(value)?)
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.root.get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Whether the key is present and non-null
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some_and(|v| !v.is_null())
    }

    /// Raw value at key
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.lookup(key).filter(|v| !v.is_null())
    }

    /// Typed lookup. Missing keys yield `Ok(None)`; present but mistyped keys are errors.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ConnectorResult<Option<T>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(coerce_scalar::<T>(v))
                .map(Some)
                .map_err(|e| ConnectorError::config(format!("invalid value for '{}': {}", key, e))),
        }
    }

    /// Typed lookup with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> ConnectorResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Typed lookup of a key that must be present
    pub fn get_required<T: DeserializeOwned>(&self, key: &str) -> ConnectorResult<T> {
        self.get(key)?
            .ok_or_else(|| ConnectorError::config(format!("missing required key '{}'", key)))
    }

    /// String lookup; numbers and booleans are rendered as text
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_value(key).map(scalar_to_string)
    }

    /// All properties below `prefix`, flattened, with the prefix stripped.
    ///
    /// `sub_config("kafka")` on `{kafka: {acks: all}, "kafka.linger.ms": 5}`
    /// yields `{acks: "all", linger.ms: "5"}`.
    pub fn sub_config(&self, prefix: &str) -> BTreeMap<String, String> {
        let dotted = format!("{}.", prefix);
        self.to_flat_map()
            .into_iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&dotted)
                    .map(|rest| (rest.to_string(), scalar_to_string(&v)))
            })
            .collect()
    }

    /// Flatten the tree into dotted keys
    pub fn to_flat_map(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.root {
            flatten_into(k, v, &mut out);
        }
        out
    }

    /// Deserialize into a typed, validated connector config
    pub fn parse<T>(&self) -> ConnectorResult<T>
    where
        T: DeserializeOwned + Validate,
    {
        let typed: T = serde_json::from_value(Value::Object(self.root.clone()))
            .map_err(|e| ConnectorError::config(e.to_string()))?;
        typed
            .validate()
            .map_err(|e| ConnectorError::config(e.to_string()))?;
        Ok(typed)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.root.clone())
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Config files frequently quote numbers and booleans ("5000", "true").
fn coerce_scalar<T: DeserializeOwned>(v: &Value) -> Value {
    if let Value::String(s) = v {
        if serde_json::from_value::<T>(v.clone()).is_err() {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if !parsed.is_object() && !parsed.is_array() {
                    return parsed;
                }
            }
        }
    }
    v.clone()
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(&format!("{}.{}", prefix, k), v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Outcome of a prepare-time configuration check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the check succeeded
    pub success: bool,
    /// Error message if failed
    pub message: Option<String>,
}

impl CheckResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Merge several results; failure messages are joined in order
    pub fn merge(results: impl IntoIterator<Item = CheckResult>) -> Self {
        let messages: Vec<String> = results
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| r.message.unwrap_or_default())
            .collect();
        if messages.is_empty() {
            Self::success()
        } else {
            Self::failure(messages.join(","))
        }
    }

    /// Fail fast with a prepare error naming the plugin
    pub fn into_prepare_result(
        self,
        plugin: impl Into<String>,
        plugin_type: PluginType,
    ) -> ConnectorResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(ConnectorError::prepare(
                plugin,
                plugin_type,
                self.message.unwrap_or_default(),
            ))
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.success, &self.message) {
            (true, _) => write!(f, "check passed"),
            (false, Some(msg)) => write!(f, "check failed: {}", msg),
            (false, None) => write!(f, "check failed"),
        }
    }
}

fn is_present(config: &ReadonlyConfig, key: &str) -> bool {
    match config.get_value(key) {
        None => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// All keys must be present and non-empty
pub fn check_all_exists(config: &ReadonlyConfig, keys: &[&str]) -> CheckResult {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| !is_present(config, k))
        .collect();
    if missing.is_empty() {
        CheckResult::success()
    } else {
        CheckResult::failure(format!(
            "please specify [{}] as non-empty",
            missing.join(",")
        ))
    }
}

/// At least one of the keys must be present and non-empty
pub fn check_at_least_one_exists(config: &ReadonlyConfig, keys: &[&str]) -> CheckResult {
    if keys.is_empty() || keys.iter().any(|k| is_present(config, k)) {
        CheckResult::success()
    } else {
        CheckResult::failure(format!(
            "please specify at least one config of [{}] as non-empty",
            keys.join(",")
        ))
    }
}

/// Delivery guarantee requested for a sink
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySemantic {
    /// Fire-and-forget
    None,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl fmt::Display for DeliverySemantic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliverySemantic::None => write!(f, "none"),
            DeliverySemantic::AtLeastOnce => write!(f, "at_least_once"),
            DeliverySemantic::ExactlyOnce => write!(f, "exactly_once"),
        }
    }
}

/// Flush thresholds of a buffering sink
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct BatchSettings {
    /// Flush once this many rows are buffered
    #[serde(default = "default_max_rows")]
    #[validate(range(min = 1))]
    pub max_rows: usize,

    /// Flush once this many serialized bytes are buffered
    #[serde(default = "default_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: usize,

    /// Background flush interval; 0 disables the timer
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_rows() -> usize {
    1024
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_interval_ms() -> u64 {
    5000
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl BatchSettings {
    /// Read `max_rows` / `max_bytes` / `interval_ms` from a connector config
    pub fn from_config(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        let settings = Self {
            max_rows: config.get_or("max_rows", default_max_rows())?,
            max_bytes: config.get_or("max_bytes", default_max_bytes())?,
            interval_ms: config.get_or("interval_ms", default_interval_ms())?,
        };
        settings
            .validate()
            .map_err(|e| ConnectorError::config(e.to_string()))?;
        Ok(settings)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

/// Retry limits shared by flush and commit loops
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct RetrySettings {
    /// Total attempts before the failure becomes fatal
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1))]
    pub max_retries: u32,

    /// Backoff grows by this much per attempt
    #[serde(default = "default_retry_backoff_multiplier_ms")]
    pub retry_backoff_multiplier_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Separate budget for label / transaction id collisions
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_multiplier_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    10_000
}

fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_multiplier_ms: default_retry_backoff_multiplier_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl RetrySettings {
    pub fn from_config(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        let settings = Self {
            max_retries: config.get_or("max_retries", default_max_retries())?,
            retry_backoff_multiplier_ms: config.get_or(
                "retry_backoff_multiplier_ms",
                default_retry_backoff_multiplier_ms(),
            )?,
            max_retry_backoff_ms: config
                .get_or("max_retry_backoff_ms", default_max_retry_backoff_ms())?,
            max_conflict_retries: config
                .get_or("max_conflict_retries", default_max_conflict_retries())?,
        };
        settings
            .validate()
            .map_err(|e| ConnectorError::config(e.to_string()))?;
        Ok(settings)
    }
}

/// Read the delivery semantic (`semantics` key); defaults to at-least-once
pub fn delivery_semantic(config: &ReadonlyConfig) -> ConnectorResult<DeliverySemantic> {
    config.get_or("semantics", DeliverySemantic::default())
}

/// String map view, used by connectors that pass properties through verbatim
pub fn to_string_map(config: &ReadonlyConfig) -> HashMap<String, String> {
    config
        .to_flat_map()
        .into_iter()
        .map(|(k, v)| (k, scalar_to_string(&v)))
        .collect()
}

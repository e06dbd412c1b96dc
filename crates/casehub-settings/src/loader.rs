//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CasehubSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CASEHUB_*` environment overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CasehubSettings, StoreBackend};

/// Resolve the path to the settings file (`~/.casehub/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".casehub").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CasehubSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<CasehubSettings> {
    let mut settings = read_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layers(path: &Path) -> Result<CasehubSettings> {
    let defaults = serde_json::to_value(CasehubSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut CasehubSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within the documented range, booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut CasehubSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CASEHUB_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("CASEHUB_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("CASEHUB_MAX_MESSAGE_SIZE", 1024, 16 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = env.usize("CASEHUB_QUEUE_CAPACITY", 1, 65_536) {
        settings.hub.outbound_queue_capacity = v;
    }
    if let Some(v) = env.u64("CASEHUB_PING_INTERVAL_MS", 100, 600_000) {
        settings.hub.ping_interval_ms = v;
    }
    if let Some(v) = env.u64("CASEHUB_PONG_TIMEOUT_MS", 200, 3_600_000) {
        settings.hub.pong_timeout_ms = v;
    }
    if let Some(v) = env.u64("CASEHUB_WRITE_TIMEOUT_MS", 100, 600_000) {
        settings.hub.write_timeout_ms = v;
    }
    if let Some(v) = env.u64("CASEHUB_TYPING_TTL_MS", 100, 600_000) {
        settings.hub.typing_ttl_ms = v;
    }
    if let Some(v) = env.u64("CASEHUB_TYPING_SWEEP_MS", 100, 600_000) {
        settings.hub.typing_sweep_interval_ms = v;
    }
    if let Some(v) = env.usize("CASEHUB_REDELIVERY_BATCH", 1, 10_000) {
        settings.hub.redelivery_batch_size = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("CASEHUB_STORE") {
        match v.to_lowercase().as_str() {
            "sqlite" => settings.store.backend = StoreBackend::Sqlite,
            "memory" => settings.store.backend = StoreBackend::Memory,
            other => warn!(key = "CASEHUB_STORE", value = other, "unknown store backend, ignoring"),
        }
    }
    if let Some(v) = env.string("CASEHUB_DB_PATH") {
        settings.store.path = PathBuf::from(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CASEHUB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CASEHUB_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

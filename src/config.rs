//! Gateway configuration: loaded from `gateway.toml`, overridable per-key by
//! environment variables (double-underscore separated, e.g.
//! `RATE_LIMIT__ANONYMOUS_CAPACITY`), matching the dotted key namespace in the
//! gateway's external configuration contract.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewaySection,
    pub rate_limit: RateLimitSection,
    pub session: SessionSection,
    pub ccu: CcuSection,
    pub policy: PolicySection,
    pub cache_store: CacheStoreSection,
    pub oidc: OidcSection,
    pub identity_service: IdentityServiceSection,
    #[serde(default)]
    pub upstream: HashMap<String, UpstreamSection>,
    #[serde(default)]
    pub breaker: HashMap<String, BreakerSection>,
    #[serde(default)]
    pub retry: HashMap<String, RetrySection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewaySection::default(),
            rate_limit: RateLimitSection::default(),
            session: SessionSection::default(),
            ccu: CcuSection::default(),
            policy: PolicySection::default(),
            cache_store: CacheStoreSection::default(),
            oidc: OidcSection::default(),
            identity_service: IdentityServiceSection::default(),
            upstream: HashMap::new(),
            breaker: HashMap::new(),
            retry: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub listen_addr: String,
    pub request_timeout_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub anonymous_capacity: u32,
    pub authenticated_capacity: u32,
    pub premium_capacity: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            anonymous_capacity: 100,
            authenticated_capacity: 1000,
            premium_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub l1_max: u64,
    pub l1_ttl_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            l1_max: 100_000,
            l1_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CcuSection {
    pub online_ttl_minutes: u64,
    pub scan_interval_s: u64,
}

impl Default for CcuSection {
    fn default() -> Self {
        Self {
            online_ttl_minutes: 2,
            scan_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub refresh_interval_s: u64,
    pub source_path: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            refresh_interval_s: 60,
            source_path: "policy.toml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheStoreSection {
    pub addr: String,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for CacheStoreSection {
    fn default() -> Self {
        Self {
            addr: "redis://127.0.0.1:6379".to_string(),
            password: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OidcSection {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_base: String,
    pub post_login_redirect: String,
}

impl Default for OidcSection {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_base: "http://localhost:8080".to_string(),
            post_login_redirect: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityServiceSection {
    pub base_url: String,
}

impl Default for IdentityServiceSection {
    fn default() -> Self {
        Self {
            base_url: "http://identity-service.internal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub instances: Vec<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_connections: usize,
    pub strip_prefix_count: usize,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            max_connections: 100,
            strip_prefix_count: 0,
        }
    }
}

impl UpstreamSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_rate_pct: f64,
    pub slow_call_ms: u64,
    pub wait_duration_s: u64,
    pub permitted_half_open: u32,
    pub sliding_window_size: usize,
    pub minimum_number_of_calls: usize,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_rate_pct: 50.0,
            slow_call_ms: 2_000,
            wait_duration_s: 10,
            permitted_half_open: 10,
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 100,
            multiplier: 2.0,
        }
    }
}

impl Config {
    /// Load `gateway.toml` (if present) then layer environment overrides on top.
    ///
    /// Any key can be overridden with an env var named after its dotted path,
    /// uppercased with `.` and nested-table boundaries replaced by `__`, e.g.
    /// `rate_limit.anonymous_capacity` -> `RATE_LIMIT__ANONYMOUS_CAPACITY`.
    pub fn load(path: &str) -> Result<Self, GatewayError> {
        let mut value = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<toml::Value>(&raw)
                .map_err(|e| GatewayError::ConfigInvalid(format!("{path}: {e}")))?,
            Err(_) => toml::Value::Table(Default::default()),
        };

        apply_env_overrides(&mut value, "");

        value
            .try_into()
            .map_err(|e| GatewayError::ConfigInvalid(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.request_timeout_ms)
    }

    pub fn breaker_for(&self, service: &str) -> BreakerSection {
        self.breaker.get(service).cloned().unwrap_or_default()
    }

    pub fn retry_for(&self, service: &str) -> RetrySection {
        self.retry.get(service).cloned().unwrap_or_default()
    }
}

fn apply_env_overrides(value: &mut toml::Value, prefix: &str) {
    if let toml::Value::Table(table) = value {
        for (key, child) in table.iter_mut() {
            let env_key = if prefix.is_empty() {
                key.to_uppercase()
            } else {
                format!("{prefix}__{}", key.to_uppercase())
            };

            match child {
                toml::Value::Table(_) => apply_env_overrides(child, &env_key),
                _ => {
                    if let Ok(raw) = std::env::var(&env_key) {
                        if let Ok(parsed) = toml::Value::try_from(raw.clone()) {
                            *child = coerce_like(child, parsed, &raw);
                        }
                    }
                }
            }
        }
    }
}

/// `toml::Value::try_from` on a plain env-var string always yields a `String`;
/// coerce it back to the original field's scalar kind so numeric/bool config
/// keys keep working when overridden from the environment.
fn coerce_like(original: &toml::Value, fallback: toml::Value, raw: &str) -> toml::Value {
    match original {
        toml::Value::Integer(_) => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .unwrap_or(fallback),
        toml::Value::Float(_) => raw
            .parse::<f64>()
            .map(toml::Value::Float)
            .unwrap_or(fallback),
        toml::Value::Boolean(_) => raw
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .unwrap_or(fallback),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.rate_limit.anonymous_capacity, 100);
        assert_eq!(cfg.session.l1_ttl_ms, 60_000);
    }

    #[test]
    fn env_override_coerces_numeric_fields() {
        std::env::set_var("RATE_LIMIT__ANONYMOUS_CAPACITY", "7");
        let mut value = toml::Value::Table(Default::default());
        if let toml::Value::Table(t) = &mut value {
            let mut rl = toml::map::Map::new();
            rl.insert("anonymous_capacity".into(), toml::Value::Integer(100));
            t.insert("rate_limit".into(), toml::Value::Table(rl));
        }
        apply_env_overrides(&mut value, "");
        let cfg: Config = value.try_into().unwrap();
        assert_eq!(cfg.rate_limit.anonymous_capacity, 7);
        std::env::remove_var("RATE_LIMIT__ANONYMOUS_CAPACITY");
    }
}

//! Policy Manager (spec §3 Policy Entry, §4.5): route→permission mappings
//! with public-route flagging, matched against incoming {method, path} via
//! ant-style patterns (`*` single segment, `**` multi-segment). Reloaded on
//! a configurable interval with an atomic swap-in so in-flight requests keep
//! running against their own snapshot — grounded in the teacher's
//! `arc-swap`-free but otherwise analogous pattern of treating shared
//! read-mostly state as an immutable snapshot (the DID-doc cache in
//! `auth.rs` reads a fresh copy per lookup); policy reload needs true
//! atomic replacement so we reach for `arc_swap::ArcSwap` directly.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    pub id: String,
    #[serde(default = "default_method")]
    pub http_method: String,
    pub path_pattern: String,
    pub permission_code: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub version: u64,
}

fn default_method() -> String {
    "*".to_string()
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: Vec<PolicyEntry>,
}

struct CompiledEntry {
    entry: PolicyEntry,
    segments: Vec<Segment>,
    literal_prefix_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

fn compile_pattern(pattern: &str) -> (Vec<Segment>, usize) {
    let mut segments = Vec::new();
    let mut literal_prefix_len = 0;
    let mut still_prefix = true;
    for part in pattern.split('/').filter(|p| !p.is_empty()) {
        let segment = match part {
            "**" => Segment::Multi,
            "*" => Segment::Single,
            literal => Segment::Literal(literal.to_string()),
        };
        if still_prefix {
            if let Segment::Literal(lit) = &segment {
                literal_prefix_len += lit.len() + 1;
            } else {
                still_prefix = false;
            }
        }
        segments.push(segment);
    }
    (segments, literal_prefix_len)
}

fn matches_path(segments: &[Segment], path: &str) -> bool {
    let path_parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    matches_from(segments, &path_parts)
}

fn matches_from(segments: &[Segment], path_parts: &[&str]) -> bool {
    match segments.first() {
        None => path_parts.is_empty(),
        Some(Segment::Multi) => {
            if segments.len() == 1 {
                return true;
            }
            for i in 0..=path_parts.len() {
                if matches_from(&segments[1..], &path_parts[i..]) {
                    return true;
                }
            }
            false
        }
        Some(Segment::Single) => {
            !path_parts.is_empty() && matches_from(&segments[1..], &path_parts[1..])
        }
        Some(Segment::Literal(lit)) => {
            !path_parts.is_empty() && path_parts[0] == lit && matches_from(&segments[1..], &path_parts[1..])
        }
    }
}

fn method_matches(entry_method: &str, method: &str) -> bool {
    entry_method == "*" || entry_method.eq_ignore_ascii_case(method)
}

/// An immutable, atomically-swappable snapshot of the loaded policy set.
struct PolicySnapshot {
    entries: Vec<CompiledEntry>,
}

pub struct PolicyManager {
    snapshot: ArcSwap<PolicySnapshot>,
    source_path: String,
}

pub struct PolicyMatch {
    pub permission_code: Option<String>,
    pub is_public: bool,
}

impl PolicyManager {
    pub fn new(source_path: String) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PolicySnapshot { entries: Vec::new() }),
            source_path,
        }
    }

    /// Evaluates all entries in priority order (highest first), breaking
    /// ties on longest literal prefix, and returns the first match. `None`
    /// means "no policy" — the caller's authorization filter treats that as
    /// fail-safe pass-through for un-mapped resources (spec §4.6).
    pub fn find_policy(&self, method: &str, path: &str) -> Option<PolicyMatch> {
        let snapshot = self.snapshot.load();
        snapshot
            .entries
            .iter()
            .filter(|compiled| method_matches(&compiled.entry.http_method, method))
            .filter(|compiled| matches_path(&compiled.segments, path))
            .max_by(|a, b| {
                a.entry
                    .priority
                    .cmp(&b.entry.priority)
                    .then(a.literal_prefix_len.cmp(&b.literal_prefix_len))
            })
            .map(|compiled| PolicyMatch {
                permission_code: compiled.entry.permission_code.clone(),
                is_public: compiled.entry.is_public,
            })
    }

    pub fn entry_count(&self) -> usize {
        self.snapshot.load().entries.len()
    }

    /// Reads `source_path` and swaps the compiled snapshot in atomically. A
    /// missing or malformed file on a refresh tick logs and keeps the prior
    /// snapshot in place rather than dropping the policy set to empty.
    pub async fn reload(&self) -> Result<(), GatewayError> {
        let path = self.source_path.clone();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| GatewayError::ConfigInvalid(format!("{path}: {e}")))?;
        let file: PolicyFile = toml::from_str(&raw)
            .map_err(|e| GatewayError::ConfigInvalid(format!("{path}: {e}")))?;
        let compiled = file
            .policy
            .into_iter()
            .map(|entry| {
                let (segments, literal_prefix_len) = compile_pattern(&entry.path_pattern);
                CompiledEntry { entry, segments, literal_prefix_len }
            })
            .collect();
        self.snapshot.store(Arc::new(PolicySnapshot { entries: compiled }));
        Ok(())
    }

    /// Spawns the periodic refresh task (spec §4.5, default every 60s).
    pub fn spawn_refresh_task(self: Arc<Self>, interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.reload().await {
                    tracing::warn!(error = %err, "policy reload failed, keeping previous snapshot");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(entries: Vec<PolicyEntry>) -> PolicyManager {
        let manager = PolicyManager::new("unused.toml".into());
        let compiled = entries
            .into_iter()
            .map(|entry| {
                let (segments, literal_prefix_len) = compile_pattern(&entry.path_pattern);
                CompiledEntry { entry, segments, literal_prefix_len }
            })
            .collect();
        manager.snapshot.store(Arc::new(PolicySnapshot { entries: compiled }));
        manager
    }

    fn entry(method: &str, pattern: &str, perm: &str, priority: i32) -> PolicyEntry {
        PolicyEntry {
            id: pattern.to_string(),
            http_method: method.to_string(),
            path_pattern: pattern.to_string(),
            permission_code: Some(perm.to_string()),
            is_public: false,
            priority,
            version: 1,
        }
    }

    #[test]
    fn matches_multi_segment_wildcard() {
        let manager = manager_with(vec![entry("GET", "/api/products/**", "product:read", 0)]);
        let m = manager.find_policy("GET", "/api/products/123").unwrap();
        assert_eq!(m.permission_code.as_deref(), Some("product:read"));
    }

    #[test]
    fn method_wildcard_matches_any_verb() {
        let manager = manager_with(vec![entry("*", "/public/ping", "none", 0)]);
        assert!(manager.find_policy("POST", "/public/ping").is_some());
    }

    #[test]
    fn ties_break_on_longer_literal_prefix() {
        let manager = manager_with(vec![
            entry("GET", "/api/**", "broad", 5),
            entry("GET", "/api/products/**", "narrow", 5),
        ]);
        let m = manager.find_policy("GET", "/api/products/123").unwrap();
        assert_eq!(m.permission_code.as_deref(), Some("narrow"));
    }

    #[test]
    fn higher_priority_wins_regardless_of_prefix_length() {
        let manager = manager_with(vec![
            entry("GET", "/api/**", "broad", 10),
            entry("GET", "/api/products/**", "narrow", 1),
        ]);
        let m = manager.find_policy("GET", "/api/products/123").unwrap();
        assert_eq!(m.permission_code.as_deref(), Some("broad"));
    }

    #[test]
    fn no_match_returns_none() {
        let manager = manager_with(vec![entry("GET", "/api/products/**", "product:read", 0)]);
        assert!(manager.find_policy("GET", "/other").is_none());
    }
}

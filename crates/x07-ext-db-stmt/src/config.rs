use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CACHE_SIZE: u32 = 25;
pub const DEFAULT_MAX_PACKET_BYTES: u32 = 4 * 1024 * 1024;
pub const MIN_MAX_PACKET_BYTES: u32 = 1024;

const ENV_PREFIX: &str = "X07_DB_STMT_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StmtConfig {
    pub cache_prepared_statements: bool,
    pub cache_size: u32,
    pub rewrite_batched_statements: bool,
    pub continue_batch_on_error: bool,
    pub hold_results_open_over_close: bool,
    pub dont_track_open_resources: bool,
    pub max_packet_bytes: u32,
    pub allow_multi_queries: bool,
    pub strict_truncation: bool,
    pub default_query_timeout_ms: u32,
}

impl Default for StmtConfig {
    fn default() -> Self {
        StmtConfig {
            cache_prepared_statements: false,
            cache_size: DEFAULT_CACHE_SIZE,
            rewrite_batched_statements: false,
            continue_batch_on_error: true,
            hold_results_open_over_close: false,
            dont_track_open_resources: false,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            allow_multi_queries: false,
            strict_truncation: true,
            default_query_timeout_ms: 0,
        }
    }
}

/// How result sets relate to the statement that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePolicy {
    Default,
    HoldOpen,
    DontTrack,
    MultiQuery,
}

impl LifecyclePolicy {
    pub fn tracks_results(self) -> bool {
        !matches!(self, LifecyclePolicy::DontTrack)
    }

    pub fn closes_results_with_statement(self) -> bool {
        matches!(self, LifecyclePolicy::Default | LifecyclePolicy::MultiQuery)
    }
}

impl StmtConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let cfg: StmtConfig = serde_json::from_slice(bytes)
            .map_err(|e| Error::illegal(format!("invalid statement config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads `X07_DB_STMT_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let d = StmtConfig::default();
        StmtConfig {
            cache_prepared_statements: env_bool(
                "CACHE_PREPARED_STATEMENTS",
                d.cache_prepared_statements,
            ),
            cache_size: env_u32("CACHE_SIZE", d.cache_size),
            rewrite_batched_statements: env_bool(
                "REWRITE_BATCHED_STATEMENTS",
                d.rewrite_batched_statements,
            ),
            continue_batch_on_error: env_bool("CONTINUE_BATCH_ON_ERROR", d.continue_batch_on_error),
            hold_results_open_over_close: env_bool(
                "HOLD_RESULTS_OPEN_OVER_CLOSE",
                d.hold_results_open_over_close,
            ),
            dont_track_open_resources: env_bool(
                "DONT_TRACK_OPEN_RESOURCES",
                d.dont_track_open_resources,
            ),
            max_packet_bytes: env_u32("MAX_PACKET_BYTES", d.max_packet_bytes)
                .max(MIN_MAX_PACKET_BYTES),
            allow_multi_queries: env_bool("ALLOW_MULTI_QUERIES", d.allow_multi_queries),
            strict_truncation: env_bool("STRICT_TRUNCATION", d.strict_truncation),
            default_query_timeout_ms: env_u32("DEFAULT_QUERY_TIMEOUT_MS", d.default_query_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_bytes < MIN_MAX_PACKET_BYTES {
            return Err(Error::illegal(format!(
                "maxPacketBytes must be at least {MIN_MAX_PACKET_BYTES}, got {}",
                self.max_packet_bytes
            )));
        }
        Ok(())
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        if self.dont_track_open_resources {
            LifecyclePolicy::DontTrack
        } else if self.hold_results_open_over_close {
            LifecyclePolicy::HoldOpen
        } else if self.allow_multi_queries {
            LifecyclePolicy::MultiQuery
        } else {
            LifecyclePolicy::Default
        }
    }

    pub fn effective_cache_size(&self) -> usize {
        if self.cache_prepared_statements {
            self.cache_size as usize
        } else {
            0
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|v| match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

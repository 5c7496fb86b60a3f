//! Allocator configuration.
//!
//! Defaults reproduce the classic tcmalloc-style tuning: 32-object batches
//! between cache and central lists and a 1 MiB cache budget. Each field can
//! be overridden through a `SPANALLOC_*` environment variable:
//!
//! - `SPANALLOC_BATCH_SIZE`: objects moved per central refill.
//! - `SPANALLOC_CACHE_LIMIT`: cache byte budget before a shrink (`k`/`m`/`g` suffixes).
//! - `SPANALLOC_HOST_LIMIT`: cap on bytes reserved from the host (`none` for unbounded).
//! - `SPANALLOC_PAGE_MAP_NODES`: cap on lazily created page-map nodes (`none` for unbounded).
//! - `SPANALLOC_LOG_LEVEL`: minimum lifecycle log level kept.
//! - `SPANALLOC_LOG_CAPACITY`: lifecycle ring size (0 disables logging).
//!
//! Unparsable values fall back to the default for that field.

use crate::log::AllocatorLogLevel;

/// Tunables for one [`crate::Allocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Objects requested from the central list per cache refill.
    pub batch_size: usize,
    /// Cached bytes above which the thread cache shrinks.
    pub cache_limit_bytes: usize,
    /// Maximum lazily created page-map nodes; `None` is unbounded.
    pub page_map_node_limit: Option<usize>,
    /// Maximum bytes reserved from the default simulated host; `None` is unbounded.
    pub host_limit_bytes: Option<usize>,
    /// Minimum level kept in the lifecycle log.
    pub log_level: AllocatorLogLevel,
    /// Lifecycle ring capacity.
    pub log_capacity: usize,
}

/// Default objects per refill batch.
pub const DEFAULT_BATCH_SIZE: usize = 32;
/// Default cache budget (1 MiB).
pub const DEFAULT_CACHE_LIMIT: usize = 1 << 20;
/// Default page-map node budget.
pub const DEFAULT_PAGE_MAP_NODES: usize = 4096;
/// Default lifecycle ring capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            cache_limit_bytes: DEFAULT_CACHE_LIMIT,
            page_map_node_limit: Some(DEFAULT_PAGE_MAP_NODES),
            host_limit_bytes: None,
            log_level: AllocatorLogLevel::Debug,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl AllocatorConfig {
    /// Defaults overlaid with any `SPANALLOC_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = lookup("SPANALLOC_BATCH_SIZE")
            .and_then(|raw| parse_size(&raw))
            .filter(|&n| n > 0)
        {
            config.batch_size = n;
        }
        if let Some(n) = lookup("SPANALLOC_CACHE_LIMIT").and_then(|raw| parse_size(&raw)) {
            config.cache_limit_bytes = n;
        }
        if let Some(limit) = lookup("SPANALLOC_HOST_LIMIT").and_then(|raw| parse_limit(&raw)) {
            config.host_limit_bytes = limit;
        }
        if let Some(limit) = lookup("SPANALLOC_PAGE_MAP_NODES").and_then(|raw| parse_limit(&raw)) {
            config.page_map_node_limit = limit;
        }
        if let Some(level) =
            lookup("SPANALLOC_LOG_LEVEL").and_then(|raw| AllocatorLogLevel::from_str_loose(&raw))
        {
            config.log_level = level;
        }
        if let Some(n) = lookup("SPANALLOC_LOG_CAPACITY").and_then(|raw| parse_size(&raw)) {
            config.log_capacity = n;
        }
        config
    }
}

/// Parses `4096`, `64k`, `1M`, `2g` (binary multiples, case-insensitive).
fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s.as_str(), 0),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(1 << shift)
}

/// Like [`parse_size`], but `none`/`unlimited` means no limit.
fn parse_limit(raw: &str) -> Option<Option<usize>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" | "unlimited" | "off" => Some(None),
        other => parse_size(other).map(Some),
    }
}

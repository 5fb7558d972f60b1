use std::env;

/// Maximum TTL a cache row may carry: 30 days.
pub const MAX_TTL_SECONDS: i64 = 2_592_000;

/// Cache-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config file.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Row TTL in seconds. `0` means "never expires".
    pub ttl_seconds: i64,
    /// Whether index validation should treat deleted messages as absent.
    pub skip_deleted: bool,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let requested = env::var("FOLDERCACHE_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(86_400);
        let skip_deleted = env::var("FOLDERCACHE_SKIP_DELETED")
            .ok()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Self {
            ttl_seconds: clamp_ttl(requested),
            skip_deleted,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 86_400,
            skip_deleted: true,
        }
    }
}

/// Clamps a requested TTL to `MAX_TTL_SECONDS`. A TTL of `0` ("never expires") is left alone.
pub fn clamp_ttl(requested: i64) -> i64 {
    if requested == 0 {
        0
    } else if requested < 0 {
        MAX_TTL_SECONDS
    } else {
        requested.min(MAX_TTL_SECONDS)
    }
}

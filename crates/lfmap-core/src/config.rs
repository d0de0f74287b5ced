//! Tunable configuration.
//!
//! The initial table capacity is a tuning constant, not a correctness
//! parameter (a capacity of two slots is deliberately small so the rehash
//! path is exercised immediately under load; production deployments may
//! prefer a larger starting size). It is resolved once per process from the
//! `CONCURRENT_MAP_INITIAL_CAPACITY` environment variable with an atomic
//! cache, following the cache-then-resolve idiom used for runtime mode
//! selection elsewhere in this codebase.

use std::sync::atomic::{AtomicU32, Ordering};

const UNRESOLVED: u32 = 0;
const DEFAULT_INITIAL_CAPACITY: u32 = 2;
const ENV_VAR: &str = "CONCURRENT_MAP_INITIAL_CAPACITY";

static CACHED_INITIAL_CAPACITY: AtomicU32 = AtomicU32::new(UNRESOLVED);

/// Construction-time configuration for [`crate::ConcurrentMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    /// Number of `(key, value)` pairs in the initial core. Always rounded
    /// up to the next power of two, minimum 2.
    pub initial_capacity: u32,
}

impl MapConfig {
    /// Resolve configuration from `CONCURRENT_MAP_INITIAL_CAPACITY`,
    /// falling back to a capacity of 2 if unset or unparsable.
    ///
    /// The resolved value is cached for the life of the process; later
    /// calls (from later `ConcurrentMap::new()` instances) do not re-read
    /// the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let cached = CACHED_INITIAL_CAPACITY.load(Ordering::SeqCst);
        if cached != UNRESOLVED {
            return Self {
                initial_capacity: cached,
            };
        }

        let resolved = parse_env()
            .unwrap_or(DEFAULT_INITIAL_CAPACITY)
            .max(2)
            .next_power_of_two();

        // Best-effort cache: if another thread raced us here, both threads
        // resolved the same environment and either value is correct; the
        // loser's resolution is simply discarded.
        let _ = CACHED_INITIAL_CAPACITY.compare_exchange(
            UNRESOLVED,
            resolved,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        Self {
            initial_capacity: resolved,
        }
    }

    /// Build a configuration with an explicit initial capacity, bypassing
    /// the environment. Rounds up to the next power of two, minimum 2.
    #[must_use]
    pub const fn fixed(initial_capacity: u32) -> Self {
        let capacity = if initial_capacity < 2 {
            2
        } else {
            initial_capacity.next_power_of_two()
        };
        Self {
            initial_capacity: capacity,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_env() -> Option<u32> {
    std::env::var(ENV_VAR).ok()?.parse::<u32>().ok()
}

/// Reset the cached environment resolution. Test-only: the cache is global
/// per process, so tests that depend on `CONCURRENT_MAP_INITIAL_CAPACITY`
/// must serialize and reset around it.
#[cfg(test)]
pub(crate) fn reset_env_cache_for_test() {
    CACHED_INITIAL_CAPACITY.store(UNRESOLVED, Ordering::SeqCst);
}

//! The map façade: holds the reference to the current (leading) core and
//! retries mutating operations across rehash cycles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::MapConfig;
use crate::diagnostics::{DiagnosticsSink, RehashEvent};
use crate::error::MapError;
use crate::table::{self, Mutation, Table};

/// A lock-free concurrent map from strictly positive `i32` keys to
/// strictly positive `i32` values.
///
/// `get`, `put`, and `remove` may be called from any number of threads
/// concurrently; there are no locks and no blocking operations. The map
/// grows without bound — there is no shrink, no iteration, and no size
/// query. See the crate documentation for the concurrent rehash protocol.
pub struct ConcurrentMap {
    current: AtomicUsize,
    diagnostics: Arc<DiagnosticsSink>,
}

impl ConcurrentMap {
    /// Create an empty map using [`MapConfig::from_env`] for the initial
    /// capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MapConfig::from_env())
    }

    /// Create an empty map with an explicit configuration, bypassing the
    /// environment.
    #[must_use]
    pub fn with_config(config: MapConfig) -> Self {
        let diagnostics = Arc::new(DiagnosticsSink::new());
        let initial = Box::new(Table::new(config.initial_capacity, Arc::clone(&diagnostics)));
        let raw = Box::into_raw(initial) as usize;
        Self {
            current: AtomicUsize::new(raw),
            diagnostics,
        }
    }

    #[allow(unsafe_code)]
    fn current(&self) -> &'static Table {
        let raw = self.current.load(Ordering::SeqCst);
        // SAFETY: `raw` is always a pointer to a `Table` leaked for the
        // process lifetime, either from construction or from a prior
        // `advance_current`.
        unsafe { &*(raw as *const Table) }
    }

    /// Returns the stored value for `key`, or `0` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] if `key <= 0`. The map is not
    /// mutated.
    pub fn get(&self, key: i32) -> Result<i32, MapError> {
        validate_key(key)?;
        Ok(sanitize(self.current().get(key)))
    }

    /// Installs or overwrites `key` with `value`, returning the previous
    /// value or `0` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] if `key <= 0`, or
    /// [`MapError::InvalidValue`] if `value` is outside `[1, i32::MAX)`.
    /// The map is not mutated on error.
    pub fn put(&self, key: i32, value: i32) -> Result<i32, MapError> {
        validate_key(key)?;
        validate_value(value)?;
        Ok(sanitize(self.mutate_retrying(key, value)))
    }

    /// Logically deletes `key`, returning the previous value or `0` if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] if `key <= 0`.
    pub fn remove(&self, key: i32) -> Result<i32, MapError> {
        validate_key(key)?;
        Ok(sanitize(self.mutate_retrying(key, table::DEL)))
    }

    /// Returns and clears the accumulated rehash diagnostics log.
    pub fn drain_diagnostics(&self) -> Vec<RehashEvent> {
        self.diagnostics.drain()
    }

    fn mutate_retrying(&self, key: i32, new_value: i32) -> i32 {
        loop {
            let observed = self.current();
            match observed.mutate(key, new_value) {
                Mutation::Value(previous) => return previous,
                Mutation::NeedsRehash => {
                    let successor = observed.rehash();
                    self.advance_current(observed, successor);
                }
            }
        }
    }

    /// Compare-and-set the current-core pointer from `observed` to
    /// `successor`. A failed CAS means another thread already advanced
    /// `current` to this or a later successor; either way the caller's
    /// next loop iteration re-reads `current()`, so the map's current-core
    /// reference is only ever allowed to lag, never regress.
    fn advance_current(&self, observed: &'static Table, successor: &'static Table) {
        let observed_addr = std::ptr::from_ref(observed) as usize;
        let successor_addr = std::ptr::from_ref(successor) as usize;
        let _ = self.current.compare_exchange(
            observed_addr,
            successor_addr,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Default for ConcurrentMap {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_key(key: i32) -> Result<(), MapError> {
    if key <= 0 {
        return Err(MapError::InvalidKey(key));
    }
    Ok(())
}

fn validate_value(value: i32) -> Result<(), MapError> {
    if value < 1 || value >= table::DEL {
        return Err(MapError::InvalidValue(value));
    }
    Ok(())
}

fn sanitize(raw: i32) -> i32 {
    if raw == table::DEL { 0 } else { raw }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> ConcurrentMap {
        ConcurrentMap::with_config(MapConfig::fixed(2))
    }

    #[test]
    fn empty_map_returns_zero_for_any_key() {
        let map = small_map();
        assert_eq!(map.get(1).unwrap(), 0);
        assert_eq!(map.get(999_999).unwrap(), 0);
    }

    #[test]
    fn scenario_put_get_remove() {
        let map = small_map();
        map.put(1, 10).unwrap();
        map.put(2, 20).unwrap();
        assert_eq!(map.get(1).unwrap(), 10);
        assert_eq!(map.get(2).unwrap(), 20);
        assert_eq!(map.get(3).unwrap(), 0);
        assert_eq!(map.remove(1).unwrap(), 10);
        assert_eq!(map.get(1).unwrap(), 0);
    }

    #[test]
    fn scenario_forces_rehash_on_third_distinct_key() {
        let map = small_map();
        map.put(1, 1).unwrap();
        map.put(2, 2).unwrap();
        map.put(3, 3).unwrap();
        assert_eq!(map.get(1).unwrap(), 1);
        assert_eq!(map.get(2).unwrap(), 2);
        assert_eq!(map.get(3).unwrap(), 3);
    }

    #[test]
    fn scenario_overwrite_and_remove_twice() {
        let map = small_map();
        assert_eq!(map.put(5, 100).unwrap(), 0);
        assert_eq!(map.put(5, 200).unwrap(), 100);
        assert_eq!(map.put(5, 200).unwrap(), 200);
        assert_eq!(map.remove(5).unwrap(), 200);
        assert_eq!(map.remove(5).unwrap(), 0);
    }

    #[test]
    fn remove_on_absent_key_is_a_noop() {
        let map = small_map();
        assert_eq!(map.remove(7).unwrap(), 0);
        assert_eq!(map.get(7).unwrap(), 0);
    }

    #[test]
    fn rejects_non_positive_keys() {
        let map = small_map();
        assert!(matches!(map.get(0), Err(MapError::InvalidKey(0))));
        assert!(matches!(map.put(0, 1), Err(MapError::InvalidKey(0))));
        assert!(matches!(map.remove(-1), Err(MapError::InvalidKey(-1))));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let map = small_map();
        assert!(matches!(map.put(1, 0), Err(MapError::InvalidValue(0))));
        assert!(matches!(map.put(1, i32::MAX), Err(MapError::InvalidValue(_))));
        assert!(matches!(map.put(1, -5), Err(MapError::InvalidValue(-5))));
        assert_eq!(map.get(1).unwrap(), 0, "a rejected put must not mutate the map");
    }

    #[test]
    fn growth_over_many_keys() {
        let map = ConcurrentMap::with_config(MapConfig::fixed(2));
        let n = 20_000;
        for key in 1..=n {
            map.put(key, key).unwrap();
        }
        for key in 1..=n {
            assert_eq!(map.get(key).unwrap(), key);
        }
        assert_eq!(map.get(n + 1).unwrap(), 0);
    }

    #[test]
    fn drain_diagnostics_observes_rehash_activity() {
        let map = small_map();
        for key in 1..200 {
            map.put(key, key).unwrap();
        }
        let events = map.drain_diagnostics();
        assert!(!events.is_empty(), "inserting past capacity 2 must trigger at least one rehash");
        assert!(events.iter().any(|e| matches!(e, RehashEvent::Started { .. })));
        assert!(map.drain_diagnostics().is_empty(), "drain must clear the log");
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::algorithms::lag_model::{GridSpec, LagMap};
use crate::core::SensorId;
use crate::validation::LocalizationResult;

/// Identifies one lag map: a sensor pair evaluated on a particular grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LagMapKey {
    pub first: SensorId,
    pub second: SensorId,
    radius_bits: u64,
    step_bits: u64,
    tolerance_bits: u64,
}

impl LagMapKey {
    /// Create a new key for a sensor pair on `grid`
    pub fn new(first: SensorId, second: SensorId, grid: &GridSpec) -> Self {
        Self {
            first,
            second,
            radius_bits: grid.radius.to_bits(),
            step_bits: grid.step.to_bits(),
            tolerance_bits: grid.edge_tolerance.to_bits(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// Model version the cached maps were computed for
    version: Option<u64>,
    maps: HashMap<LagMapKey, Arc<LagMap>>,
    hit_count: usize,
    miss_count: usize,
}

/// Cache of derived lag maps, valid for a single model version
///
/// Entries are never persisted. Asking for a map under a different model
/// version drops every cached map first, so a recalibrated geometry can
/// never be served a stale field.
#[derive(Debug, Default)]
pub struct LagMapCache {
    state: Mutex<CacheState>,
}

impl LagMapCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached map for `key` under `version`, computing and
    /// storing it on a miss
    pub fn get_or_compute<F>(&self, version: u64, key: LagMapKey, compute: F) -> LocalizationResult<Arc<LagMap>>
    where
        F: FnOnce() -> LocalizationResult<LagMap>,
    {
        {
            let mut state = self.lock();
            if state.version != Some(version) {
                if !state.maps.is_empty() {
                    debug!(
                        "lag map cache: model version {:?} -> {}, dropping {} maps",
                        state.version,
                        version,
                        state.maps.len()
                    );
                }
                state.maps.clear();
                state.version = Some(version);
            }
            if let Some(map) = state.maps.get(&key).cloned() {
                state.hit_count += 1;
                return Ok(map);
            }
            state.miss_count += 1;
        }

        // computed without holding the lock; a concurrent miss may compute the same map twice
        let map = Arc::new(compute()?);
        let mut state = self.lock();
        if state.version == Some(version) {
            state.maps.insert(key, Arc::clone(&map));
        }
        Ok(map)
    }

    /// Number of maps currently cached
    pub fn len(&self) -> usize {
        self.lock().maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Model version of the cached maps
    pub fn version(&self) -> Option<u64> {
        self.lock().version
    }

    /// Get cache statistics as (hits, misses, hit rate)
    pub fn get_statistics(&self) -> (usize, usize, f64) {
        let state = self.lock();
        let total = state.hit_count + state.miss_count;
        let hit_rate = if total > 0 {
            state.hit_count as f64 / total as f64
        } else {
            0.0
        };
        (state.hit_count, state.miss_count, hit_rate)
    }

    /// Clear all cached maps
    pub fn clear(&self) {
        let mut state = self.lock();
        state.maps.clear();
        state.version = None;
    }
}

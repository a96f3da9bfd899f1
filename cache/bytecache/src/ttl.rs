//! Per-shard TTL management.
//!
//! Keys are grouped into cohorts by expiry second. One timer thread per
//! shard sleeps until the earliest cohort's instant, evicts every cohort
//! that has come due, and re-arms for the next. Timer resources are O(1)
//! per shard regardless of entry count; eviction granularity is one second.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock;
use crate::shard::Shard;

/// Cohort table shared between a shard and its timer thread.
///
/// The table's mutex is never held while calling into the shard; the timer
/// drains due cohorts under the lock, releases it, and only then evicts.
pub(crate) struct TtlTable {
    state: Mutex<TtlState>,
    timer: Condvar,
}

struct TtlState {
    cohorts: BTreeMap<u64, HashSet<String>>,
    shutdown: bool,
}

impl TtlTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TtlState {
                cohorts: BTreeMap::new(),
                shutdown: false,
            }),
            timer: Condvar::new(),
        })
    }

    /// Register `key` in the cohort for `expiry`. Re-arms the timer when the
    /// cohort becomes the new earliest deadline.
    pub(crate) fn put(&self, expiry: u64, key: &str) {
        let mut state = self.state.lock();
        let rearm = state
            .cohorts
            .first_key_value()
            .map(|(&earliest, _)| expiry < earliest)
            .unwrap_or(true);
        state
            .cohorts
            .entry(expiry)
            .or_default()
            .insert(key.to_owned());
        if rearm {
            self.timer.notify_one();
        }
    }

    /// Forget `key` from the cohort for `expiry`, dropping the cohort when it
    /// empties. The timer is left armed; waking early and finding nothing
    /// due is harmless.
    pub(crate) fn remove(&self, expiry: u64, key: &str) {
        let mut state = self.state.lock();
        if let Some(cohort) = state.cohorts.get_mut(&expiry) {
            cohort.remove(key);
            if cohort.is_empty() {
                state.cohorts.remove(&expiry);
            }
        }
    }

    /// Clear all cohorts and disarm the timer.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.cohorts.clear();
        self.timer.notify_one();
    }

    /// Stop the timer thread.
    pub(crate) fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.cohorts.clear();
        self.timer.notify_one();
    }

    /// Spawn the timer thread for `shard`. The thread holds only a weak
    /// reference, so a dropped shard also ends its timer.
    pub(crate) fn spawn_timer(self: &Arc<Self>, shard: Weak<Shard>, shard_id: usize) {
        let table = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("ttl-timer-{shard_id}"))
            .spawn(move || table.run_timer(shard))
            .expect("failed to spawn ttl timer thread");
    }

    fn run_timer(&self, shard: Weak<Shard>) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = clock::epoch_secs();
                    match state.cohorts.first_key_value().map(|(&sec, _)| sec) {
                        None => {
                            self.timer.wait(&mut state);
                        }
                        Some(earliest) if earliest <= now => {
                            let later = state.cohorts.split_off(&(now + 1));
                            let due = std::mem::replace(&mut state.cohorts, later);
                            break due;
                        }
                        Some(earliest) => {
                            let wait = Duration::from_secs(earliest - now);
                            let _ = self.timer.wait_for(&mut state, wait);
                        }
                    }
                }
            };

            let Some(shard) = shard.upgrade() else {
                return;
            };
            for (expiry, keys) in due {
                shard.evict_cohort(expiry, &keys);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cohort_count(&self) -> usize {
        self.state.lock().cohorts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_remove_cohorts() {
        let table = TtlTable::new();
        table.put(100, "a");
        table.put(100, "b");
        table.put(200, "c");
        assert_eq!(table.cohort_count(), 2);

        table.remove(100, "a");
        assert_eq!(table.cohort_count(), 2);
        table.remove(100, "b");
        assert_eq!(table.cohort_count(), 1, "empty cohort is dropped");

        table.remove(999, "nobody");
        assert_eq!(table.cohort_count(), 1);
    }

    #[test]
    fn test_reset_clears_cohorts() {
        let table = TtlTable::new();
        table.put(100, "a");
        table.reset();
        assert_eq!(table.cohort_count(), 0);
    }
}

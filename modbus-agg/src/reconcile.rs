//! Change detection between a remote device and the shared table.
//!
//! Each bidirectional region keeps two caches: the last value read from
//! the device and the last value seen in the shared table. A difference
//! against the cache marks an index as changed on that side. When both
//! sides changed in the same cycle the table (master) side wins.

/// What to do with one index after comparing both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Neither side changed.
    Unchanged,
    /// The table changed: write this value to the device.
    Push(T),
    /// Only the device changed: copy this value into the table.
    Pull(T),
}

/// Per-index outcome of one comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes<T> {
    pub slave_changed: Vec<bool>,
    pub master_changed: Vec<bool>,
    pub resolutions: Vec<Resolution<T>>,
}

impl<T> Changes<T> {
    /// Number of indices to write to the device.
    pub fn pushes(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| matches!(r, Resolution::Push(_)))
            .count()
    }

    /// Number of indices copied from the device into the table.
    pub fn pulls(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| matches!(r, Resolution::Pull(_)))
            .count()
    }

    /// True when neither side changed anything.
    pub fn is_quiet(&self) -> bool {
        self.resolutions
            .iter()
            .all(|r| matches!(r, Resolution::Unchanged))
    }
}

/// Compare fresh and cached values of both sides.
///
/// All four slices must have the same length.
pub fn detect<T: Copy + PartialEq>(
    remote: &[T],
    cached_remote: &[T],
    shared: &[T],
    cached_shared: &[T],
) -> Changes<T> {
    debug_assert_eq!(remote.len(), cached_remote.len());
    debug_assert_eq!(remote.len(), shared.len());
    debug_assert_eq!(remote.len(), cached_shared.len());

    let len = remote.len();
    let mut changes = Changes {
        slave_changed: Vec::with_capacity(len),
        master_changed: Vec::with_capacity(len),
        resolutions: Vec::with_capacity(len),
    };

    for i in 0..len {
        let slave = remote[i] != cached_remote[i];
        let master = shared[i] != cached_shared[i];

        let resolution = if master {
            Resolution::Push(shared[i])
        } else if slave {
            Resolution::Pull(remote[i])
        } else {
            Resolution::Unchanged
        };

        changes.slave_changed.push(slave);
        changes.master_changed.push(master);
        changes.resolutions.push(resolution);
    }

    changes
}

/// A run of consecutive indices to write to the device in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRun<T> {
    /// Index of the first value, relative to the region window.
    pub index: usize,
    pub values: Vec<T>,
}

/// Result of [`RegionCache::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled<T> {
    pub changes: Changes<T>,
    /// Writes still owed to the device, grouped into runs.
    pub pushes: Vec<PushRun<T>>,
}

/// Cached view of one bidirectional region, owned by a single poller.
#[derive(Debug, Clone)]
pub struct RegionCache<T> {
    remote: Vec<T>,
    shared: Vec<T>,
}

impl<T: Copy + PartialEq + Default> RegionCache<T> {
    /// Both caches start zeroed, like the freshly allocated table.
    pub fn new(len: usize) -> Self {
        Self {
            remote: vec![T::default(); len],
            shared: vec![T::default(); len],
        }
    }

    /// Last value known to be on the device.
    pub fn remote(&self) -> &[T] {
        &self.remote
    }

    /// Last value seen in the table.
    pub fn shared(&self) -> &[T] {
        &self.shared
    }

    /// Compare `remote` (just read) with the live table window `shared`.
    ///
    /// Pulls are applied to `shared` and both caches immediately. Pushes
    /// are returned and must be confirmed with [`commit`](Self::commit)
    /// once the device accepted them; an unconfirmed push is detected
    /// again on the next cycle.
    ///
    /// Call with the table lock held so the compare and the write are atomic.
    pub fn reconcile(&mut self, remote: &[T], shared: &mut [T]) -> Reconciled<T> {
        let changes = detect(remote, &self.remote, shared, &self.shared);
        let mut pushes: Vec<PushRun<T>> = Vec::new();

        for (i, resolution) in changes.resolutions.iter().enumerate() {
            match *resolution {
                Resolution::Unchanged => {
                    self.remote[i] = remote[i];
                    self.shared[i] = shared[i];
                }
                Resolution::Pull(value) => {
                    shared[i] = value;
                    self.remote[i] = value;
                    self.shared[i] = value;
                }
                Resolution::Push(value) => match pushes.last_mut() {
                    Some(run) if run.index + run.values.len() == i => run.values.push(value),
                    _ => pushes.push(PushRun {
                        index: i,
                        values: vec![value],
                    }),
                },
            }
        }

        Reconciled { changes, pushes }
    }

    /// Record that the device now holds the values of `run`.
    ///
    /// The remote cache takes the pushed value rather than the value read
    /// this cycle, so the push is not seen as a device-side change later.
    pub fn commit(&mut self, run: &PushRun<T>) {
        for (i, value) in run.values.iter().enumerate() {
            self.remote[run.index + i] = *value;
            self.shared[run.index + i] = *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_master_wins() {
        let changes = detect(&[1u16, 5, 0], &[0, 0, 0], &[2, 0, 0], &[0, 0, 0]);

        assert_eq!(changes.slave_changed, vec![true, true, false]);
        assert_eq!(changes.master_changed, vec![true, false, false]);
        assert_eq!(
            changes.resolutions,
            vec![
                Resolution::Push(2),
                Resolution::Pull(5),
                Resolution::Unchanged
            ]
        );
        assert_eq!(changes.pushes(), 1);
        assert_eq!(changes.pulls(), 1);
        assert!(!changes.is_quiet());
    }

    #[test]
    fn test_master_push_single_coil() {
        let mut cache = RegionCache::new(4);
        let mut shared = [false, false, true, false];

        let result = cache.reconcile(&[false; 4], &mut shared);

        assert_eq!(
            result.pushes,
            vec![PushRun {
                index: 2,
                values: vec![true]
            }]
        );
        assert_eq!(shared, [false, false, true, false]);

        cache.commit(&result.pushes[0]);
        assert_eq!(cache.remote(), &[false, false, true, false]);
        assert_eq!(cache.shared(), &[false, false, true, false]);
    }

    #[test]
    fn test_slave_change_pulled() {
        let mut cache = RegionCache::new(4);
        let mut shared = [false; 4];

        let result = cache.reconcile(&[false, true, false, false], &mut shared);

        assert!(result.pushes.is_empty());
        assert_eq!(result.changes.pulls(), 1);
        assert_eq!(shared, [false, true, false, false]);
        assert_eq!(cache.shared(), &[false, true, false, false]);
    }

    #[test]
    fn test_conflict_settles_on_master() {
        let mut cache = RegionCache::new(1);
        let mut shared = [7u16];

        let result = cache.reconcile(&[3], &mut shared);
        assert_eq!(result.changes.slave_changed, vec![true]);
        assert_eq!(result.changes.master_changed, vec![true]);
        assert_eq!(shared, [7]);
        for run in &result.pushes {
            cache.commit(run);
        }

        // Device now reports the pushed value: nothing left to do.
        let next = cache.reconcile(&[7], &mut shared);
        assert!(next.changes.is_quiet());
        assert!(next.pushes.is_empty());
    }

    #[test]
    fn test_uncommitted_push_is_retried() {
        let mut cache = RegionCache::new(2);
        let mut shared = [0u16, 9];

        let first = cache.reconcile(&[0, 0], &mut shared);
        assert_eq!(first.pushes.len(), 1);

        // Write failed, nothing committed: the device still holds 0.
        let second = cache.reconcile(&[0, 0], &mut shared);
        assert_eq!(
            second.pushes,
            vec![PushRun {
                index: 1,
                values: vec![9]
            }]
        );
        assert_eq!(shared, [0, 9]);
    }

    #[test]
    fn test_pushes_grouped_into_runs() {
        let mut cache = RegionCache::new(6);
        let mut shared = [1u16, 1, 0, 1, 1, 1];

        let result = cache.reconcile(&[0; 6], &mut shared);

        assert_eq!(
            result.pushes,
            vec![
                PushRun {
                    index: 0,
                    values: vec![1, 1]
                },
                PushRun {
                    index: 3,
                    values: vec![1, 1, 1]
                },
            ]
        );
    }

    #[test]
    fn test_quiet_cycle_is_idempotent() {
        let mut cache = RegionCache::new(3);
        let mut shared = [0u16; 3];
        cache.reconcile(&[4, 5, 6], &mut shared);

        for _ in 0..3 {
            let result = cache.reconcile(&[4, 5, 6], &mut shared);
            assert!(result.changes.is_quiet());
            assert!(result.pushes.is_empty());
            assert_eq!(shared, [4, 5, 6]);
            assert_eq!(cache.remote(), &[4, 5, 6]);
            assert_eq!(cache.shared(), &[4, 5, 6]);
        }
    }
}

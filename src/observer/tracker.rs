use crate::table::{TableId, TableSet};
use fixedbitset::FixedBitSet;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ObservedTableOp {
    Add(TableId),
    Remove(TableId),
}

/// Keeps track of how many observers are interested in each table and on which tables the
/// triggers are currently installed.
///
/// Tables are addressed by their [`TableId`], which is also the index into every array kept
/// here.
#[derive(Debug)]
pub(crate) struct ObservingTableTracker {
    /// Number of active observers for each table.
    num_observers: Vec<usize>,
    /// Tables whose triggers are installed on the connection.
    installed: FixedBitSet,
    /// Bumped whenever a table starts or stops being observed.
    version: u64,
    /// Value of `version` at the last successful trigger sync.
    synced_version: u64,
}

impl ObservingTableTracker {
    pub(crate) fn new(num_tables: usize) -> Self {
        Self {
            num_observers: vec![0; num_tables],
            installed: FixedBitSet::with_capacity(num_tables),
            version: 0,
            synced_version: 0,
        }
    }

    /// Add the `tables` to the list of tables that need to be observed.
    ///
    /// Returns true if at least one table went from zero to one observer.
    pub(crate) fn track_tables(&mut self, tables: &TableSet) -> bool {
        let mut requires_version_bump = false;
        for id in tables {
            let current = self.num_observers[id.index()];
            if current == 0 {
                // We should start following this table. If it is not 0, we are
                // already observing it.
                requires_version_bump = true;
            }
            self.num_observers[id.index()] = current + 1;
        }

        if requires_version_bump {
            self.version = self.version.saturating_add(1);
        }
        requires_version_bump
    }

    /// Remove the `tables` from the list of tables that need to be observed.
    ///
    /// Returns true if at least one table lost its last observer.
    pub(crate) fn untrack_tables(&mut self, tables: &TableSet) -> bool {
        let mut requires_version_bump = false;
        for id in tables {
            let count = &mut self.num_observers[id.index()];
            if *count == 0 {
                tracing::warn!(table_id = %id, "Untracking table without observers");
                continue;
            }
            *count -= 1;
            if *count == 0 {
                requires_version_bump = true;
            }
        }

        if requires_version_bump {
            self.version = self.version.saturating_add(1);
        }
        requires_version_bump
    }

    pub(crate) fn observer_count(&self, id: TableId) -> usize {
        self.num_observers.get(id.index()).copied().unwrap_or(0)
    }

    pub(crate) fn is_installed(&self, id: TableId) -> bool {
        self.installed.contains(id.index())
    }

    /// Tables with at least one observer.
    pub(crate) fn observed_tables(&self) -> TableSet {
        self.num_observers
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(idx, _)| TableId::from_index(idx))
            .collect()
    }

    /// Tables whose triggers are currently installed.
    pub(crate) fn installed_tables(&self) -> TableSet {
        self.installed.ones().map(TableId::from_index).collect()
    }

    /// Whether the installed triggers may be out of date.
    pub(crate) fn needs_sync(&self) -> bool {
        self.version != self.synced_version
    }

    /// Calculate which tables should have their triggers created or removed.
    ///
    /// This will return the new installed state as well as the list of operations that bring
    /// the connection in line with the observer counts.
    pub(crate) fn calculate_changes(&self) -> (FixedBitSet, Vec<ObservedTableOp>) {
        let mut result = self.installed.clone();
        let mut changes = Vec::new();
        for (idx, num_observers) in self.num_observers.iter().enumerate() {
            let is_tracking = self.installed[idx];
            if is_tracking && *num_observers == 0 {
                changes.push(ObservedTableOp::Remove(TableId::from_index(idx)));
                result.set(idx, false);
            } else if !is_tracking && *num_observers != 0 {
                changes.push(ObservedTableOp::Add(TableId::from_index(idx)));
                result.set(idx, true);
            }
        }
        (result, changes)
    }

    /// Once the triggers have been updated, apply the new state.
    pub(crate) fn apply_changes(&mut self, installed: FixedBitSet) {
        self.installed = installed;
        self.synced_version = self.version;
    }

    /// Forget every installed trigger, e.g. after the tracking infrastructure was removed.
    pub(crate) fn reset_installed(&mut self) {
        self.installed.clear();
        // Force a sync on the next pass if anyone is still observing.
        self.synced_version = self.version.wrapping_sub(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn set(ids: &[u32]) -> TableSet {
        ids.iter().copied().map(TableId::new).collect()
    }

    #[test]
    fn counts_and_version_follow_transitions() {
        let mut tracker = ObservingTableTracker::new(3);
        assert!(!tracker.needs_sync());

        // foo=0, bar=1, omega=2
        assert!(tracker.track_tables(&set(&[0, 1])));
        assert_eq!(tracker.version, 1);
        assert!(!tracker.track_tables(&set(&[1])));
        assert_eq!(tracker.version, 1);
        assert!(tracker.track_tables(&set(&[1, 2])));
        assert_eq!(tracker.version, 2);
        assert_eq!(tracker.observer_count(TableId::new(1)), 3);

        assert!(!tracker.untrack_tables(&set(&[1])));
        assert!(tracker.untrack_tables(&set(&[1, 2])));
        assert_eq!(tracker.observer_count(TableId::new(0)), 1);
        assert_eq!(tracker.observer_count(TableId::new(1)), 1);
        assert_eq!(tracker.observer_count(TableId::new(2)), 0);
        assert_eq!(tracker.observed_tables(), set(&[0, 1]));
    }

    #[test]
    fn register_then_unregister_restores_counts() {
        let mut tracker = ObservingTableTracker::new(2);
        tracker.track_tables(&set(&[0]));
        let before = tracker.observer_count(TableId::new(0));

        tracker.track_tables(&set(&[0, 1]));
        tracker.untrack_tables(&set(&[0, 1]));

        assert_eq!(tracker.observer_count(TableId::new(0)), before);
        assert_eq!(tracker.observer_count(TableId::new(1)), 0);
    }

    #[test]
    fn calculate_changes_only_removes_at_zero() {
        let mut tracker = ObservingTableTracker::new(3);
        tracker.track_tables(&set(&[0, 1]));
        let (installed, ops) = tracker.calculate_changes();
        assert_eq!(
            ops,
            vec![
                ObservedTableOp::Add(TableId::new(0)),
                ObservedTableOp::Add(TableId::new(1))
            ]
        );
        tracker.apply_changes(installed);
        assert!(!tracker.needs_sync());
        assert!(tracker.is_installed(TableId::new(0)));

        // A second observer of table 1 comes and goes, nothing changes.
        tracker.track_tables(&set(&[1]));
        tracker.untrack_tables(&set(&[1]));
        assert!(tracker.calculate_changes().1.is_empty());

        tracker.untrack_tables(&set(&[1]));
        assert!(tracker.needs_sync());
        let (installed, ops) = tracker.calculate_changes();
        assert_eq!(ops, vec![ObservedTableOp::Remove(TableId::new(1))]);
        tracker.apply_changes(installed);
        assert_eq!(tracker.installed_tables(), set(&[0]));
    }

    #[test]
    fn reset_installed_forces_resync() {
        let mut tracker = ObservingTableTracker::new(1);
        tracker.track_tables(&set(&[0]));
        let (installed, _) = tracker.calculate_changes();
        tracker.apply_changes(installed);
        assert!(!tracker.needs_sync());

        tracker.reset_installed();
        assert!(tracker.needs_sync());
        assert_eq!(
            tracker.calculate_changes().1,
            vec![ObservedTableOp::Add(TableId::new(0))]
        );
    }
}

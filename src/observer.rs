//! Table invalidation tracking.
//!
//! The [`TableObserver`] keeps a temporary shadow table with one row per observed table. For
//! every observed table, temporary triggers for INSERT, UPDATE and DELETE flip the table's
//! `invalidated` flag whenever a row is modified. [`TableObserver::check_for_table_updates`]
//! reads and clears those flags and hands the result to a background thread, which invokes
//! every [`Observer`] whose tables were touched.
//!
//! The triggers only exist while at least one observer is interested in a table. Adding and
//! removing observers only updates the reference counts; the DDL is applied by the next
//! [`TableObserver::sync_triggers`] pass on the connection.
use crate::connection::{with_transaction, SqlConnection};
use crate::error::Error;
use crate::table::{TableId, TableSchema, TableSet};
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

pub mod sql;
mod tracker;

use tracker::{ObservedTableOp, ObservingTableTracker};

new_key_type! {
    /// Handle for an [`Observer`].
    pub struct ObserverHandle;
}

/// Defines an observer for a set of tables.
pub trait Observer: Send + Sync {
    /// Return the set of tables this observer is interested in.
    ///
    /// The set is read once when the observer is registered.
    fn tables(&self) -> Vec<TableId>;

    /// When one or more of the tables returned by [`Self::tables()`] is modified, this method
    /// will be invoked by the [`TableObserver`].
    ///
    /// `tables` only ever contains tables returned by [`Self::tables()`] and is never empty.
    ///
    /// It is recommended that the implementation be as short as possible to not delay/block
    /// the execution of other observers.
    fn on_tables_invalidated(&self, tables: &TableSet);
}

/// [`Observer`] backed by a closure.
pub struct FnObserver<F> {
    tables: Vec<TableId>,
    callback: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&TableSet) + Send + Sync,
{
    pub fn new(tables: impl IntoIterator<Item = TableId>, callback: F) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            callback,
        }
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&TableSet) + Send + Sync,
{
    fn tables(&self) -> Vec<TableId> {
        self.tables.clone()
    }

    fn on_tables_invalidated(&self, tables: &TableSet) {
        (self.callback)(tables);
    }
}

struct TrackerState {
    tracker: ObservingTableTracker,
    constructed: bool,
}

/// Owner of the shadow table, the tracking triggers and the registered observers.
///
/// # Observing Tables
///
/// To be notified of changes, register an observer with [`TableObserver::add_observer`].
///
/// The [`TableObserver`] by itself does not watch any table. The observed tables
/// are driven by the tables defined by each [`Observer`]. A table can be observed by many
/// observers; its triggers are removed when the last of them is removed.
///
/// # Connection Access
///
/// Methods which take a connection must run where the connection lives. Inside a
/// [`Database`](crate::database::Database) that is the transaction dispatcher worker.
///
/// # Notifications
///
/// Observers are invoked from a dedicated background thread, never from the thread running
/// the scan. Do not call [`TableObserver::add_observer`] or [`TableObserver::remove_observer`]
/// from inside an observer callback as they wait for that thread;
/// [`TableObserver::remove_observer_deferred`] is safe to use there.
pub struct TableObserver {
    schema: Arc<TableSchema>,
    state: Mutex<TrackerState>,
    sender: flume::Sender<Command>,
}

impl TableObserver {
    /// Create a new observer hub for the tables in `schema`.
    ///
    /// # Errors
    ///
    /// Returns error if the background thread fails to spawn.
    pub fn new(schema: Arc<TableSchema>) -> Result<Arc<Self>, Error> {
        let (sender, receiver) = flume::unbounded();
        let table_observer = Arc::new(Self {
            state: Mutex::new(TrackerState {
                tracker: ObservingTableTracker::new(schema.len()),
                constructed: false,
            }),
            schema,
            sender,
        });

        let weak = Arc::downgrade(&table_observer);
        std::thread::Builder::new()
            .name("sqlite_invalidation_observers".into())
            .spawn(move || {
                TableObserver::background_loop(&receiver, &weak);
            })
            .map_err(Error::Thread)?;

        Ok(table_observer)
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Register a new observer.
    ///
    /// This function returns a [`ObserverHandle`] which can later be used to
    /// remove the observer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if the observer declares a table which is not part of
    /// the schema, or an error if the observer could not be handed to the background thread.
    pub fn add_observer(&self, observer: Box<dyn Observer>) -> Result<ObserverHandle, Error> {
        let tables = self.resolve_tables(observer.tables())?;

        if self.with_tracker(|tracker| tracker.track_tables(&tables)) {
            debug!(?tables, "New tables require tracking");
        }

        let (sender, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::AddObserver(observer, tables.clone(), sender))
            .is_err()
        {
            error!("Failed to send add observer command");
            self.with_tracker(|tracker| tracker.untrack_tables(&tables));
            return Err(Error::Command);
        }

        let Ok(handle) = receiver.recv() else {
            error!("Failed to receive handle for new observer");
            return Err(Error::Command);
        };

        Ok(handle)
    }

    /// Remove an observer via its `handle` without waiting for the operation to complete.
    ///
    /// # Errors
    ///
    /// Returns error if the command to remove the observer could not be sent.
    pub fn remove_observer_deferred(&self, handle: ObserverHandle) -> Result<(), Error> {
        self.sender
            .send(Command::RemoveObserverDeferred(handle))
            .map_err(|_| Error::Command)
    }

    /// Remove an observer via its `handle` and wait for it to be removed.
    ///
    /// Once this returns, the observer will not be invoked again.
    ///
    /// # Errors
    ///
    /// Returns error if the command to remove the observer could not be sent or the reply
    /// could not be received.
    pub fn remove_observer(&self, handle: ObserverHandle) -> Result<(), Error> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Command::RemoveObserver(handle, sender))
            .map_err(|_| Error::Command)?;

        receiver.recv().map_err(|_| {
            error!("Failed to receive reply for remove observer command");
            Error::Command
        })
    }

    /// Number of observers currently interested in `table`.
    #[must_use]
    pub fn observer_count(&self, table: TableId) -> usize {
        self.read_tracker(|tracker| tracker.observer_count(table))
    }

    /// Tables with at least one observer at this point in time.
    #[must_use]
    pub fn observed_tables(&self) -> TableSet {
        self.read_tracker(ObservingTableTracker::observed_tables)
    }

    /// Tables whose triggers are installed on the connection.
    #[must_use]
    pub fn installed_tables(&self) -> TableSet {
        self.read_tracker(ObservingTableTracker::installed_tables)
    }

    /// Whether adding or removing observers left triggers to be created or dropped.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.read_tracker(ObservingTableTracker::needs_sync)
    }

    /// Prepare `connection` for tracking.
    ///
    /// Enables in memory temporary tables and recursive triggers, creates the shadow table and
    /// installs the triggers of all tables which are already observed. Calling this again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the initialization failed.
    #[tracing::instrument(level=tracing::Level::DEBUG, skip_all)]
    pub fn construct<C: SqlConnection + ?Sized>(&self, connection: &mut C) -> Result<(), C::Error> {
        {
            let mut state = self.state.lock();
            if state.constructed {
                return Ok(());
            }

            connection.sql_execute("PRAGMA temp_store = MEMORY")?;
            connection.sql_execute("PRAGMA recursive_triggers='ON'")?;
            // create tracking table and cleanup previous data if re-used.
            with_transaction(connection, |c| {
                c.sql_execute(&sql::create_shadow_table_query())?;
                c.sql_execute(&sql::empty_shadow_table_query())
            })?;

            state.constructed = true;
            state.tracker.reset_installed();
        }

        self.sync_triggers(connection)?;
        Ok(())
    }

    /// Synchronize the triggers on `connection` with the observed tables.
    ///
    /// Creates triggers for tables that gained their first observer and removes triggers of
    /// tables that lost their last one. The pass is skipped when the connection has an open
    /// write transaction; the next pass picks the changes up.
    ///
    /// Returns whether any trigger was created or dropped.
    ///
    /// # Errors
    ///
    /// Returns error if creation or removal of triggers failed. The tracked state is left
    /// untouched in that case so the next pass retries.
    #[tracing::instrument(level=tracing::Level::DEBUG, skip_all)]
    pub fn sync_triggers<C: SqlConnection + ?Sized>(
        &self,
        connection: &mut C,
    ) -> Result<bool, C::Error> {
        let mut state = self.state.lock();
        if !state.constructed || !state.tracker.needs_sync() {
            return Ok(false);
        }

        if connection.sql_in_write_transaction() {
            debug!("Write transaction active, deferring trigger sync");
            return Ok(false);
        }

        let (installed, changes) = state.tracker.calculate_changes();
        if changes.is_empty() {
            debug!("No changes");
            state.tracker.apply_changes(installed);
            return Ok(false);
        }

        with_transaction(connection, |tx| {
            for change in &changes {
                match *change {
                    ObservedTableOp::Add(id) => {
                        let name = self.table_name(id);
                        debug!("Add triggers for table {name} id={id}");
                        sql::create_triggers(tx, name, id)?;
                    }
                    ObservedTableOp::Remove(id) => {
                        let name = self.table_name(id);
                        debug!("Remove triggers for table {name} id={id}");
                        sql::drop_triggers(tx, name, id)?;
                    }
                }
            }
            Ok(())
        })?;

        state.tracker.apply_changes(installed);
        Ok(true)
    }

    /// Check the shadow table and notify the observers of the modified tables.
    ///
    /// The flags are read and reset in a single transaction, so every modification is reported
    /// exactly once. When the connection has an open write transaction the check does nothing
    /// and returns an empty set: running it would observe uncommitted state.
    ///
    /// Returns the set of tables that were modified since the last check.
    ///
    /// # Errors
    ///
    /// Returns error if we failed to read from or reset the shadow table.
    #[tracing::instrument(level=tracing::Level::DEBUG, skip_all)]
    pub fn check_for_table_updates<C: SqlConnection + ?Sized>(
        &self,
        connection: &mut C,
    ) -> Result<TableSet, C::Error> {
        if !self.state.lock().constructed {
            return Ok(TableSet::new());
        }

        if connection.sql_in_write_transaction() {
            trace!("Write transaction active, skipping invalidation check");
            return Ok(TableSet::new());
        }

        if let Err(e) = self.sync_triggers(connection) {
            error!(error = %e, "Failed to sync tracking triggers");
        }

        let modified_table_ids = with_transaction(connection, |c| {
            let ids = c.sql_query_values(&sql::select_invalidated_tables_query())?;
            if !ids.is_empty() {
                c.sql_execute(&sql::reset_invalidated_tables_query())?;
            }
            Ok(ids)
        })?;

        let mut result = TableSet::with_capacity(self.schema.len());
        for idx in modified_table_ids {
            let id = TableId::from_index(idx);
            if self.schema.contains(id) {
                debug!("Table {} has been modified", id);
                result.insert(id);
            } else {
                warn!(table_id = idx, "Shadow table contains unknown table id");
            }
        }

        if !result.is_empty() {
            self.publish_changes(result.clone());
        }

        Ok(result)
    }

    /// Remove all triggers and the shadow table from `connection`.
    ///
    /// Observers stay registered; calling [`Self::construct()`] again restores tracking.
    ///
    /// # Errors
    ///
    /// Returns error if the queries failed.
    pub fn stop_tracking<C: SqlConnection + ?Sized>(
        &self,
        connection: &mut C,
    ) -> Result<(), C::Error> {
        let mut state = self.state.lock();
        let installed = state.tracker.installed_tables();
        with_transaction(connection, |tx| {
            for id in &installed {
                sql::drop_triggers(tx, self.table_name(id), id)?;
            }
            tx.sql_execute(&sql::drop_shadow_table_query())
        })?;
        state.tracker.reset_installed();
        state.constructed = false;
        Ok(())
    }

    fn publish_changes(&self, tables: TableSet) {
        if self.sender.send(Command::PublishChanges(tables)).is_err() {
            error!("Table observer could not communicate with background thread");
        }
    }

    fn resolve_tables(&self, tables: Vec<TableId>) -> Result<TableSet, Error> {
        let mut set = TableSet::with_capacity(self.schema.len());
        for id in tables {
            if !self.schema.contains(id) {
                return Err(Error::UnknownTable(id));
            }
            set.insert(id);
        }
        Ok(set)
    }

    fn table_name(&self, id: TableId) -> &str {
        // Every id reaching the tracker was validated against the schema.
        self.schema.table_name(id).unwrap_or_default()
    }

    fn with_tracker<R>(&self, f: impl FnOnce(&mut ObservingTableTracker) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.tracker)
    }

    fn read_tracker<R>(&self, f: impl FnOnce(&ObservingTableTracker) -> R) -> R {
        let state = self.state.lock();
        f(&state.tracker)
    }

    #[tracing::instrument(level= tracing::Level::TRACE, skip_all)]
    fn background_loop(receiver: &flume::Receiver<Command>, table_observer: &Weak<TableObserver>) {
        let mut observers: SlotMap<ObserverHandle, RegisteredObserver> =
            SlotMap::with_capacity_and_key(4);

        let untrack = |registered: &RegisteredObserver| {
            if let Some(table_observer) = table_observer.upgrade() {
                table_observer.with_tracker(|tracker| tracker.untrack_tables(&registered.tables));
            }
        };

        while let Ok(command) = receiver.recv() {
            match command {
                Command::AddObserver(observer, tables, reply) => {
                    let handle = observers.insert(RegisteredObserver { observer, tables });
                    if reply.send(handle).is_err() {
                        error!(
                            "Failed to send reply back to caller, new observer will not be added"
                        );
                        if let Some(registered) = observers.remove(handle) {
                            untrack(&registered);
                        }
                    }
                }
                Command::RemoveObserverDeferred(handle) => {
                    if let Some(registered) = observers.remove(handle) {
                        untrack(&registered);
                    }
                }
                Command::RemoveObserver(handle, reply) => {
                    if let Some(registered) = observers.remove(handle) {
                        untrack(&registered);
                    }

                    if reply.send(()).is_err() {
                        error!("Failed to send reply for observer removal");
                    }
                }
                Command::PublishChanges(tables) => {
                    debug!(?tables, "Publishing invalidated tables");
                    for (handle, registered) in &observers {
                        let changed = registered.tables.intersection(&tables);
                        if changed.is_empty() {
                            continue;
                        }
                        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            registered.observer.on_tables_invalidated(&changed);
                        }));
                        if result.is_err() {
                            error!(?handle, "Observer panicked while handling invalidation");
                        }
                    }
                }
            }
        }
    }
}

struct RegisteredObserver {
    observer: Box<dyn Observer>,
    tables: TableSet,
}

/// Commands send to the background thread.
enum Command {
    /// Add a new observer
    AddObserver(Box<dyn Observer>, TableSet, oneshot::Sender<ObserverHandle>),
    /// Remove an observer
    RemoveObserverDeferred(ObserverHandle),
    /// Remove an observer and wait for the operation to finish.
    RemoveObserver(ObserverHandle, oneshot::Sender<()>),
    /// Publish new changes
    PublishChanges(TableSet),
}

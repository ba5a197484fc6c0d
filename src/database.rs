//! Database handle wiring invalidation tracking, notifications and the transaction worker
//! together for one connection.
use crate::config::DatabaseConfig;
use crate::connection::SqlConnection;
use crate::dispatcher::{
    TransactionBuilder, TransactionDispatcher, TransactionHandle, TransactionHooks, UnitOutcome,
};
use crate::error::Error;
use crate::model::WriteContext;
use crate::notify::{
    DirectModelNotifier, ListenerHandle, ModelNotifier, Notification, NotificationStream,
    NotifyDistributor,
};
use crate::observer::{Observer, ObserverHandle, TableObserver};
use crate::query::ExecutableQuery;
use crate::reactive::{self, LiveQuery};
use crate::table::{TableId, TableSchema, TableSet};
use std::sync::Arc;
use tracing::{debug, error};

/// Name of the units of work which only apply pending trigger changes.
const SYNC_TRIGGERS_TRANSACTION_NAME: &str = "sync_triggers";

/// Handle to one observed database.
///
/// The handle owns the writable connection, which lives on the transaction worker thread.
/// All access to the connection goes through units of work queued with
/// [`Database::transaction`]. Before each unit the tracking triggers are brought up to date
/// with the registered observers. After each unit the notifications it recorded are delivered
/// if it committed, and, unless disabled in [`DatabaseConfig`], the shadow table is scanned and
/// the observers of the modified tables are invoked.
///
/// Dropping the handle shuts the worker down.
pub struct Database<C> {
    schema: Arc<TableSchema>,
    observer: Arc<TableObserver>,
    notifier: Arc<DirectModelNotifier>,
    dispatcher: TransactionDispatcher<C>,
}

impl<C> Database<C>
where
    C: SqlConnection + Send + 'static,
{
    /// Take ownership of `connection` and prepare it for tracking the tables in `schema`.
    ///
    /// # Errors
    ///
    /// Returns error if a background thread failed to spawn or the connection could not be
    /// prepared.
    pub fn open(connection: C, schema: TableSchema, config: DatabaseConfig) -> Result<Self, Error> {
        let schema = Arc::new(schema);
        let observer = TableObserver::new(Arc::clone(&schema))?;
        let notifier = DirectModelNotifier::new()?;
        let hooks = DatabaseHooks {
            observer: Arc::clone(&observer),
            distributor: NotifyDistributor::new(Arc::clone(&notifier) as Arc<dyn ModelNotifier>),
            auto_check: config.auto_check_after_commit,
        };
        let dispatcher = TransactionDispatcher::new(
            &config.worker_name,
            config.queue_kind,
            connection,
            Box::new(hooks),
        )?;

        let constructing = Arc::clone(&observer);
        dispatcher
            .transaction(move |ctx| {
                constructing
                    .construct(ctx.connection())
                    .map_err(Error::sql)
            })
            .name("construct")
            .run_in_transaction(false)
            .enqueue()
            .wait()?;
        debug!(tables = schema.len(), "Database opened");

        Ok(Self {
            schema,
            observer,
            notifier,
            dispatcher,
        })
    }

    /// Register `observer` and queue the installation of the triggers it needs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if the observer declares a table which is not part of
    /// the schema.
    pub fn add_observer(&self, observer: Box<dyn Observer>) -> Result<ObserverHandle, Error> {
        let handle = self.observer.add_observer(observer)?;
        self.request_trigger_sync();
        Ok(handle)
    }

    /// Remove an observer. Once this returns it will not be invoked again.
    ///
    /// Must not be called from an observer callback, see
    /// [`TableObserver::remove_observer_deferred`].
    ///
    /// # Errors
    ///
    /// Returns error if the observer thread could not be reached.
    pub fn remove_observer(&self, handle: ObserverHandle) -> Result<(), Error> {
        self.observer.remove_observer(handle)?;
        self.request_trigger_sync();
        Ok(())
    }

    /// Start building a unit of work, see [`TransactionDispatcher::transaction`].
    pub fn transaction<T, F>(&self, work: F) -> TransactionBuilder<'_, C, T, F>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        self.dispatcher.transaction(work)
    }

    /// Queue `work` in a transaction with default options.
    pub fn enqueue<T, F>(&self, work: F) -> TransactionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        self.dispatcher.enqueue(work)
    }

    /// Queue `work` in a transaction and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the error of the unit of work.
    pub fn execute<T, F>(&self, work: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        self.dispatcher.execute(work)
    }

    /// Queue a scan of the shadow table.
    ///
    /// The handle resolves to the tables modified since the previous scan. Observers of those
    /// tables are invoked as well.
    pub fn check_for_table_updates(&self) -> TransactionHandle<TableSet> {
        let observer = Arc::clone(&self.observer);
        self.dispatcher
            .transaction(move |ctx| {
                observer
                    .check_for_table_updates(ctx.connection())
                    .map_err(Error::sql)
            })
            .name("check_for_table_updates")
            .run_in_transaction(false)
            .enqueue()
    }

    /// Observe the results of `query`.
    ///
    /// The query runs once right away and again whenever one of its tables is modified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTable`] if the query declares a table which is not part of the
    /// schema.
    pub fn observe_query<Q>(&self, query: Q) -> Result<LiveQuery<Q::Output>, Error>
    where
        Q: ExecutableQuery<C>,
    {
        reactive::observe(&self.dispatcher, &self.observer, query)
    }

    /// Queue the removal of all triggers and of the shadow table.
    ///
    /// Observers stay registered but are no longer invoked.
    pub fn stop_tracking(&self) -> TransactionHandle<()> {
        let observer = Arc::clone(&self.observer);
        self.dispatcher
            .transaction(move |ctx| observer.stop_tracking(ctx.connection()).map_err(Error::sql))
            .name("stop_tracking")
            .run_in_transaction(false)
            .enqueue()
    }

    fn request_trigger_sync(&self) {
        // Triggers are synced before every unit, the unit itself has nothing to do.
        let _ = self
            .dispatcher
            .transaction(|_| Ok(()))
            .name(SYNC_TRIGGERS_TRANSACTION_NAME)
            .run_in_transaction(false)
            .enqueue();
    }
}

impl<C> Database<C> {
    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    #[must_use]
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.schema.table_id(name)
    }

    #[must_use]
    pub fn table_observer(&self) -> &Arc<TableObserver> {
        &self.observer
    }

    #[must_use]
    pub fn dispatcher(&self) -> &TransactionDispatcher<C> {
        &self.dispatcher
    }

    /// Subscribe to the notifications of every committed modification.
    #[must_use]
    pub fn subscribe_notifications(&self) -> NotificationStream {
        self.notifier.subscribe()
    }

    /// Subscribe to the notifications of committed modifications of `tables`.
    #[must_use]
    pub fn subscribe_table_notifications(
        &self,
        tables: impl IntoIterator<Item = TableId>,
    ) -> NotificationStream {
        self.notifier.subscribe_tables(tables)
    }

    /// Register a callback for every committed modification.
    ///
    /// Waits for the notifier thread, so it must not be called from inside a listener, see
    /// [`DirectModelNotifier::add_listener`]. Removing a listener from inside one is fine.
    ///
    /// # Errors
    ///
    /// Returns error if called from a listener or if the notifier thread could not be reached.
    pub fn add_notification_listener(
        &self,
        listener: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, Error> {
        self.notifier.add_listener(listener)
    }

    /// # Errors
    ///
    /// Returns error if the notifier thread could not be reached.
    pub fn remove_notification_listener(&self, handle: ListenerHandle) -> Result<(), Error> {
        self.notifier.remove_listener(handle)
    }

    /// Stop the worker. Queued units of work are cancelled, the running one completes.
    pub fn quit(&self) {
        self.dispatcher.quit();
    }
}

impl<C> Drop for Database<C> {
    fn drop(&mut self) {
        self.dispatcher.quit();
    }
}

struct DatabaseHooks {
    observer: Arc<TableObserver>,
    distributor: NotifyDistributor,
    auto_check: bool,
}

impl<C: SqlConnection> TransactionHooks<C> for DatabaseHooks {
    fn before_execute(&mut self, connection: &mut C) {
        if let Err(e) = self.observer.sync_triggers(connection) {
            error!(error = %e, "Failed to sync tracking triggers");
        }
    }

    fn after_execute(&mut self, connection: &mut C, outcome: UnitOutcome) {
        if let UnitOutcome::Succeeded(notifications) = outcome {
            self.distributor.on_changes(notifications);
        }

        // Units without a transaction may have written before failing, so scan either way.
        if self.auto_check {
            if let Err(e) = self.observer.check_for_table_updates(connection) {
                error!(error = %e, "Failed to check for table updates");
            }
        }
    }
}

//! Queries which re-run whenever the tables they read from are modified.
use crate::connection::SqlConnection;
use crate::dispatcher::{Canceller, TransactionDispatcher};
use crate::error::Error;
use crate::observer::{FnObserver, ObserverHandle, TableObserver};
use crate::query::ExecutableQuery;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Name of the units of work running live queries.
pub const LIVE_QUERY_TRANSACTION_NAME: &str = "live_query";

/// Result stream of an observed query, see
/// [`Database::observe_query`](crate::database::Database::observe_query).
///
/// The first result is the initial execution. Every later result follows a modification of
/// one of the query's tables. Several modifications in quick succession may be folded into a
/// single new result, but a result is never older than the one before it.
///
/// Dropping the live query unsubscribes.
pub struct LiveQuery<T> {
    receiver: flume::Receiver<Result<T, Error>>,
    state: Arc<LiveState>,
    observer: Arc<TableObserver>,
    handle: ObserverHandle,
}

struct LiveState {
    /// A run is queued and has not started yet.
    pending: AtomicBool,
    closed: AtomicBool,
    scheduled: Mutex<Option<Canceller>>,
}

impl<T> LiveQuery<T> {
    /// Block until the next result. Returns `None` once unsubscribed or the database is gone.
    #[must_use]
    pub fn recv(&self) -> Option<Result<T, Error>> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv().ok()
    }

    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Next result if one is already available.
    #[must_use]
    pub fn try_recv(&self) -> Option<Result<T, Error>> {
        if self.is_closed() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    pub async fn recv_async(&self) -> Option<Result<T, Error>> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv_async().await.ok()
    }

    /// Stop observing. A queued re-run is cancelled and no further results are delivered.
    pub fn unsubscribe(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(canceller) = self.state.scheduled.lock().take() {
            canceller.cancel();
        }
        // May run on the observer thread, which must not wait for itself.
        if let Err(e) = self.observer.remove_observer_deferred(self.handle) {
            warn!(error = %e, "Failed to remove live query observer");
        }
        debug!(handle = ?self.handle, "Live query unsubscribed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Schedules runs of one query on the dispatcher.
struct Refresher<C, Q: ExecutableQuery<C>> {
    dispatcher: TransactionDispatcher<C>,
    query: Arc<Mutex<Q>>,
    sender: flume::Sender<Result<Q::Output, Error>>,
    state: Arc<LiveState>,
}

impl<C, Q> Refresher<C, Q>
where
    C: SqlConnection + Send + 'static,
    Q: ExecutableQuery<C>,
{
    fn schedule(&self) {
        if self.state.closed.load(Ordering::Acquire) {
            return;
        }
        if self.state.pending.swap(true, Ordering::AcqRel) {
            trace!("Live query refresh already pending");
            return;
        }

        let mut run = PendingRun {
            state: Arc::clone(&self.state),
            started: false,
        };
        let query = Arc::clone(&self.query);
        let sender = self.sender.clone();
        let handle = self
            .dispatcher
            .transaction(move |ctx| {
                // Invalidations from here on need another run.
                run.start();
                let state = &run.state;
                if state.closed.load(Ordering::Acquire) {
                    return Ok(());
                }
                let result = query.lock().execute(ctx.connection());
                if state.closed.load(Ordering::Acquire) || sender.send(result).is_err() {
                    trace!("Live query result dropped");
                }
                Ok(())
            })
            .name(LIVE_QUERY_TRANSACTION_NAME)
            .run_in_transaction(false)
            .enqueue();
        *self.state.scheduled.lock() = Some(handle.canceller());
    }
}

/// Clears the pending flag if a queued run is dropped before it starts.
struct PendingRun {
    state: Arc<LiveState>,
    started: bool,
}

impl PendingRun {
    fn start(&mut self) {
        self.started = true;
        self.state.pending.store(false, Ordering::Release);
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if !self.started {
            self.state.pending.store(false, Ordering::Release);
        }
    }
}

/// Register `query` with `observer` and schedule its first run on `dispatcher`.
pub(crate) fn observe<C, Q>(
    dispatcher: &TransactionDispatcher<C>,
    observer: &Arc<TableObserver>,
    query: Q,
) -> Result<LiveQuery<Q::Output>, Error>
where
    C: SqlConnection + Send + 'static,
    Q: ExecutableQuery<C>,
{
    let tables = query.tables();
    let (sender, receiver) = flume::unbounded();
    let state = Arc::new(LiveState {
        pending: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        scheduled: Mutex::new(None),
    });
    let refresher = Refresher {
        dispatcher: dispatcher.clone(),
        query: Arc::new(Mutex::new(query)),
        sender,
        state: Arc::clone(&state),
    };

    // Register before the first run so no modification slips in between.
    let refresher = Arc::new(refresher);
    let initial = Arc::clone(&refresher);
    let handle = observer.add_observer(Box::new(FnObserver::new(tables, move |_| {
        refresher.schedule();
    })))?;
    initial.schedule();

    Ok(LiveQuery {
        receiver,
        state,
        observer: Arc::clone(observer),
        handle,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::test::RecordingConnection;
    use crate::dispatcher::{NoHooks, QueueKind};
    use crate::query::FnQuery;
    use crate::table::{TableId, TableSchema};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(200);
    const ORDERS: TableId = TableId::new(0);

    struct Fixture {
        dispatcher: TransactionDispatcher<RecordingConnection>,
        connection: RecordingConnection,
        observer: Arc<TableObserver>,
    }

    impl Fixture {
        fn new() -> Self {
            let connection = RecordingConnection::default();
            let dispatcher = TransactionDispatcher::new(
                "live_query_test",
                QueueKind::Fifo,
                connection.clone(),
                Box::new(NoHooks),
            )
            .unwrap();
            let observer = TableObserver::new(Arc::new(TableSchema::new(["orders", "users"])))
                .unwrap();
            let constructing = Arc::clone(&observer);
            dispatcher
                .transaction(move |ctx| constructing.construct(ctx.connection()).map_err(Error::sql))
                .run_in_transaction(false)
                .enqueue()
                .wait()
                .unwrap();
            Self {
                dispatcher,
                connection,
                observer,
            }
        }

        /// Mark `tables` as modified and run a scan on the worker.
        fn invalidate(&self, tables: &[TableId]) {
            *self.connection.values.lock() = tables.iter().map(|t| t.index()).collect();
            let observer = Arc::clone(&self.observer);
            self.dispatcher
                .transaction(move |ctx| {
                    observer
                        .check_for_table_updates(ctx.connection())
                        .map_err(Error::sql)
                })
                .run_in_transaction(false)
                .enqueue()
                .wait()
                .unwrap();
        }

        fn block_worker(&self) -> mpsc::Sender<()> {
            let (release, wait) = mpsc::channel::<()>();
            let (started, has_started) = mpsc::channel::<()>();
            let _ = self
                .dispatcher
                .transaction(move |_| {
                    started.send(()).unwrap();
                    wait.recv_timeout(TIMEOUT).unwrap();
                    Ok(())
                })
                .run_in_transaction(false)
                .enqueue();
            has_started.recv_timeout(TIMEOUT).unwrap();
            release
        }
    }

    fn counting_query(
        runs: &Arc<AtomicUsize>,
    ) -> impl ExecutableQuery<RecordingConnection, Output = usize> {
        let runs = Arc::clone(runs);
        FnQuery::new(
            [ORDERS],
            move |_: &mut RecordingConnection| -> Result<usize, Error> {
                Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
            },
        )
    }

    #[test]
    fn emits_initial_result_and_after_invalidation() {
        let fixture = Fixture::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let live = observe(&fixture.dispatcher, &fixture.observer, counting_query(&runs)).unwrap();

        assert_eq!(live.recv_timeout(TIMEOUT).unwrap().unwrap(), 1);
        assert_eq!(fixture.observer.observer_count(ORDERS), 1);

        fixture.invalidate(&[TableId::new(1)]);
        assert!(live.recv_timeout(QUIET).is_none());

        fixture.invalidate(&[ORDERS]);
        assert_eq!(live.recv_timeout(TIMEOUT).unwrap().unwrap(), 2);
        assert!(live.recv_timeout(QUIET).is_none());
    }

    #[test]
    fn pending_refreshes_are_coalesced() {
        let fixture = Fixture::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = flume::unbounded();
        let refresher = Refresher {
            dispatcher: fixture.dispatcher.clone(),
            query: Arc::new(Mutex::new(counting_query(&runs))),
            sender,
            state: Arc::new(LiveState {
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                scheduled: Mutex::new(None),
            }),
        };

        let release = fixture.block_worker();
        refresher.schedule();
        refresher.schedule();
        refresher.schedule();
        assert_eq!(fixture.dispatcher.pending(), 1);
        release.send(()).unwrap();

        assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap().unwrap(), 1);
        assert!(receiver.recv_timeout(QUIET).is_err());

        // Once the run started a new invalidation schedules another one.
        refresher.schedule();
        assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap().unwrap(), 2);
    }

    #[test]
    fn cancelled_refresh_does_not_block_later_ones() {
        let fixture = Fixture::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = flume::unbounded();
        let refresher = Refresher {
            dispatcher: fixture.dispatcher.clone(),
            query: Arc::new(Mutex::new(counting_query(&runs))),
            sender,
            state: Arc::new(LiveState {
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                scheduled: Mutex::new(None),
            }),
        };

        let release = fixture.block_worker();
        refresher.schedule();
        assert_eq!(
            fixture.dispatcher.cancel_named(LIVE_QUERY_TRANSACTION_NAME),
            1
        );
        assert!(!refresher.state.pending.load(Ordering::Acquire));
        release.send(()).unwrap();
        assert!(receiver.recv_timeout(QUIET).is_err());

        refresher.schedule();
        assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap().unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_query_survives_cancel_named() {
        let fixture = Fixture::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = fixture.block_worker();
        let live = observe(&fixture.dispatcher, &fixture.observer, counting_query(&runs)).unwrap();
        assert_eq!(
            fixture.dispatcher.cancel_named(LIVE_QUERY_TRANSACTION_NAME),
            1
        );
        release.send(()).unwrap();
        assert!(live.recv_timeout(QUIET).is_none());

        fixture.invalidate(&[ORDERS]);
        assert_eq!(live.recv_timeout(TIMEOUT).unwrap().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_cancels_pending_run() {
        let fixture = Fixture::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = fixture.block_worker();
        let live = observe(&fixture.dispatcher, &fixture.observer, counting_query(&runs)).unwrap();
        assert_eq!(fixture.dispatcher.pending(), 1);

        live.unsubscribe();
        assert_eq!(fixture.dispatcher.pending(), 0);
        release.send(()).unwrap();

        assert!(live.recv_timeout(QUIET).is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Observer removal is deferred to the observer thread.
        let start = std::time::Instant::now();
        while fixture.observer.observer_count(ORDERS) != 0 && start.elapsed() < TIMEOUT {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fixture.observer.observer_count(ORDERS), 0);
    }

    #[test]
    fn query_errors_are_emitted() {
        let fixture = Fixture::new();
        let live = observe(
            &fixture.dispatcher,
            &fixture.observer,
            FnQuery::new([ORDERS], |_: &mut RecordingConnection| -> Result<(), Error> {
                Err(Error::failed("no such column"))
            }),
        )
        .unwrap();
        assert!(matches!(
            live.recv_timeout(TIMEOUT),
            Some(Err(Error::Failed(_)))
        ));
    }

    #[test]
    fn unknown_table_is_rejected() {
        let fixture = Fixture::new();
        let result = observe(
            &fixture.dispatcher,
            &fixture.observer,
            FnQuery::new(
                [TableId::new(9)],
                |_: &mut RecordingConnection| -> Result<(), Error> { Ok(()) },
            ),
        );
        assert!(matches!(result, Err(Error::UnknownTable(id)) if id == TableId::new(9)));
        assert_eq!(fixture.dispatcher.pending(), 0);
    }
}

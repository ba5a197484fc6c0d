//! Serialized execution of units of work against the single writable connection.
//!
//! The [`TransactionDispatcher`] owns the connection and moves it into a dedicated worker
//! thread. Units of work are queued with [`TransactionDispatcher::transaction`] and run one at
//! a time, either in FIFO order or by [`Priority`] with FIFO as tie break.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──► Queued ──► Running ──► Succeeded
//!               │                └──► Failed
//!               └──► Cancelled
//! ```
//!
//! A unit can only be cancelled while it is queued. Once it started running it always runs to
//! completion and its callbacks are delivered.
//!
//! # Callbacks
//!
//! Success and error callbacks run on the worker thread, right after the unit finished and
//! before the next unit starts. Callbacks of units on the same dispatcher therefore fire in the
//! order the units ran. They should be short; blocking in them blocks the queue.
use crate::error::Error;
use crate::model::WriteContext;
use crate::notify::Notification;
use crate::connection::SqlConnection;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

mod queue;

use queue::{Job, Pending, QueueControl, TransactionQueue, TransactionShared};

/// Priority of a unit of work. Only honored by [`QueueKind::Priority`] queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Work the user is actively waiting on.
    Ui,
}

/// Ordering policy of a dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueKind {
    /// Strict enqueue order.
    #[default]
    Fifo,
    /// Highest [`Priority`] first, enqueue order among equal priorities.
    Priority,
}

/// Lifecycle state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Succeeded,
            4 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Whether the unit reached a final state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Identity of a unit of work, unique per dispatcher and increasing in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a unit of work handed to its callbacks.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub name: Option<Arc<str>>,
    pub priority: Priority,
}

/// Outcome of a unit of work as seen by [`TransactionHooks::after_execute`].
#[derive(Debug)]
pub enum UnitOutcome {
    /// The unit committed; carries the notifications it produced, in order.
    Succeeded(Vec<Notification>),
    /// The unit failed and its changes were rolled back.
    Failed,
}

/// Extension points invoked by the worker around every unit of work.
pub trait TransactionHooks<C>: Send {
    /// Runs before the unit starts, outside of any transaction it opens.
    fn before_execute(&mut self, _connection: &mut C) {}

    /// Runs after the unit committed or rolled back and before its callbacks fire.
    fn after_execute(&mut self, _connection: &mut C, _outcome: UnitOutcome) {}
}

/// Hooks which do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<C> TransactionHooks<C> for NoHooks {}

type SuccessCallback<T> = Box<dyn FnOnce(&TransactionInfo, &T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&TransactionInfo, &Error) + Send>;

/// Serial executor owning the writable connection.
///
/// Cloning the dispatcher is cheap; all clones feed the same worker. The worker stops when
/// [`TransactionDispatcher::quit`] is called or the last clone is dropped.
pub struct TransactionDispatcher<C> {
    inner: Arc<DispatcherInner<C>>,
}

impl<C> Clone for TransactionDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DispatcherInner<C> {
    kind: QueueKind,
    queue: Arc<TransactionQueue<C>>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C> TransactionDispatcher<C>
where
    C: SqlConnection + Send + 'static,
{
    /// Start a dispatcher named `name` which takes ownership of `connection`.
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread fails to spawn.
    pub fn new(
        name: &str,
        kind: QueueKind,
        connection: C,
        hooks: Box<dyn TransactionHooks<C>>,
    ) -> Result<Self, Error> {
        let queue = Arc::new(TransactionQueue::new());
        let worker_queue = Arc::clone(&queue);
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                worker_loop(&worker_queue, connection, hooks);
            })
            .map_err(Error::Thread)?;

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                kind,
                queue,
                next_id: AtomicU64::new(1),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Start building a unit of work around `work`.
    ///
    /// The unit is not queued until [`TransactionBuilder::enqueue`] is called.
    pub fn transaction<T, F>(&self, work: F) -> TransactionBuilder<'_, C, T, F>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        TransactionBuilder {
            dispatcher: self,
            work,
            name: None,
            priority: Priority::Normal,
            run_in_transaction: true,
            on_success: None,
            on_error: None,
        }
    }

    /// Queue `work` with default options.
    pub fn enqueue<T, F>(&self, work: F) -> TransactionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        self.transaction(work).enqueue()
    }

    /// Queue `work` and block until it finished.
    ///
    /// Must not be called from inside a unit of work of the same dispatcher.
    ///
    /// # Errors
    ///
    /// Returns the error of the unit of work, or [`Error::Closed`] if the dispatcher is shut
    /// down.
    pub fn execute<T, F>(&self, work: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
    {
        self.enqueue(work).wait()
    }
}

impl<C> TransactionDispatcher<C> {
    /// Cancel every queued unit of work named `name`.
    ///
    /// Returns the number of cancelled units. Units that already started are not affected.
    pub fn cancel_named(&self, name: &str) -> usize {
        let cancelled = self.inner.queue.cancel_named(name);
        debug!(name, cancelled, "Cancelled named transactions");
        cancelled
    }

    /// Number of units of work waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    #[must_use]
    pub fn queue_kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Stop the worker and discard all queued work.
    ///
    /// The unit currently running, if any, completes normally. When called from outside the
    /// worker this waits for it to finish.
    pub fn quit(&self) {
        self.inner.quit();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    fn next_info(&self, name: Option<Arc<str>>, priority: Priority) -> TransactionInfo {
        TransactionInfo {
            id: TransactionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            name,
            priority,
        }
    }
}

impl<C> DispatcherInner<C> {
    fn quit(&self) {
        let discarded = self.queue.quit();
        if discarded != 0 {
            debug!(discarded, "Discarded pending transactions");
        }

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // Joining from the worker itself would never return.
        if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
            error!("Transaction worker panicked");
        }
    }
}

impl<C> Drop for DispatcherInner<C> {
    fn drop(&mut self) {
        self.quit();
    }
}

/// Builder for a unit of work, see [`TransactionDispatcher::transaction`].
#[must_use = "the unit of work is only queued once `enqueue` is called"]
pub struct TransactionBuilder<'d, C, T, F> {
    dispatcher: &'d TransactionDispatcher<C>,
    work: F,
    name: Option<Arc<str>>,
    priority: Priority,
    run_in_transaction: bool,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<C, T, F> TransactionBuilder<'_, C, T, F>
where
    C: 'static,
    T: Send + 'static,
    F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send + 'static,
{
    /// Name of the unit, used by [`TransactionDispatcher::cancel_named`].
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the work is wrapped in `BEGIN IMMEDIATE`/`COMMIT`. Enabled by default.
    ///
    /// Without a transaction every statement commits on its own and a failure can't undo the
    /// statements that already ran.
    pub fn run_in_transaction(mut self, enabled: bool) -> Self {
        self.run_in_transaction = enabled;
        self
    }

    /// Invoked on the worker with the produced value when the unit succeeded.
    pub fn on_success(mut self, callback: impl FnOnce(&TransactionInfo, &T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Invoked on the worker when the unit failed.
    pub fn on_error(
        mut self,
        callback: impl FnOnce(&TransactionInfo, &Error) + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Queue the unit of work.
    ///
    /// If the dispatcher was shut down, the returned handle resolves to [`Error::Closed`]
    /// and no callback is invoked.
    pub fn enqueue(self) -> TransactionHandle<T> {
        let info = self.dispatcher.next_info(self.name, self.priority);
        let shared = Arc::new(TransactionShared::new(info));
        let (sender, receiver) = oneshot::channel();
        let job = TypedJob {
            work: Some(self.work),
            value: None,
            on_success: self.on_success,
            on_error: self.on_error,
            sender,
            _connection: PhantomData,
        };

        let inner = &self.dispatcher.inner;
        let pending = Pending::new(
            inner.kind,
            Arc::clone(&shared),
            self.run_in_transaction,
            Box::new(job),
        );
        trace!(id = %shared.info.id, name = ?shared.info.name, "Enqueue transaction");
        if let Err(pending) = inner.queue.push(pending) {
            debug!(id = %shared.info.id, "Dispatcher closed, rejecting transaction");
            shared.set_state(TransactionState::Cancelled);
            pending.job.reject(Error::Closed);
        }

        let queue: Weak<dyn QueueControl> = Arc::downgrade(&inner.queue) as Weak<dyn QueueControl>;
        TransactionHandle {
            canceller: Canceller { shared, queue },
            receiver,
        }
    }
}

struct TypedJob<C, T, F> {
    work: Option<F>,
    value: Option<T>,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
    sender: oneshot::Sender<Result<T, Error>>,
    _connection: PhantomData<fn(&mut C)>,
}

impl<C, T, F> Job<C> for TypedJob<C, T, F>
where
    T: Send,
    F: FnOnce(&mut WriteContext<'_, C>) -> Result<T, Error> + Send,
{
    fn execute(&mut self, context: &mut WriteContext<'_, C>) -> Result<(), Error> {
        let work = self.work.take().ok_or(Error::Command)?;
        self.value = Some(work(context)?);
        Ok(())
    }

    fn complete(self: Box<Self>, info: &TransactionInfo, error: Option<Error>) {
        let this = *self;
        // A panicking callback must not change what the handle reports.
        let result = match (error, this.value) {
            (None, Some(value)) => {
                if let Some(on_success) = this.on_success {
                    guarded("success callback", || on_success(info, &value));
                }
                Ok(value)
            }
            (error, _) => {
                let error = error.unwrap_or(Error::Command);
                if let Some(on_error) = this.on_error {
                    guarded("error callback", || on_error(info, &error));
                }
                Err(error)
            }
        };
        // Nobody waiting on the handle is fine.
        let _ = this.sender.send(result);
    }

    fn reject(self: Box<Self>, error: Error) {
        let _ = self.sender.send(Err(error));
    }
}

/// Type erased handle able to cancel a queued unit of work.
#[derive(Clone)]
pub struct Canceller {
    shared: Arc<TransactionShared>,
    queue: Weak<dyn QueueControl>,
}

impl Canceller {
    /// Remove the unit from the queue if it has not started yet.
    ///
    /// Returns whether the unit was cancelled. Cancelling a running or finished unit is a
    /// no-op.
    pub fn cancel(&self) -> bool {
        let cancelled = match self.queue.upgrade() {
            Some(queue) => queue.cancel(&self.shared),
            None => self
                .shared
                .transition(TransactionState::Queued, TransactionState::Cancelled),
        };
        if cancelled {
            debug!(id = %self.shared.info.id, "Transaction cancelled");
        }
        cancelled
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    #[must_use]
    pub fn info(&self) -> &TransactionInfo {
        &self.shared.info
    }
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller")
            .field("info", &self.shared.info)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Handle to a queued unit of work.
///
/// Dropping the handle does not cancel the unit.
pub struct TransactionHandle<T> {
    canceller: Canceller,
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T> TransactionHandle<T> {
    /// See [`Canceller::cancel`].
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// A cancel handle which can outlive this handle.
    #[must_use]
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.canceller.state()
    }

    #[must_use]
    pub fn info(&self) -> &TransactionInfo {
        self.canceller.info()
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.canceller.info().id
    }

    /// Block until the unit of work finished.
    ///
    /// Must not be called from inside a unit of work of the same dispatcher.
    ///
    /// # Errors
    ///
    /// Returns the error of the unit, [`Error::Cancelled`] if it never ran or
    /// [`Error::Closed`] if the dispatcher was shut down before it was queued.
    pub fn wait(self) -> Result<T, Error> {
        self.receiver.recv().unwrap_or(Err(Error::Cancelled))
    }

    /// Block for at most `timeout`.
    ///
    /// Returns `None` if the unit did not finish in time. The unit keeps running; only the
    /// caller stops waiting. Once a result was returned, later calls report
    /// [`Error::Cancelled`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(oneshot::RecvTimeoutError::Timeout) => None,
            Err(oneshot::RecvTimeoutError::Disconnected) => Some(Err(Error::Cancelled)),
        }
    }

    /// Wait asynchronously for the unit of work to finish.
    ///
    /// # Errors
    ///
    /// See [`Self::wait`].
    pub async fn outcome(self) -> Result<T, Error> {
        self.receiver.await.unwrap_or(Err(Error::Cancelled))
    }
}

impl<T> std::fmt::Debug for TransactionHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("canceller", &self.canceller)
            .finish_non_exhaustive()
    }
}

#[tracing::instrument(level= tracing::Level::TRACE, skip_all)]
fn worker_loop<C: SqlConnection>(
    queue: &TransactionQueue<C>,
    mut connection: C,
    mut hooks: Box<dyn TransactionHooks<C>>,
) {
    // Units come out of the queue already marked running, cancelling them is no longer
    // possible.
    while let Some(pending) = queue.next() {
        run_pending(&mut connection, hooks.as_mut(), pending);
    }
    debug!("Transaction worker stopped");
}

fn run_pending<C: SqlConnection>(
    connection: &mut C,
    hooks: &mut dyn TransactionHooks<C>,
    pending: Pending<C>,
) {
    let Pending {
        shared,
        run_in_transaction,
        mut job,
        ..
    } = pending;
    let info = &shared.info;
    trace!(id = %info.id, name = ?info.name, "Running transaction");

    guarded("before_execute hook", || hooks.before_execute(connection));

    let mut notifications = Vec::new();
    let result = execute_job(
        connection,
        job.as_mut(),
        run_in_transaction,
        &mut notifications,
    );

    let outcome = match &result {
        Ok(()) => UnitOutcome::Succeeded(notifications),
        Err(_) => UnitOutcome::Failed,
    };
    guarded("after_execute hook", || hooks.after_execute(connection, outcome));

    let error = match result {
        Ok(()) => {
            shared.set_state(TransactionState::Succeeded);
            None
        }
        Err(e) => {
            debug!(id = %info.id, error = %e, "Transaction failed");
            shared.set_state(TransactionState::Failed);
            Some(e)
        }
    };

    guarded("transaction callback", || job.complete(info, error));
}

/// Run `job`, wrapped in a transaction if requested.
fn execute_job<C: SqlConnection>(
    connection: &mut C,
    job: &mut dyn Job<C>,
    run_in_transaction: bool,
    notifications: &mut Vec<Notification>,
) -> Result<(), Error> {
    if run_in_transaction {
        connection.sql_begin_transaction().map_err(Error::sql)?;
    }

    let result = {
        let mut context = WriteContext::new(connection, notifications);
        match std::panic::catch_unwind(AssertUnwindSafe(|| job.execute(&mut context))) {
            Ok(result) => result,
            Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
        }
    };

    if !run_in_transaction {
        if result.is_err() {
            notifications.clear();
        }
        return result;
    }

    match result {
        Ok(()) => {
            if let Err(e) = connection.sql_commit_transaction() {
                notifications.clear();
                rollback(connection);
                return Err(Error::sql(e));
            }
            Ok(())
        }
        Err(e) => {
            notifications.clear();
            rollback(connection);
            Err(e)
        }
    }
}

fn rollback<C: SqlConnection>(connection: &mut C) {
    if !connection.sql_in_write_transaction() {
        return;
    }
    if let Err(e) = connection.sql_rollback_transaction() {
        error!(error = %e, "Failed to roll back transaction");
    }
}

/// Run `f`, logging instead of unwinding into the worker loop.
fn guarded(what: &str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(what, message = panic_message(payload.as_ref()), "Panic in transaction worker");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

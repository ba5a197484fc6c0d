//! Pending unit of work storage shared between the dispatcher handles and its worker.
use crate::dispatcher::{Priority, QueueKind, TransactionInfo, TransactionState};
use crate::error::Error;
use crate::model::WriteContext;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Type erased unit of work.
pub(crate) trait Job<C>: Send {
    /// Run the work. The produced value is kept until [`Job::complete`].
    fn execute(&mut self, context: &mut WriteContext<'_, C>) -> Result<(), Error>;

    /// Deliver the outcome to the callbacks and the handle.
    fn complete(self: Box<Self>, info: &TransactionInfo, error: Option<Error>);

    /// Resolve the handle with `error` without invoking any callback.
    fn reject(self: Box<Self>, error: Error);
}

/// State shared between a queued unit of work and its handles.
#[derive(Debug)]
pub(crate) struct TransactionShared {
    pub(crate) info: TransactionInfo,
    state: AtomicU8,
}

impl TransactionShared {
    pub(crate) fn new(info: TransactionInfo) -> Self {
        Self {
            info,
            state: AtomicU8::new(TransactionState::Created as u8),
        }
    }

    pub(crate) fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, AtomicOrdering::Release);
    }

    /// Move from `from` to `to`, returns false if the unit was not in state `from`.
    pub(crate) fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
    }
}

pub(crate) struct Pending<C> {
    pub(crate) shared: Arc<TransactionShared>,
    pub(crate) run_in_transaction: bool,
    pub(crate) job: Box<dyn Job<C>>,
    /// Priority used for ordering, constant when the queue is FIFO.
    rank: Priority,
}

impl<C> Pending<C> {
    pub(crate) fn new(
        kind: QueueKind,
        shared: Arc<TransactionShared>,
        run_in_transaction: bool,
        job: Box<dyn Job<C>>,
    ) -> Self {
        let rank = match kind {
            QueueKind::Fifo => Priority::Normal,
            QueueKind::Priority => shared.info.priority,
        };
        Self {
            shared,
            run_in_transaction,
            job,
            rank,
        }
    }

    fn sequence(&self) -> u64 {
        self.shared.info.id.0
    }
}

// BinaryHeap pops the greatest element: highest priority first, then the lowest sequence.
impl<C> Ord for Pending<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.sequence().cmp(&self.sequence()))
    }
}

impl<C> PartialOrd for Pending<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> PartialEq for Pending<C> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence() == other.sequence()
    }
}

impl<C> Eq for Pending<C> {}

struct QueueState<C> {
    pending: BinaryHeap<Pending<C>>,
    quit: bool,
}

/// Operations a handle needs from the queue, independent of the connection type.
pub(crate) trait QueueControl: Send + Sync {
    fn cancel(&self, shared: &TransactionShared) -> bool;
}

pub(crate) struct TransactionQueue<C> {
    state: Mutex<QueueState<C>>,
    available: Condvar,
}

impl<C> TransactionQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                quit: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Add `pending` to the queue, or hand it back if the queue was shut down.
    pub(crate) fn push(&self, pending: Pending<C>) -> Result<(), Pending<C>> {
        let mut state = self.state.lock();
        if state.quit {
            return Err(pending);
        }
        pending.shared.set_state(TransactionState::Queued);
        state.pending.push(pending);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a unit of work is available and mark it running. Returns `None` once the
    /// queue quit.
    pub(crate) fn next(&self) -> Option<Pending<C>> {
        let mut state = self.state.lock();
        loop {
            if state.quit {
                return None;
            }
            match state.pending.pop() {
                Some(pending)
                    if pending
                        .shared
                        .transition(TransactionState::Queued, TransactionState::Running) =>
                {
                    return Some(pending);
                }
                // Already cancelled.
                Some(_) => continue,
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Cancel every queued unit named `name`.
    pub(crate) fn cancel_named(&self, name: &str) -> usize {
        let removed = self.remove_where(|pending| {
            pending.shared.info.name.as_deref() == Some(name)
                && pending
                    .shared
                    .transition(TransactionState::Queued, TransactionState::Cancelled)
        });
        removed.len()
    }

    /// Take every unit matching `predicate` out of the queue.
    ///
    /// The units are returned so they are dropped after the lock is released; dropping a
    /// unit drops whatever its closures captured.
    fn remove_where(&self, predicate: impl FnMut(&Pending<C>) -> bool) -> Vec<Pending<C>> {
        let mut state = self.state.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(predicate);
        state.pending = kept.into();
        removed
    }

    /// Stop handing out work and discard everything still queued.
    pub(crate) fn quit(&self) -> usize {
        let mut state = self.state.lock();
        state.quit = true;
        let discarded = std::mem::take(&mut state.pending);
        drop(state);
        self.available.notify_all();
        for pending in &discarded {
            pending.shared.set_state(TransactionState::Cancelled);
        }
        discarded.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().quit
    }
}

impl<C> QueueControl for TransactionQueue<C> {
    fn cancel(&self, shared: &TransactionShared) -> bool {
        // The worker marks units running under the same lock, so this can't race with it.
        let removed = self.remove_where(|pending| {
            pending.shared.info.id == shared.info.id
                && shared.transition(TransactionState::Queued, TransactionState::Cancelled)
        });
        !removed.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::TransactionId;

    struct NoopJob;

    impl<C> Job<C> for NoopJob {
        fn execute(&mut self, _: &mut WriteContext<'_, C>) -> Result<(), Error> {
            Ok(())
        }
        fn complete(self: Box<Self>, _: &TransactionInfo, _: Option<Error>) {}
        fn reject(self: Box<Self>, _: Error) {}
    }

    fn pending(kind: QueueKind, id: u64, priority: Priority, name: Option<&str>) -> Pending<()> {
        let shared = Arc::new(TransactionShared::new(TransactionInfo {
            id: TransactionId(id),
            name: name.map(Arc::from),
            priority,
        }));
        Pending::new(kind, shared, true, Box::new(NoopJob))
    }

    fn drain_ids(queue: &TransactionQueue<()>) -> Vec<u64> {
        let mut ids = Vec::new();
        while queue.len() != 0 {
            ids.push(queue.next().unwrap().shared.info.id.0);
        }
        ids
    }

    #[test]
    fn fifo_ignores_priority() {
        let queue = TransactionQueue::new();
        for (id, priority) in [(1, Priority::Low), (2, Priority::Ui), (3, Priority::Normal)] {
            assert!(queue
                .push(pending(QueueKind::Fifo, id, priority, None))
                .is_ok());
        }
        assert_eq!(drain_ids(&queue), vec![1, 2, 3]);
    }

    #[test]
    fn priority_then_fifo() {
        let queue = TransactionQueue::new();
        for (id, priority) in [
            (1, Priority::Low),
            (2, Priority::High),
            (3, Priority::Normal),
            (4, Priority::High),
            (5, Priority::Ui),
        ] {
            assert!(queue
                .push(pending(QueueKind::Priority, id, priority, None))
                .is_ok());
        }
        assert_eq!(drain_ids(&queue), vec![5, 2, 4, 3, 1]);
    }

    #[test]
    fn cancel_only_affects_queued_units() {
        let queue = TransactionQueue::new();
        let first = pending(QueueKind::Fifo, 1, Priority::Normal, None);
        let first_shared = Arc::clone(&first.shared);
        let second = pending(QueueKind::Fifo, 2, Priority::Normal, None);
        let second_shared = Arc::clone(&second.shared);
        assert!(queue.push(first).is_ok());
        assert!(queue.push(second).is_ok());

        assert!(queue.cancel(&second_shared));
        assert_eq!(second_shared.state(), TransactionState::Cancelled);
        assert!(!queue.cancel(&second_shared));

        let running = queue.next().unwrap();
        assert_eq!(running.shared.state(), TransactionState::Running);
        assert!(!queue.cancel(&first_shared));
        assert_eq!(first_shared.state(), TransactionState::Running);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn cancel_named_and_quit() {
        let queue = TransactionQueue::new();
        let _ = queue.push(pending(QueueKind::Fifo, 1, Priority::Normal, Some("sync")));
        let _ = queue.push(pending(QueueKind::Fifo, 2, Priority::Normal, Some("other")));
        let _ = queue.push(pending(QueueKind::Fifo, 3, Priority::Normal, Some("sync")));
        assert_eq!(queue.cancel_named("sync"), 2);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.quit(), 1);
        assert!(queue.is_closed());
        assert!(queue.next().is_none());
        assert!(queue
            .push(pending(QueueKind::Fifo, 4, Priority::Normal, None))
            .is_err());
    }
}

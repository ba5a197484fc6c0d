use crate::error::Error;
use crate::notify::{ModelNotifier, Notification};
use crate::table::{TableId, TableSet};
use slotmap::{new_key_type, SlotMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, error, trace};

new_key_type! {
    /// Handle for a notification listener.
    pub struct ListenerHandle;
}

type Listener = Box<dyn Fn(&Notification) + Send + Sync>;

/// Default [`ModelNotifier`] delivering notifications in process.
///
/// All notifications are handed to a background thread which forwards them to every
/// subscribed [`NotificationStream`] and invokes every registered listener. Publishing only
/// enqueues the batch, so a slow subscriber never holds up the writer. A listener which panics
/// is logged and skipped; it does not affect other listeners or later notifications.
///
/// Listeners run on the delivery thread. [`Self::add_listener`] waits for that thread and
/// fails when called from inside a listener; [`Self::remove_listener`] does not wait and can
/// be used there.
pub struct DirectModelNotifier {
    sender: flume::Sender<Command>,
    delivery_thread: ThreadId,
}

impl DirectModelNotifier {
    /// Create a new notifier and start its delivery thread.
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread fails to spawn.
    pub fn new() -> Result<Arc<Self>, Error> {
        let (sender, receiver) = flume::unbounded();
        let thread = std::thread::Builder::new()
            .name("sqlite_invalidation_notifier".into())
            .spawn(move || {
                DirectModelNotifier::background_loop(&receiver);
            })
            .map_err(Error::Thread)?;
        Ok(Arc::new(Self {
            sender,
            delivery_thread: thread.thread().id(),
        }))
    }

    /// Subscribe to every notification published after this call.
    #[must_use]
    pub fn subscribe(&self) -> NotificationStream {
        self.subscribe_filtered(None)
    }

    /// Subscribe to the notifications of `tables` published after this call.
    #[must_use]
    pub fn subscribe_tables(&self, tables: impl IntoIterator<Item = TableId>) -> NotificationStream {
        self.subscribe_filtered(Some(tables.into_iter().collect()))
    }

    fn subscribe_filtered(&self, tables: Option<TableSet>) -> NotificationStream {
        let (sender, receiver) = flume::unbounded();
        if self
            .sender
            .send(Command::Subscribe(Subscriber { sender, tables }))
            .is_err()
        {
            // The stream ends right away, same as if the notifier had been dropped.
            error!("Failed to send subscribe command");
        }
        NotificationStream { receiver }
    }

    /// Register a callback invoked on the delivery thread for every notification.
    ///
    /// Blocks until the delivery thread has registered the listener, so it must not be called
    /// from inside a listener. Doing so returns [`Error::Command`] instead of waiting forever.
    ///
    /// # Errors
    ///
    /// Returns error if called from a listener, if the command could not be sent or the
    /// handle could not be retrieved.
    pub fn add_listener(
        &self,
        listener: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, Error> {
        if std::thread::current().id() == self.delivery_thread {
            error!("Listeners can't be added from inside a notification listener");
            return Err(Error::Command);
        }
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Command::AddListener(Box::new(listener), sender))
            .map_err(|_| Error::Command)?;
        receiver.recv().map_err(|_| {
            error!("Failed to receive handle for new listener");
            Error::Command
        })
    }

    /// Remove a listener. It will not be invoked for notifications published after this call.
    ///
    /// Does not wait for the delivery thread and may be called from inside a listener.
    ///
    /// # Errors
    ///
    /// Returns error if the command could not be sent.
    pub fn remove_listener(&self, handle: ListenerHandle) -> Result<(), Error> {
        self.sender
            .send(Command::RemoveListener(handle))
            .map_err(|_| Error::Command)
    }

    #[tracing::instrument(level= tracing::Level::TRACE, skip_all)]
    fn background_loop(receiver: &flume::Receiver<Command>) {
        let mut listeners: SlotMap<ListenerHandle, Listener> = SlotMap::with_capacity_and_key(4);
        let mut subscribers: Vec<Subscriber> = Vec::new();

        while let Ok(command) = receiver.recv() {
            match command {
                Command::Subscribe(subscriber) => subscribers.push(subscriber),
                Command::AddListener(listener, reply) => {
                    let handle = listeners.insert(listener);
                    if reply.send(handle).is_err() {
                        error!("Failed to send reply back to caller, listener will not be added");
                        listeners.remove(handle);
                    }
                }
                Command::RemoveListener(handle) => {
                    listeners.remove(handle);
                }
                Command::Publish(notifications) => {
                    trace!(count = notifications.len(), "Delivering notifications");
                    for notification in &notifications {
                        for (handle, listener) in &listeners {
                            let result =
                                std::panic::catch_unwind(AssertUnwindSafe(|| listener(notification)));
                            if result.is_err() {
                                error!(?handle, "Notification listener panicked");
                            }
                        }

                        subscribers.retain(|subscriber| subscriber.deliver(notification));
                    }
                }
            }
        }
        debug!("Notifier stopped");
    }
}

impl ModelNotifier for DirectModelNotifier {
    fn notify(&self, notifications: Vec<Notification>) {
        if self.sender.send(Command::Publish(notifications)).is_err() {
            error!("Notifier could not communicate with background thread");
        }
    }
}

struct Subscriber {
    sender: flume::Sender<Notification>,
    tables: Option<TableSet>,
}

impl Subscriber {
    /// Returns false once the subscriber went away.
    fn deliver(&self, notification: &Notification) -> bool {
        if let Some(tables) = &self.tables {
            if !tables.contains(notification.table()) {
                return true;
            }
        }
        self.sender.send(notification.clone()).is_ok()
    }
}

/// Commands send to the background thread.
enum Command {
    Subscribe(Subscriber),
    AddListener(Listener, oneshot::Sender<ListenerHandle>),
    RemoveListener(ListenerHandle),
    Publish(Vec<Notification>),
}

/// Receiving end of a notification subscription.
///
/// Dropping the stream unsubscribes.
pub struct NotificationStream {
    receiver: flume::Receiver<Notification>,
}

impl NotificationStream {
    /// Block until the next notification. Returns `None` once the notifier is gone.
    #[must_use]
    pub fn recv(&self) -> Option<Notification> {
        self.receiver.recv().ok()
    }

    /// Like [`Self::recv`] but gives up after `timeout`.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Next notification if one is already available.
    #[must_use]
    pub fn try_recv(&self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Wait asynchronously for the next notification.
    pub async fn recv_async(&self) -> Option<Notification> {
        self.receiver.recv_async().await.ok()
    }

    /// Convert into an async `Stream` of notifications.
    #[must_use]
    pub fn into_stream(self) -> flume::r#async::RecvStream<'static, Notification> {
        self.receiver.into_stream()
    }
}

impl Iterator for NotificationStream {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notify::Action;
    use parking_lot::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn change(table: u32, action: Action) -> Notification {
        Notification::TableChange {
            table: TableId::new(table),
            action,
        }
    }

    #[test]
    fn every_subscriber_receives_every_notification_in_order() {
        let notifier = DirectModelNotifier::new().unwrap();
        let first = notifier.subscribe();
        let second = notifier.subscribe();

        notifier.notify(vec![change(0, Action::Save), change(0, Action::Delete)]);
        notifier.notify(vec![change(1, Action::Insert)]);

        for stream in [&first, &second] {
            assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(0, Action::Save)));
            assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(0, Action::Delete)));
            assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(1, Action::Insert)));
        }
    }

    #[test]
    fn table_filter() {
        let notifier = DirectModelNotifier::new().unwrap();
        let stream = notifier.subscribe_tables([TableId::new(1)]);

        notifier.notify(vec![change(0, Action::Save), change(1, Action::Update)]);
        assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(1, Action::Update)));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn panicking_listener_does_not_affect_others() {
        let notifier = DirectModelNotifier::new().unwrap();
        notifier
            .add_listener(|_| panic!("listener failure"))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cloned = Arc::clone(&seen);
        notifier
            .add_listener(move |n| seen_cloned.lock().push(n.clone()))
            .unwrap();
        let stream = notifier.subscribe();

        notifier.notify(vec![change(0, Action::Save)]);
        notifier.notify(vec![change(0, Action::Delete)]);

        assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(0, Action::Save)));
        assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(0, Action::Delete)));
        assert_eq!(
            *seen.lock(),
            vec![change(0, Action::Save), change(0, Action::Delete)]
        );
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let notifier = DirectModelNotifier::new().unwrap();
        let dropped = notifier.subscribe();
        let kept = notifier.subscribe();
        drop(dropped);

        notifier.notify(vec![change(2, Action::Change)]);
        assert_eq!(kept.recv_timeout(TIMEOUT), Some(change(2, Action::Change)));
    }

    #[test]
    fn removed_listener_is_not_invoked() {
        let notifier = DirectModelNotifier::new().unwrap();
        let seen = Arc::new(Mutex::new(0));
        let seen_cloned = Arc::clone(&seen);
        let handle = notifier
            .add_listener(move |_| *seen_cloned.lock() += 1)
            .unwrap();
        notifier.remove_listener(handle).unwrap();

        let stream = notifier.subscribe();
        notifier.notify(vec![change(0, Action::Save)]);
        assert!(stream.recv_timeout(TIMEOUT).is_some());
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn listener_registration_from_listener_fails_without_blocking() {
        let notifier = DirectModelNotifier::new().unwrap();
        let (sender, receiver) = flume::unbounded();
        let weak = Arc::downgrade(&notifier);
        notifier
            .add_listener(move |_| {
                if let Some(notifier) = weak.upgrade() {
                    let _ = sender.send(notifier.add_listener(|_| {}).is_err());
                }
            })
            .unwrap();

        notifier.notify(vec![change(0, Action::Save)]);
        assert!(receiver.recv_timeout(TIMEOUT).unwrap());

        // The delivery thread is still running.
        let stream = notifier.subscribe();
        notifier.notify(vec![change(1, Action::Insert)]);
        assert_eq!(stream.recv_timeout(TIMEOUT), Some(change(1, Action::Insert)));
        assert!(receiver.recv_timeout(TIMEOUT).unwrap());
        // Adding from any other thread still works.
        assert!(notifier.add_listener(|_| {}).is_ok());
    }

    #[test]
    fn listener_can_remove_itself() {
        let notifier = DirectModelNotifier::new().unwrap();
        let handle = Arc::new(Mutex::new(None::<ListenerHandle>));
        let calls = Arc::new(Mutex::new(0));
        let weak = Arc::downgrade(&notifier);
        let own_handle = Arc::clone(&handle);
        let own_calls = Arc::clone(&calls);
        *handle.lock() = Some(
            notifier
                .add_listener(move |_| {
                    *own_calls.lock() += 1;
                    if let (Some(notifier), Some(handle)) = (weak.upgrade(), *own_handle.lock()) {
                        notifier.remove_listener(handle).unwrap();
                    }
                })
                .unwrap(),
        );

        let stream = notifier.subscribe();
        notifier.notify(vec![change(0, Action::Save)]);
        assert!(stream.recv_timeout(TIMEOUT).is_some());
        notifier.notify(vec![change(0, Action::Delete)]);
        assert!(stream.recv_timeout(TIMEOUT).is_some());
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn async_subscription() {
        use futures::StreamExt;

        let notifier = DirectModelNotifier::new().unwrap();
        let mut stream = notifier.subscribe().into_stream();
        notifier.notify(vec![change(0, Action::Insert)]);
        assert_eq!(stream.next().await, Some(change(0, Action::Insert)));
    }
}

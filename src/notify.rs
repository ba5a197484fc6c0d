//! Typed change notifications for committed CRUD operations.
//!
//! Every successful `save`, `insert`, `update` or `delete` performed through a
//! [`WriteContext`](crate::model::WriteContext) produces one [`Notification`]. Notifications
//! are buffered while the unit of work runs and handed to the [`NotifyDistributor`] only after
//! it committed. Rolled back work produces no notifications.
use crate::table::TableId;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

mod direct;

pub use direct::{DirectModelNotifier, ListenerHandle, NotificationStream};

/// Kind of modification reported by a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Save,
    Insert,
    Update,
    Delete,
    /// Generic change, used when the concrete operation is unknown.
    Change,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Save => "save",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Change => "change",
        };
        f.write_str(name)
    }
}

/// Typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Column and value identifying the row a [`Notification::ModelChange`] refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedField {
    pub column: String,
    pub value: Value,
}

impl ChangedField {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// One committed modification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A statement touched an unknown number of rows of `table`.
    TableChange { table: TableId, action: Action },
    /// A single row of `table` was modified.
    ModelChange {
        changed_fields: Vec<ChangedField>,
        action: Action,
        table: TableId,
    },
}

impl Notification {
    #[must_use]
    pub fn table(&self) -> TableId {
        match self {
            Notification::TableChange { table, .. } | Notification::ModelChange { table, .. } => {
                *table
            }
        }
    }

    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Notification::TableChange { action, .. } | Notification::ModelChange { action, .. } => {
                *action
            }
        }
    }
}

/// Transport for notifications.
///
/// Implementations must not block the caller: [`ModelNotifier::notify`] is invoked from the
/// transaction worker right after a commit.
pub trait ModelNotifier: Send + Sync {
    /// Deliver the notifications of one committed unit of work, in order.
    fn notify(&self, notifications: Vec<Notification>);
}

/// Routes notifications of one database to the notifier configured for it.
#[derive(Clone)]
pub struct NotifyDistributor {
    notifier: Arc<dyn ModelNotifier>,
}

impl NotifyDistributor {
    pub fn new(notifier: Arc<dyn ModelNotifier>) -> Self {
        Self { notifier }
    }

    /// Hand off a single notification.
    pub fn on_change(&self, notification: Notification) {
        self.notifier.notify(vec![notification]);
    }

    /// Hand off the notifications of one committed unit of work.
    pub fn on_changes(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        tracing::trace!(count = notifications.len(), "Distributing notifications");
        self.notifier.notify(notifications);
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<dyn ModelNotifier> {
        &self.notifier
    }
}

impl std::fmt::Debug for NotifyDistributor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyDistributor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingNotifier {
        batches: Mutex<Vec<Vec<Notification>>>,
    }

    impl ModelNotifier for CollectingNotifier {
        fn notify(&self, notifications: Vec<Notification>) {
            self.batches.lock().push(notifications);
        }
    }

    #[test]
    fn distributor_skips_empty_batches() {
        let notifier = Arc::new(CollectingNotifier::default());
        let distributor = NotifyDistributor::new(notifier.clone());
        distributor.on_changes(Vec::new());
        distributor.on_change(Notification::TableChange {
            table: TableId::new(1),
            action: Action::Delete,
        });
        let batches = notifier.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].table(), TableId::new(1));
        assert_eq!(batches[0][0].action(), Action::Delete);
    }

    #[test]
    fn values_from_rust_types() {
        assert_eq!(Value::from(Some(3_i64)), Value::Integer(3));
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(
            ChangedField::new("name", "bob").value,
            Value::Text("bob".into())
        );
        assert_eq!(Action::Save.to_string(), "save");
    }
}

//! CRUD operations with change notifications.
//!
//! Row mapping is not part of this crate. Adapter code knows how to write a model to its
//! table and exposes that through [`ModelAdapter`]. Units of work call the operations through
//! their [`WriteContext`], which records a [`Notification`] for every operation that modified
//! a row. The recorded notifications are only delivered once the unit committed.
use crate::connection::SqlConnection;
use crate::error::Error;
use crate::notify::{Action, ChangedField, Notification};
use crate::table::TableId;
use std::ops::{Deref, DerefMut};

/// Write primitives for one mapped table.
///
/// Every primitive returns whether a row was modified. Only operations returning `Ok(true)`
/// are reported to the notification subscribers.
pub trait ModelAdapter<C: SqlConnection + ?Sized> {
    type Model;

    /// Table the models of this adapter are stored in.
    fn table(&self) -> TableId;

    /// Insert the model or replace the existing row with the same primary key.
    ///
    /// # Errors
    ///
    /// Returns error if the statement failed.
    fn save(&self, connection: &mut C, model: &mut Self::Model) -> Result<bool, Error>;

    /// # Errors
    ///
    /// Returns error if the statement failed.
    fn insert(&self, connection: &mut C, model: &mut Self::Model) -> Result<bool, Error>;

    /// # Errors
    ///
    /// Returns error if the statement failed.
    fn update(&self, connection: &mut C, model: &mut Self::Model) -> Result<bool, Error>;

    /// # Errors
    ///
    /// Returns error if the statement failed.
    fn delete(&self, connection: &mut C, model: &mut Self::Model) -> Result<bool, Error>;

    /// Columns identifying the row of `model`, usually its primary key.
    fn changed_fields(&self, model: &Self::Model) -> Vec<ChangedField>;
}

/// Access to the connection from inside a unit of work.
///
/// Dereferences to the connection, so plain SQL can be issued directly. Modifications done
/// that way are still picked up by the invalidation triggers but don't produce typed
/// notifications; use [`WriteContext::notify_table_changed`] for those.
pub struct WriteContext<'a, C> {
    connection: &'a mut C,
    notifications: &'a mut Vec<Notification>,
}

impl<'a, C> WriteContext<'a, C> {
    pub(crate) fn new(connection: &'a mut C, notifications: &'a mut Vec<Notification>) -> Self {
        Self {
            connection,
            notifications,
        }
    }

    pub fn connection(&mut self) -> &mut C {
        self.connection
    }

    /// Report a statement which modified an unknown number of rows of `table`.
    pub fn notify_table_changed(&mut self, table: TableId, action: Action) {
        self.notifications
            .push(Notification::TableChange { table, action });
    }

    /// Notifications recorded so far by this unit of work.
    #[must_use]
    pub fn pending_notifications(&self) -> &[Notification] {
        self.notifications
    }
}

impl<C: SqlConnection> WriteContext<'_, C> {
    /// Save `model` through `adapter`.
    ///
    /// # Errors
    ///
    /// Returns the error of the adapter. No notification is recorded in that case.
    pub fn save<A>(&mut self, adapter: &A, model: &mut A::Model) -> Result<bool, Error>
    where
        A: ModelAdapter<C> + ?Sized,
    {
        let changed = adapter.save(self.connection, model)?;
        self.record(adapter, model, changed, Action::Save);
        Ok(changed)
    }

    /// Insert `model` through `adapter`.
    ///
    /// # Errors
    ///
    /// Returns the error of the adapter. No notification is recorded in that case.
    pub fn insert<A>(&mut self, adapter: &A, model: &mut A::Model) -> Result<bool, Error>
    where
        A: ModelAdapter<C> + ?Sized,
    {
        let changed = adapter.insert(self.connection, model)?;
        self.record(adapter, model, changed, Action::Insert);
        Ok(changed)
    }

    /// Update `model` through `adapter`.
    ///
    /// # Errors
    ///
    /// Returns the error of the adapter. No notification is recorded in that case.
    pub fn update<A>(&mut self, adapter: &A, model: &mut A::Model) -> Result<bool, Error>
    where
        A: ModelAdapter<C> + ?Sized,
    {
        let changed = adapter.update(self.connection, model)?;
        self.record(adapter, model, changed, Action::Update);
        Ok(changed)
    }

    /// Delete `model` through `adapter`.
    ///
    /// # Errors
    ///
    /// Returns the error of the adapter. No notification is recorded in that case.
    pub fn delete<A>(&mut self, adapter: &A, model: &mut A::Model) -> Result<bool, Error>
    where
        A: ModelAdapter<C> + ?Sized,
    {
        let changed = adapter.delete(self.connection, model)?;
        self.record(adapter, model, changed, Action::Delete);
        Ok(changed)
    }

    fn record<A>(&mut self, adapter: &A, model: &A::Model, changed: bool, action: Action)
    where
        A: ModelAdapter<C> + ?Sized,
    {
        if !changed {
            return;
        }
        self.notifications.push(Notification::ModelChange {
            changed_fields: adapter.changed_fields(model),
            action,
            table: adapter.table(),
        });
    }
}

impl<C> Deref for WriteContext<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.connection
    }
}

impl<C> DerefMut for WriteContext<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::test::RecordingConnection;
    use crate::connection::SqlExecutor;
    use crate::notify::Value;

    struct User {
        id: i64,
        name: String,
    }

    struct UserAdapter;

    impl ModelAdapter<RecordingConnection> for UserAdapter {
        type Model = User;

        fn table(&self) -> TableId {
            TableId::new(3)
        }

        fn save(&self, c: &mut RecordingConnection, m: &mut User) -> Result<bool, Error> {
            c.sql_execute(&format!("INSERT OR REPLACE INTO users VALUES ({}, '{}')", m.id, m.name))
                .map_err(Error::sql)?;
            Ok(true)
        }

        fn insert(&self, c: &mut RecordingConnection, m: &mut User) -> Result<bool, Error> {
            c.sql_execute(&format!("INSERT INTO users VALUES ({}, '{}')", m.id, m.name))
                .map_err(Error::sql)?;
            Ok(true)
        }

        fn update(&self, _: &mut RecordingConnection, _: &mut User) -> Result<bool, Error> {
            // Row does not exist.
            Ok(false)
        }

        fn delete(&self, c: &mut RecordingConnection, m: &mut User) -> Result<bool, Error> {
            c.sql_execute(&format!("DELETE FROM users WHERE id = {}", m.id))
                .map_err(Error::sql)?;
            Ok(true)
        }

        fn changed_fields(&self, m: &User) -> Vec<ChangedField> {
            vec![ChangedField::new("id", m.id)]
        }
    }

    #[test]
    fn operations_record_notifications_in_order() {
        let mut connection = RecordingConnection::default();
        let mut notifications = Vec::new();
        let mut ctx = WriteContext::new(&mut connection, &mut notifications);
        let mut user = User {
            id: 7,
            name: "ada".into(),
        };

        assert!(ctx.save(&UserAdapter, &mut user).unwrap());
        assert!(!ctx.update(&UserAdapter, &mut user).unwrap());
        assert!(ctx.delete(&UserAdapter, &mut user).unwrap());
        ctx.notify_table_changed(TableId::new(3), Action::Change);
        assert_eq!(ctx.pending_notifications().len(), 3);

        let actions = notifications.iter().map(Notification::action).collect::<Vec<_>>();
        assert_eq!(actions, vec![Action::Save, Action::Delete, Action::Change]);
        assert_eq!(
            notifications[0],
            Notification::ModelChange {
                changed_fields: vec![ChangedField {
                    column: "id".into(),
                    value: Value::Integer(7),
                }],
                action: Action::Save,
                table: TableId::new(3),
            }
        );
    }

    #[test]
    fn failed_operation_is_not_recorded() {
        let mut connection = RecordingConnection::default();
        *connection.fail_on.lock() = Some("INSERT INTO users".into());
        let mut notifications = Vec::new();
        let mut ctx = WriteContext::new(&mut connection, &mut notifications);
        let mut user = User {
            id: 1,
            name: "bob".into(),
        };

        assert!(matches!(
            ctx.insert(&UserAdapter, &mut user),
            Err(Error::Sql(_))
        ));
        assert!(ctx.pending_notifications().is_empty());
    }
}

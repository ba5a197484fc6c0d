//! Contract consumed from the sqlite driver.
//!
//! Everything in this crate talks to the database through [`SqlConnection`]. The connection is
//! owned by the [`TransactionDispatcher`](crate::dispatcher::TransactionDispatcher) worker and
//! is never touched from any other thread.
use std::error::Error;

#[cfg(feature = "rusqlite")]
pub mod rusqlite;

/// Defines an implementation capable of executing SQL statement on a sqlite connection.
///
/// This is required so we can set up the temporary triggers and tables required to
/// track changes.
pub trait SqlExecutor {
    type Error: Error + Send + Sync + 'static;

    /// This method will execute a query which returns 0 or N rows with one column of type `usize`.
    ///
    /// # Errors
    ///
    /// Should return error if the query failed.
    fn sql_query_values(&mut self, query: &str) -> Result<Vec<usize>, Self::Error>;

    /// Execute an sql statement which does not return any rows.
    ///
    /// # Errors
    ///
    /// Should return error if the query failed.
    fn sql_execute(&mut self, query: &str) -> Result<(), Self::Error>;

    /// Whether a transaction is currently open on this connection.
    fn sql_in_write_transaction(&self) -> bool;
}

/// Defines a sqlite connection with explicit transaction control.
///
/// The default implementations issue plain `BEGIN IMMEDIATE`, `COMMIT` and `ROLLBACK`
/// statements, which is what every sqlite driver understands.
#[allow(clippy::module_name_repetitions)]
pub trait SqlConnection: SqlExecutor {
    /// Begin a new write transaction.
    ///
    /// # Errors
    ///
    /// Should return an error if the transaction can't be started.
    fn sql_begin_transaction(&mut self) -> Result<(), Self::Error> {
        self.sql_execute("BEGIN IMMEDIATE")
    }

    /// Commit the current transaction.
    ///
    /// # Errors
    ///
    /// Should return an error if a transaction can't be committed.
    fn sql_commit_transaction(&mut self) -> Result<(), Self::Error> {
        self.sql_execute("COMMIT")
    }

    /// Roll back the current transaction.
    ///
    /// # Errors
    ///
    /// Should return an error if the rollback failed.
    fn sql_rollback_transaction(&mut self) -> Result<(), Self::Error> {
        self.sql_execute("ROLLBACK")
    }
}

/// Run `f` inside a transaction on `connection`, rolling back if it fails.
///
/// # Errors
///
/// Returns the error of `f` or of the transaction statements.
pub(crate) fn with_transaction<C, R>(
    connection: &mut C,
    f: impl FnOnce(&mut C) -> Result<R, C::Error>,
) -> Result<R, C::Error>
where
    C: SqlConnection + ?Sized,
{
    connection.sql_begin_transaction()?;
    match f(connection) {
        Ok(value) => {
            connection.sql_commit_transaction()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = connection.sql_rollback_transaction() {
                tracing::error!(error = %rollback_err, "Failed to roll back transaction");
            }
            Err(e)
        }
    }
}

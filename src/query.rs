//! Contract for queries which can be observed with [`Database::observe_query`].
//!
//! [`Database::observe_query`]: crate::database::Database::observe_query
use crate::error::Error;
use crate::table::TableId;

/// A read query together with the tables it reads from.
///
/// `tables` must include every table the query touches, joined tables included, otherwise
/// modifications of the missing tables won't trigger a new result.
pub trait ExecutableQuery<C>: Send + 'static {
    type Output: Send + 'static;

    fn tables(&self) -> Vec<TableId>;

    /// Run the query on `connection`.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    fn execute(&mut self, connection: &mut C) -> Result<Self::Output, Error>;
}

/// [`ExecutableQuery`] backed by a closure.
pub struct FnQuery<F> {
    tables: Vec<TableId>,
    query: F,
}

impl<F> FnQuery<F> {
    pub fn new(tables: impl IntoIterator<Item = TableId>, query: F) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            query,
        }
    }
}

impl<C, T, F> ExecutableQuery<C> for FnQuery<F>
where
    T: Send + 'static,
    F: FnMut(&mut C) -> Result<T, Error> + Send + 'static,
{
    type Output = T;

    fn tables(&self) -> Vec<TableId> {
        self.tables.clone()
    }

    fn execute(&mut self, connection: &mut C) -> Result<T, Error> {
        (self.query)(connection)
    }
}

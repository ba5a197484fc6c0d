//! Sql trait implementations for `rusqlite`.
//!
//! Requires the `rusqlite` feature to be enabled.
use crate::connection::{SqlConnection, SqlExecutor};
use rusqlite::Connection;

impl SqlExecutor for Connection {
    type Error = rusqlite::Error;

    fn sql_query_values(&mut self, query: &str) -> Result<Vec<usize>, Self::Error> {
        let mut stmt = self.prepare_cached(query)?;
        let rows = stmt.query_map((), |r| r.get(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    fn sql_execute(&mut self, query: &str) -> Result<(), Self::Error> {
        // Pragmas and DDL may or may not return rows, execute_batch accepts both.
        self.execute_batch(query)
    }

    fn sql_in_write_transaction(&self) -> bool {
        !self.is_autocommit()
    }
}

impl SqlConnection for Connection {}

//! This crate provides invalidation tracking and serialized writes for a sqlite database, the
//! building blocks of observable queries similar to Room (Android) and Core Data (iOS).
//!
//! The crate is agnostic over the implementation of the sqlite connection. An implementation
//! for `rusqlite` is provided and enabled by default.
//!
//! # Basic example
//!
//! ```rust
//! use sqlite_invalidation::config::DatabaseConfig;
//! use sqlite_invalidation::database::Database;
//! use sqlite_invalidation::observer::FnObserver;
//! use sqlite_invalidation::table::TableSchema;
//!
//! let connection = rusqlite::Connection::open_in_memory().unwrap();
//! let db = Database::open(connection, TableSchema::new(["foo"]), DatabaseConfig::default()).unwrap();
//! let foo = db.table_id("foo").unwrap();
//!
//! // Create table
//! db.execute(|ctx| {
//!     ctx.execute("CREATE TABLE foo (id INTEGER PRIMARY KEY AUTOINCREMENT, value INTEGER)", ())?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Register observer, the triggers for 'foo' are installed before the next unit of work.
//! let (sender, receiver) = std::sync::mpsc::channel();
//! let observer = FnObserver::new([foo], move |tables| {
//!     let _ = sender.send(tables.clone());
//! });
//! db.add_observer(Box::new(observer)).unwrap();
//!
//! // Modify table. The shadow table is checked right after the commit.
//! db.execute(|ctx| {
//!     ctx.execute("INSERT INTO foo (value) VALUES (10)", ())?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! // The observer is invoked from a background thread.
//! let tables = receiver.recv().unwrap();
//! assert!(tables.contains(foo));
//! ```
//!
//! # How it works
//!
//! Every table is identified by the [`table::TableId`] the [`table::TableSchema`] assigns to it.
//! The crate creates a temporary shadow table on the connection. For every table that is
//! watched by at least one [`observer::Observer`], temporary triggers for INSERT, UPDATE and
//! DELETE queries flag the table as invalidated. The triggers are created and removed by
//! [`observer::TableObserver::sync_triggers`] as observers come and go.
//!
//! [`observer::TableObserver::check_for_table_updates`] reads and resets the flags and a
//! background thread invokes [`observer::Observer::on_tables_invalidated`] for each observer
//! which is watching one of the modified tables.
//!
//! # Transactions
//!
//! The connection is owned by a [`dispatcher::TransactionDispatcher`] worker thread. Units of
//! work are queued with [`database::Database::transaction`] and run one at a time, in FIFO or
//! priority order. A queued unit can be cancelled until it starts. The worker syncs the
//! triggers before each unit and checks the shadow table after it, so observers learn about
//! a commit right after it happened.
//!
//! # Change Granularity
//!
//! An [`observer::Observer`] is only told which of its tables were modified. Units of work
//! which write through [`model::WriteContext`] additionally produce one
//! [`notify::Notification`] per modified row, including the kind of operation. Notifications
//! are delivered after the commit and never for work that was rolled back.
//!
//! # Single Connection
//!
//! The triggers are temporary and only see modifications made through the connection the
//! [`database::Database`] owns. Modifications from other connections or processes are not
//! observed.
//!

pub mod config;
pub mod connection;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod notify;
pub mod observer;
pub mod query;
pub mod reactive;
pub mod table;

pub use error::{Error, Result};

use sqlite_invalidation::config::DatabaseConfig;
use sqlite_invalidation::database::Database;
use sqlite_invalidation::notify::{Action, ChangedField, Notification};
use sqlite_invalidation::observer::{Observer, FnObserver};
use sqlite_invalidation::query::FnQuery;
use sqlite_invalidation::table::{TableId, TableSchema, TableSet};
use sqlite_invalidation::Error;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tempdir::TempDir;

// Opens a database with two observers and a live query on `foo`, then writes from two threads.
// It should print something like:
// ```
// Live count: 0
// Notification: insert on table 0
// Updated tables: [observer-1] [TableId(0)]
// Updated tables: [observer-2] [TableId(0)]
// Live count: 1
// ...
// ```
fn main() {
    let tmp_dir = TempDir::new("sqlite-invalidation-rusqlite").unwrap();
    let connection = rusqlite::Connection::open(tmp_dir.path().join("db.sqlite3")).unwrap();
    let db = Database::open(
        connection,
        TableSchema::new(["foo", "bar"]),
        DatabaseConfig::default().with_worker_name("demo_writer"),
    )
    .unwrap();
    let foo = db.table_id("foo").unwrap();

    db.execute(|ctx| {
        ctx.execute_batch(
            "CREATE TABLE foo (id INTEGER PRIMARY KEY AUTOINCREMENT, value INTEGER);
             CREATE TABLE bar (id INTEGER PRIMARY KEY AUTOINCREMENT, value INTEGER);",
        )?;
        Ok(())
    })
    .unwrap();

    let (sender, receiver) = std::sync::mpsc::channel();
    let observer1 = NamedObserver::new("observer-1", foo, sender.clone());
    let observer2 = NamedObserver::new("observer-2", foo, sender);
    let observer_handle_1 = db.add_observer(Box::new(observer1)).unwrap();
    let observer_handle_2 = db.add_observer(Box::new(observer2)).unwrap();

    let notifications = db.subscribe_notifications();
    let live = db
        .observe_query(FnQuery::new(
            [foo],
            |c: &mut rusqlite::Connection| -> Result<i64, Error> {
                Ok(c.query_row("SELECT COUNT(*) FROM foo", (), |r| r.get(0))?)
            },
        ))
        .unwrap();

    std::thread::scope(|scope| {
        for value in [400, 500] {
            let db = &db;
            scope.spawn(move || {
                db.execute(move |ctx| {
                    ctx.execute("INSERT INTO foo (value) VALUES (?1)", [value])?;
                    let id = ctx.last_insert_rowid();
                    ctx.notify_table_changed(foo, Action::Insert);
                    Ok(id)
                })
                .unwrap();
            });
        }
    });

    // Unrelated table, the observers stay quiet.
    db.execute(|ctx| {
        ctx.execute("INSERT INTO bar (value) VALUES (1)", ())?;
        Ok(())
    })
    .unwrap();

    while let Some(Ok(count)) = live.recv_timeout(Duration::from_millis(250)) {
        println!("Live count: {count}");
    }

    while let Some(notification) = notifications.recv_timeout(Duration::from_millis(100)) {
        match notification {
            Notification::TableChange { table, action } => {
                println!("Notification: {action} on table {table}");
            }
            Notification::ModelChange {
                changed_fields,
                action,
                table,
            } => print_model_change(table, action, &changed_fields),
        }
    }

    db.remove_observer(observer_handle_1).unwrap();
    db.remove_observer(observer_handle_2).unwrap();

    while let Ok((observer_name, updated_tables)) = receiver.try_recv() {
        println!("Updated tables: [{observer_name}] {updated_tables:?}");
    }

    // Closures work too.
    let closure_observer = FnObserver::new([foo], |tables: &TableSet| {
        println!("Closure observer: {:?}", tables.iter().collect::<Vec<_>>());
    });
    db.add_observer(Box::new(closure_observer)).unwrap();
    db.execute(|ctx| {
        ctx.execute("DELETE FROM foo", ())?;
        Ok(())
    })
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    db.quit();
}

fn print_model_change(table: TableId, action: Action, changed_fields: &[ChangedField]) {
    println!("Notification: {action} on table {table} {changed_fields:?}");
}

struct NamedObserver {
    name: String,
    table: TableId,
    sender: Sender<(String, Vec<TableId>)>,
}

impl NamedObserver {
    pub fn new(name: impl Into<String>, table: TableId, sender: Sender<(String, Vec<TableId>)>) -> Self {
        Self {
            name: name.into(),
            table,
            sender,
        }
    }
}

impl Observer for NamedObserver {
    fn tables(&self) -> Vec<TableId> {
        vec![self.table]
    }

    fn on_tables_invalidated(&self, tables: &TableSet) {
        self.sender
            .send((self.name.clone(), tables.iter().collect()))
            .unwrap();
    }
}

//! Statements used to maintain the shadow table and the tracking triggers.
use crate::connection::SqlExecutor;
use crate::table::TableId;
use std::fmt::Write;

pub(crate) const SHADOW_TABLE_NAME: &str = "rsqlite_invalidation_tracker";

/// Mutation methods for which a trigger is installed on every observed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMethod {
    Insert,
    Update,
    Delete,
}

impl TriggerMethod {
    pub const ALL: [TriggerMethod; 3] = [Self::Insert, Self::Update, Self::Delete];

    /// SQL keyword of the method.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Deterministic name of the trigger for `table` and `method`.
#[must_use]
pub fn trigger_name(table: &str, method: TriggerMethod) -> String {
    format!("{SHADOW_TABLE_NAME}_trigger_{table}_{}", method.suffix())
}

#[inline]
pub(crate) fn create_shadow_table_query() -> String {
    format!("CREATE TEMP TABLE IF NOT EXISTS `{SHADOW_TABLE_NAME}` (table_id INTEGER PRIMARY KEY, invalidated INTEGER NOT NULL DEFAULT 0)")
}

#[inline]
pub(crate) fn empty_shadow_table_query() -> String {
    format!("DELETE FROM `{SHADOW_TABLE_NAME}`")
}

#[inline]
pub(crate) fn drop_shadow_table_query() -> String {
    format!("DROP TABLE IF EXISTS `{SHADOW_TABLE_NAME}`")
}

#[inline]
pub(crate) fn select_invalidated_tables_query() -> String {
    format!("SELECT table_id FROM `{SHADOW_TABLE_NAME}` WHERE invalidated=1")
}

#[inline]
pub(crate) fn reset_invalidated_tables_query() -> String {
    format!("UPDATE `{SHADOW_TABLE_NAME}` SET invalidated=0 WHERE invalidated=1")
}

#[inline]
fn create_trigger_query(
    writer: &mut impl Write,
    table_name: &str,
    method: TriggerMethod,
    table_id: TableId,
) -> std::fmt::Result {
    write!(
        writer,
        r"CREATE TEMP TRIGGER IF NOT EXISTS `{}` AFTER {} ON `{table_name}`
BEGIN
    UPDATE `{SHADOW_TABLE_NAME}` SET invalidated=1 WHERE table_id={table_id} AND invalidated=0;
END",
        trigger_name(table_name, method),
        method.keyword(),
    )
}

#[inline]
fn insert_shadow_row_query(writer: &mut impl Write, table_id: TableId) -> std::fmt::Result {
    write!(
        writer,
        "INSERT OR IGNORE INTO `{SHADOW_TABLE_NAME}` (table_id, invalidated) VALUES ({table_id}, 0)"
    )
}

#[inline]
fn drop_trigger_query(
    writer: &mut impl Write,
    table_name: &str,
    method: TriggerMethod,
) -> std::fmt::Result {
    write!(
        writer,
        "DROP TRIGGER IF EXISTS `{}`",
        trigger_name(table_name, method)
    )
}

#[inline]
fn delete_shadow_row_query(writer: &mut impl Write, table_id: TableId) -> std::fmt::Result {
    write!(
        writer,
        "DELETE FROM `{SHADOW_TABLE_NAME}` WHERE table_id={table_id}"
    )
}

/// Statements which start tracking `table`: the shadow row first, then one trigger per method.
pub(crate) fn create_triggers_statements(table: &str, id: TableId) -> Vec<String> {
    let mut statements = Vec::with_capacity(TriggerMethod::ALL.len() + 1);
    let mut query = String::with_capacity(128);
    // Writing into a String can't fail.
    let _ = insert_shadow_row_query(&mut query, id);
    statements.push(std::mem::take(&mut query));
    for method in TriggerMethod::ALL {
        let _ = create_trigger_query(&mut query, table, method, id);
        statements.push(std::mem::take(&mut query));
    }
    statements
}

/// Statements which stop tracking `table`.
pub(crate) fn drop_triggers_statements(table: &str, id: TableId) -> Vec<String> {
    let mut statements = Vec::with_capacity(TriggerMethod::ALL.len() + 1);
    let mut query = String::with_capacity(64);
    for method in TriggerMethod::ALL {
        let _ = drop_trigger_query(&mut query, table, method);
        statements.push(std::mem::take(&mut query));
    }
    let _ = delete_shadow_row_query(&mut query, id);
    statements.push(query);
    statements
}

/// Create tracking triggers for `table` with `id`.
///
/// # Errors
///
/// Return error if the query failed.
pub(crate) fn create_triggers<Ex: SqlExecutor + ?Sized>(
    executor: &mut Ex,
    table: &str,
    id: TableId,
) -> Result<(), Ex::Error> {
    for statement in create_triggers_statements(table, id) {
        executor.sql_execute(&statement)?;
    }
    Ok(())
}

/// Remove tracking triggers for `table` with `id`.
///
/// # Errors
///
/// Return error if the query failed.
pub(crate) fn drop_triggers<Ex: SqlExecutor + ?Sized>(
    executor: &mut Ex,
    table: &str,
    id: TableId,
) -> Result<(), Ex::Error> {
    for statement in drop_triggers_statements(table, id) {
        executor.sql_execute(&statement)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_avoid_reserved_prefix() {
        // sqlite refuses to create objects whose name starts with `sqlite_`.
        assert!(!SHADOW_TABLE_NAME.to_ascii_lowercase().starts_with("sqlite_"));
        for method in TriggerMethod::ALL {
            assert!(!trigger_name("users", method)
                .to_ascii_lowercase()
                .starts_with("sqlite_"));
        }
    }

    #[test]
    fn trigger_names_are_deterministic() {
        assert_eq!(
            trigger_name("users", TriggerMethod::Insert),
            "rsqlite_invalidation_tracker_trigger_users_insert"
        );
        assert_eq!(
            trigger_name("users", TriggerMethod::Delete),
            trigger_name("users", TriggerMethod::Delete)
        );
        assert_ne!(
            trigger_name("users", TriggerMethod::Update),
            trigger_name("orders", TriggerMethod::Update)
        );
    }

    #[test]
    fn create_statements_insert_row_before_triggers() {
        let statements = create_triggers_statements("users", TableId::new(3));
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("INSERT OR IGNORE"));
        assert!(statements[0].contains("VALUES (3, 0)"));
        for (statement, method) in statements[1..].iter().zip(TriggerMethod::ALL) {
            assert!(statement.starts_with("CREATE TEMP TRIGGER IF NOT EXISTS"));
            assert!(statement.contains(&format!("AFTER {} ON `users`", method.keyword())));
            assert!(statement.contains("WHERE table_id=3 AND invalidated=0"));
        }
    }

    #[test]
    fn drop_statements_are_idempotent() {
        let statements = drop_triggers_statements("users", TableId::new(3));
        assert_eq!(statements.len(), 4);
        for statement in &statements[..3] {
            assert!(statement.starts_with("DROP TRIGGER IF EXISTS"));
        }
        assert!(statements[3].ends_with("WHERE table_id=3"));
    }
}

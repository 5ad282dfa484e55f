//! Which tables and views the query builder may read from.

use rusqlite::{params, Connection};

use super::QueryError;

pub const QUERYABLE_TABLES: &[&str] = &[
    "referenda",
    "child_bounties",
    "bounties",
    "categories",
    "subtreasury",
    "treasury_netflows",
];

pub const QUERYABLE_VIEWS: &[&str] = &["all_spending"];

/// Names of user-created tables, read from the metadata store on every call:
/// custom tables come and go at runtime.
///
/// # Errors
/// Returns `QueryError::Database` if the metadata table cannot be read.
pub fn custom_table_names(conn: &Connection) -> Result<Vec<String>, QueryError> {
    let mut stmt = conn.prepare("SELECT table_name FROM custom_table_metadata ORDER BY table_name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// # Errors
/// Returns `QueryError::Database` if the metadata table cannot be read.
pub fn custom_table_exists(conn: &Connection, name: &str) -> Result<bool, QueryError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM custom_table_metadata WHERE table_name = ?1)",
        params![name],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(exists)
}

/// Every source the query builder accepts: fixed tables, fixed views, then
/// registered custom tables.
///
/// # Errors
/// Returns `QueryError::Database` if the metadata table cannot be read.
pub fn allowed_tables(conn: &Connection) -> Result<Vec<String>, QueryError> {
    let mut tables: Vec<String> = QUERYABLE_TABLES
        .iter()
        .chain(QUERYABLE_VIEWS)
        .map(ToString::to_string)
        .collect();
    for name in custom_table_names(conn)? {
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    Ok(tables)
}

/// # Errors
/// Returns `QueryError::Database` if the metadata table cannot be read.
pub fn is_source_allowed(conn: &Connection, name: &str) -> Result<bool, QueryError> {
    if QUERYABLE_TABLES.contains(&name) || QUERYABLE_VIEWS.contains(&name) {
        return Ok(true);
    }
    custom_table_exists(conn, name)
}

//! Column metadata lookups against the SQLite catalog.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use super::QueryError;

const MAX_TABLE_NAME_LEN: usize = 128;

/// Column name to declared SQL type for one table.
pub type ColumnTypeMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    pub nullable: bool,
}

/// Process-wide memo of declared column types, keyed by raw table name.
///
/// Entries are never evicted on their own: a custom table whose schema changes
/// after its first query keeps serving the old types until `invalidate` or
/// `clear` is called.
#[derive(Debug, Default)]
pub struct ColumnTypeCache {
    tables: RwLock<HashMap<String, Arc<ColumnTypeMap>>>,
}

impl ColumnTypeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<Arc<ColumnTypeMap>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    /// Store `types` unless another request populated the entry first.
    pub fn insert(&self, table: &str, types: ColumnTypeMap) -> Arc<ColumnTypeMap> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(types))
            .clone()
    }

    pub fn invalidate(&self, table: &str) -> bool {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
            .is_some()
    }

    pub fn clear(&self) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Second line of defence for catalog calls: `PRAGMA table_info` cannot take a
/// bound parameter, so the name is checked before it is formatted in.
#[must_use]
pub fn is_valid_table_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    first_ok && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ' ')
}

pub struct SchemaCatalog<'a> {
    conn: &'a Connection,
    cache: &'a ColumnTypeCache,
}

impl<'a> SchemaCatalog<'a> {
    #[must_use]
    pub const fn new(conn: &'a Connection, cache: &'a ColumnTypeCache) -> Self {
        Self { conn, cache }
    }

    /// Full column metadata for a table or view, in declaration order.
    ///
    /// # Errors
    /// Returns `QueryError::InvalidIdentifier` for a name that fails the
    /// catalog pattern, or `QueryError::Database` if the pragma fails.
    pub fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, QueryError> {
        if !is_valid_table_name(table) {
            return Err(QueryError::InvalidIdentifier(table.to_string()));
        }

        let mut pragma = self.conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let columns = pragma
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let col_type: String = row.get(2)?;
                let not_null: i64 = row.get(3)?;
                Ok(ColumnInfo {
                    name,
                    col_type,
                    nullable: not_null == 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Column names of a table, always read from the live catalog.
    ///
    /// # Errors
    /// See [`SchemaCatalog::describe`].
    pub fn get_columns(&self, table: &str) -> Result<Vec<String>, QueryError> {
        Ok(self.describe(table)?.into_iter().map(|c| c.name).collect())
    }

    /// Declared types for a table, populated once and then served from cache.
    ///
    /// # Errors
    /// See [`SchemaCatalog::describe`].
    pub fn column_types(&self, table: &str) -> Result<Arc<ColumnTypeMap>, QueryError> {
        if let Some(types) = self.cache.get(table) {
            return Ok(types);
        }

        debug!(table, "loading column types");
        let types = self
            .describe(table)?
            .into_iter()
            .map(|c| (c.name, c.col_type))
            .collect();
        Ok(self.cache.insert(table, types))
    }

    /// Declared type of `column_ref` as seen from `source_table`.
    ///
    /// A literal column of the source wins; otherwise a `qualifier.column`
    /// reference is resolved through `aliases` (join alias to table name) or
    /// used as a table name directly. Unknown columns yield `None`.
    ///
    /// # Errors
    /// Propagates catalog failures.
    pub fn get_column_type(
        &self,
        column_ref: &str,
        source_table: &str,
        aliases: &[(String, String)],
    ) -> Result<Option<String>, QueryError> {
        let source_types = self.column_types(source_table)?;
        if let Some(col_type) = source_types.get(column_ref) {
            return Ok(Some(col_type.clone()));
        }

        let Some((qualifier, column)) = column_ref.rsplit_once('.') else {
            return Ok(None);
        };

        let table = aliases
            .iter()
            .find(|(alias, _)| alias == qualifier)
            .map_or(qualifier, |(_, table)| table.as_str());
        if !is_valid_table_name(table) {
            return Ok(None);
        }

        let types = self.column_types(table)?;
        Ok(types.get(column).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE referenda (id INTEGER PRIMARY KEY, title TEXT NOT NULL, \"tally.ayes\" REAL, category_id INTEGER);
             CREATE TABLE categories (id INTEGER PRIMARY KEY, category TEXT);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn table_name_pattern() {
        assert!(is_valid_table_name("referenda"));
        assert!(is_valid_table_name("_custom table 1"));
        assert!(!is_valid_table_name("1referenda"));
        assert!(!is_valid_table_name("referenda\"); DROP TABLE x; --"));
        assert!(!is_valid_table_name(&"a".repeat(129)));
        assert!(!is_valid_table_name(""));
    }

    #[test]
    fn describe_reports_types_and_nullability() {
        let conn = conn();
        let cache = ColumnTypeCache::new();
        let catalog = SchemaCatalog::new(&conn, &cache);

        let columns = catalog.describe("referenda").unwrap();
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[1].name, "title");
        assert_eq!(columns[1].col_type, "TEXT");
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].name, "tally.ayes");
    }

    #[test]
    fn describe_rejects_unsafe_names() {
        let conn = conn();
        let cache = ColumnTypeCache::new();
        let catalog = SchemaCatalog::new(&conn, &cache);
        assert!(matches!(
            catalog.describe("referenda\")--"),
            Err(QueryError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn column_types_are_cached_until_invalidated() {
        let conn = conn();
        let cache = ColumnTypeCache::new();
        let catalog = SchemaCatalog::new(&conn, &cache);

        assert!(cache.is_empty());
        let types = catalog.column_types("referenda").unwrap();
        assert_eq!(types.get("id").map(String::as_str), Some("INTEGER"));
        assert!(cache.contains("referenda"));

        conn.execute_batch("ALTER TABLE referenda ADD COLUMN notes TEXT").unwrap();
        assert!(catalog.column_types("referenda").unwrap().get("notes").is_none());
        assert!(catalog.get_columns("referenda").unwrap().contains(&"notes".to_string()));

        assert!(cache.invalidate("referenda"));
        assert!(catalog.column_types("referenda").unwrap().get("notes").is_some());

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn column_type_resolves_literal_dotted_and_aliased_columns() {
        let conn = conn();
        let cache = ColumnTypeCache::new();
        let catalog = SchemaCatalog::new(&conn, &cache);
        let aliases = vec![("c".to_string(), "categories".to_string())];

        assert_eq!(
            catalog.get_column_type("tally.ayes", "referenda", &aliases).unwrap().as_deref(),
            Some("REAL")
        );
        assert_eq!(
            catalog.get_column_type("c.category", "referenda", &aliases).unwrap().as_deref(),
            Some("TEXT")
        );
        assert_eq!(
            catalog.get_column_type("categories.id", "referenda", &[]).unwrap().as_deref(),
            Some("INTEGER")
        );
        assert_eq!(catalog.get_column_type("missing", "referenda", &aliases).unwrap(), None);
    }
}

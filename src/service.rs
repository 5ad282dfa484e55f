//! Runs compiled queries and shapes their results for the HTTP layer.

use std::collections::BTreeMap;
use std::fmt::Write;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::query_builder::catalog::{ColumnInfo, ColumnTypeCache};
use crate::query_builder::filter::NumericBinding;
use crate::query_builder::{registry, BuiltQuery, QueryCompiler, QueryError};
use crate::query_spec::QuerySpec;

pub type RowData = BTreeMap<String, JsonValue>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub data: Vec<RowData>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
    pub sql: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRequest {
    #[serde(flatten)]
    pub query: QuerySpec,
    #[serde(default)]
    pub facet_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetValue {
    pub value: JsonValue,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct FacetResponse {
    pub facets: BTreeMap<String, Vec<FacetValue>>,
}

#[derive(Debug, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

pub struct QueryService<'a> {
    conn: &'a Connection,
    compiler: QueryCompiler<'a>,
}

impl<'a> QueryService<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection, cache: &'a ColumnTypeCache, numeric_binding: NumericBinding) -> Self {
        Self {
            conn,
            compiler: QueryCompiler::new(conn, cache).with_numeric_binding(numeric_binding),
        }
    }

    /// Compile and run a query; paginated requests also get a total count.
    ///
    /// # Errors
    /// Returns a client `QueryError` for rejected requests, or
    /// `QueryError::Database` if SQLite fails to execute the compiled SQL.
    pub fn run(&self, spec: &QuerySpec) -> Result<QueryResult, QueryError> {
        let BuiltQuery { sql, params } = self.compiler.build_query(spec)?;

        let total_count = if spec.is_paginated() {
            let count = self.compiler.build_count_query(spec)?;
            Some(self.conn.query_row(
                &count.sql,
                rusqlite::params_from_iter(count.params.iter()),
                |row| row.get::<_, i64>(0),
            )?)
        } else {
            None
        };

        let data = run_query(self.conn, &sql, &params)?;
        debug!(rows = data.len(), ?total_count, "query executed");

        Ok(QueryResult {
            row_count: data.len(),
            data,
            total_count,
            sql,
        })
    }

    /// Distinct values with counts for each requested column.
    ///
    /// # Errors
    /// See [`QueryCompiler::build_facet_query`].
    pub fn facets(&self, request: &FacetRequest) -> Result<FacetResponse, QueryError> {
        let mut facets = BTreeMap::new();
        for column in &request.facet_columns {
            let built = self.compiler.build_facet_query(&request.query, column)?;
            let mut stmt = self.conn.prepare(&built.sql)?;
            let values = stmt
                .query_map(rusqlite::params_from_iter(built.params.iter()), |row| {
                    Ok(FacetValue {
                        value: sqlite_value_to_json(row.get(0)?),
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            facets.insert(column.clone(), values);
        }
        Ok(FacetResponse { facets })
    }

    /// Column metadata for every source the query builder accepts. A
    /// registered custom table whose name cannot be described is left out of
    /// the listing rather than failing it.
    ///
    /// # Errors
    /// Returns `QueryError::Database` if the catalog cannot be read.
    pub fn schema(&self) -> Result<Vec<TableSchema>, QueryError> {
        let mut tables = Vec::new();
        for name in registry::allowed_tables(self.conn)? {
            match self.compiler.catalog().describe(&name) {
                Ok(columns) => tables.push(TableSchema { name, columns }),
                Err(err) if err.is_client_error() => {
                    warn!(table = %name, error = %err, "skipping undescribable source");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(tables)
    }

    /// Column metadata for one registered custom table.
    ///
    /// # Errors
    /// Returns `QueryError::UnknownCustomTable` if `name` is not registered.
    pub fn custom_table_schema(&self, name: &str) -> Result<TableSchema, QueryError> {
        if !registry::custom_table_exists(self.conn, name)? {
            return Err(QueryError::UnknownCustomTable(name.to_string()));
        }
        Ok(TableSchema {
            name: name.to_string(),
            columns: self.compiler.catalog().describe(name)?,
        })
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<RowData>, QueryError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let rows_iter = stmt.query_map(rusqlite::params_from_iter(params.iter()), move |row| {
        let mut data = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            let value: Value = row.get(i)?;
            data.insert(name.clone(), sqlite_value_to_json(value));
        }
        Ok(data)
    })?;

    let mut rows = Vec::new();
    for row in rows_iter {
        rows.push(row?);
    }

    Ok(rows)
}

#[must_use]
pub fn sqlite_value_to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(v) => JsonValue::Number(v.into()),
        Value::Real(v) => serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number),
        Value::Text(v) => JsonValue::String(v),
        Value::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2);
            for byte in bytes {
                write!(&mut hex, "{byte:02x}").expect("writing to String should not fail");
            }
            JsonValue::String(format!("0x{hex}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_sqlite_values() {
        assert_eq!(sqlite_value_to_json(Value::Null), JsonValue::Null);
        assert_eq!(sqlite_value_to_json(Value::Integer(7)), serde_json::json!(7));
        assert_eq!(sqlite_value_to_json(Value::Real(1.5)), serde_json::json!(1.5));
        assert_eq!(sqlite_value_to_json(Value::Real(f64::NAN)), JsonValue::Null);
        assert_eq!(
            sqlite_value_to_json(Value::Blob(vec![0xde, 0xad])),
            serde_json::json!("0xdead")
        );
    }
}

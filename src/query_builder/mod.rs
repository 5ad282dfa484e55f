//! Compiles dashboard query-builder requests into parameterized SQLite SQL.
//!
//! Every request passes [`QueryCompiler::validate_query_spec`] before any
//! clause is built. Identifiers are validated and quoted, filter values only
//! ever travel in the parameter list, and free-text expressions go through
//! [`expression::validate_expression`] against the live column list.

pub mod catalog;
pub mod expression;
pub mod filter;
pub mod identifier;
pub mod registry;

use std::fmt::Write;

use rusqlite::types::Value;
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, warn};

use crate::query_spec::{
    AggregateFunction, ColumnSpec, ExpressionColumnSpec, FilterNode, JoinType, OrderDirection,
    QuerySpec,
};
use catalog::{ColumnTypeCache, SchemaCatalog};
use expression::{validate_expression, ExpressionError};
use filter::{
    build_where_clause, exclude_column_from_filter_group, validate_filters, FilterScope,
    NumericBinding,
};
use identifier::{qualify_column, quote_alias, quote_name, validate_table_alias};

/// Hard cap on rows returned by a single query.
pub const MAX_ROWS: i64 = 10_000;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid source table: {0}")]
    InvalidSourceTable(String),
    #[error("no columns selected: provide at least one column or expression column")]
    NoColumnsSelected,
    #[error("invalid aggregate function: {0}")]
    InvalidAggregateFunction(String),
    #[error("invalid operator: {0}")]
    InvalidOperator(String),
    #[error("invalid join type: {0}")]
    InvalidJoinType(String),
    #[error("invalid join table: {0}")]
    InvalidJoinTable(String),
    #[error("invalid join condition for {0}: both `on.left` and `on.right` are required")]
    InvalidJoinCondition(String),
    #[error("invalid order direction for {column}: {direction}")]
    InvalidOrderDirection { column: String, direction: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("invalid expression column \"{alias}\": {source}")]
    InvalidExpression {
        alias: String,
        #[source]
        source: ExpressionError,
    },
    #[error("filter nesting depth {depth} exceeds the maximum of {max}")]
    FilterNestingTooDeep { depth: usize, max: usize },
    #[error("too many filter conditions: {count} exceeds the maximum of {max}")]
    TooManyFilterConditions { count: usize, max: usize },
    #[error("invalid value for filter on {column}: {reason}")]
    InvalidFilterValue { column: String, reason: String },
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("unknown custom table: {0}")]
    UnknownCustomTable(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl QueryError {
    /// Validation failures are the caller's fault; database failures are ours.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        !matches!(self, Self::Database(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Per-request facts shared by the clause builders.
struct QueryContext {
    source: String,
    source_columns: Vec<String>,
    aliases: Vec<(String, String)>,
    has_joins: bool,
}

pub struct QueryCompiler<'a> {
    conn: &'a Connection,
    catalog: SchemaCatalog<'a>,
    numeric_binding: NumericBinding,
}

impl<'a> QueryCompiler<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection, cache: &'a ColumnTypeCache) -> Self {
        Self {
            conn,
            catalog: SchemaCatalog::new(conn, cache),
            numeric_binding: NumericBinding::default(),
        }
    }

    #[must_use]
    pub fn with_numeric_binding(mut self, numeric_binding: NumericBinding) -> Self {
        self.numeric_binding = numeric_binding;
        self
    }

    #[must_use]
    pub const fn catalog(&self) -> &SchemaCatalog<'a> {
        &self.catalog
    }

    /// Check a request against every allowlist, failing on the first
    /// violation.
    ///
    /// # Errors
    /// Returns the `QueryError` describing the first offending field.
    pub fn validate_query_spec(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        self.check_query_spec(spec).map_err(|err| {
            warn!(source_table = %spec.source_table, error = %err, "rejected query");
            err
        })
    }

    fn check_query_spec(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        self.check_source(&spec.source_table)?;

        if spec.columns.is_empty() && spec.expression_columns.is_empty() {
            return Err(QueryError::NoColumnsSelected);
        }

        for column in &spec.columns {
            if let Some(agg) = &column.aggregate_function {
                parse_aggregate(agg)?;
            }
        }

        check_filters(spec)?;

        for expr in &spec.expression_columns {
            let invalid = |source| QueryError::InvalidExpression {
                alias: expr.alias.clone(),
                source,
            };
            if expr.alias.trim().is_empty() {
                return Err(invalid(ExpressionError::MissingAlias));
            }
            if expr.expression.trim().is_empty() {
                return Err(invalid(ExpressionError::Empty));
            }
            if let Some(agg) = &expr.aggregate_function {
                parse_aggregate(agg)?;
            }
        }

        self.check_joins(spec)?;

        for order in &spec.order_by {
            parse_direction(&order.column, &order.direction)?;
        }

        Ok(())
    }

    /// The subset of checks a facet request needs: it carries no columns of
    /// its own.
    fn check_facet_spec(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        self.check_source(&spec.source_table)?;
        check_filters(spec)?;
        self.check_joins(spec)
    }

    fn check_source(&self, name: &str) -> Result<(), QueryError> {
        if registry::is_source_allowed(self.conn, name)? {
            Ok(())
        } else {
            Err(QueryError::InvalidSourceTable(name.to_string()))
        }
    }

    fn check_joins(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        for join in &spec.joins {
            if JoinType::parse(&join.join_type).is_none() {
                return Err(QueryError::InvalidJoinType(join.join_type.clone()));
            }
            if !registry::is_source_allowed(self.conn, &join.table)? {
                return Err(QueryError::InvalidJoinTable(join.table.clone()));
            }
            if join.on.left.trim().is_empty() || join.on.right.trim().is_empty() {
                return Err(QueryError::InvalidJoinCondition(join.table.clone()));
            }
        }
        Ok(())
    }

    fn context(&self, spec: &QuerySpec) -> Result<QueryContext, QueryError> {
        let aliases = spec
            .joins
            .iter()
            .map(|join| {
                let name = join
                    .alias
                    .as_deref()
                    .filter(|alias| !alias.is_empty())
                    .unwrap_or(&join.table);
                (name.to_string(), join.table.clone())
            })
            .collect();

        Ok(QueryContext {
            source: quote_name(&spec.source_table)?,
            source_columns: self.catalog.get_columns(&spec.source_table)?,
            aliases,
            has_joins: spec.has_joins(),
        })
    }

    fn scope<'s>(&'s self, spec: &'s QuerySpec, ctx: &'s QueryContext) -> FilterScope<'s> {
        FilterScope {
            catalog: &self.catalog,
            source_table: &spec.source_table,
            source_columns: &ctx.source_columns,
            aliases: &ctx.aliases,
            has_joins: ctx.has_joins,
            numeric_binding: self.numeric_binding,
        }
    }

    fn column_ref(&self, name: &str, spec: &QuerySpec, ctx: &QueryContext) -> Result<String, QueryError> {
        qualify_column(name, &spec.source_table, &ctx.source_columns, ctx.has_joins)
    }

    fn select_column(
        &self,
        column: &ColumnSpec,
        spec: &QuerySpec,
        ctx: &QueryContext,
    ) -> Result<String, QueryError> {
        let alias = column.alias.as_deref().filter(|alias| !alias.is_empty());

        let Some(agg) = &column.aggregate_function else {
            let target = self.column_ref(&column.column, spec, ctx)?;
            return Ok(match alias {
                Some(alias) => format!("{target} AS {}", quote_alias(alias)),
                None => target,
            });
        };

        let agg = parse_aggregate(agg)?;
        let target = if agg == AggregateFunction::Count && column.column == "*" {
            "*".to_string()
        } else {
            self.column_ref(&column.column, spec, ctx)?
        };
        let alias = alias.map_or_else(|| default_aggregate_alias(agg, &column.column), ToString::to_string);
        Ok(format!("{}({target}) AS {}", agg.as_sql(), quote_alias(&alias)))
    }

    fn select_expression(
        &self,
        expr: &ExpressionColumnSpec,
        ctx: &QueryContext,
    ) -> Result<String, QueryError> {
        validate_expression(&expr.expression, &ctx.source_columns).map_err(|source| {
            QueryError::InvalidExpression {
                alias: expr.alias.clone(),
                source,
            }
        })?;

        let alias = quote_alias(&expr.alias);
        match &expr.aggregate_function {
            Some(agg) => {
                let agg = parse_aggregate(agg)?;
                Ok(format!("{}(({})) AS {alias}", agg.as_sql(), expr.expression))
            }
            None => Ok(format!("({}) AS {alias}", expr.expression)),
        }
    }

    fn select_clause(&self, spec: &QuerySpec, ctx: &QueryContext) -> Result<String, QueryError> {
        let mut columns = spec
            .columns
            .iter()
            .map(|column| self.select_column(column, spec, ctx).map(Some))
            .collect::<Result<Vec<_>, _>>()?;
        let mut expressions = spec
            .expression_columns
            .iter()
            .map(|expr| self.select_expression(expr, ctx).map(Some))
            .collect::<Result<Vec<_>, _>>()?;

        let mut parts = Vec::with_capacity(columns.len() + expressions.len());
        if let Some(order) = &spec.column_order {
            for tag in order {
                let part = if let Some(name) = tag.strip_prefix("col:") {
                    take_first(&mut columns, |i| {
                        let column = &spec.columns[i];
                        column.column == name || column.alias.as_deref() == Some(name)
                    })
                } else if let Some(alias) = tag.strip_prefix("expr:") {
                    take_first(&mut expressions, |i| spec.expression_columns[i].alias == alias)
                } else {
                    None
                };
                parts.extend(part);
            }
        }
        // Items the order does not mention keep their natural position after it.
        parts.extend(columns.into_iter().flatten());
        parts.extend(expressions.into_iter().flatten());

        Ok(parts.join(", "))
    }

    /// The comma-separated select list, honouring `columnOrder`.
    ///
    /// # Errors
    /// Returns `QueryError` for invalid identifiers, aggregates or expressions.
    pub fn build_select_clause(&self, spec: &QuerySpec) -> Result<String, QueryError> {
        let ctx = self.context(spec)?;
        self.select_clause(spec, &ctx)
    }

    fn from_clause(&self, spec: &QuerySpec, ctx: &QueryContext) -> Result<String, QueryError> {
        let mut sql = format!(" FROM {}", ctx.source);
        for join in &spec.joins {
            let join_type = JoinType::parse(&join.join_type)
                .ok_or_else(|| QueryError::InvalidJoinType(join.join_type.clone()))?;
            let table = quote_name(&join.table)?;
            let alias = match join.alias.as_deref().filter(|alias| !alias.is_empty()) {
                Some(alias) => format!(" AS \"{}\"", validate_table_alias(alias)?),
                None => String::new(),
            };
            let left = self.column_ref(&join.on.left, spec, ctx)?;
            let right = self.column_ref(&join.on.right, spec, ctx)?;
            write!(
                &mut sql,
                " {} JOIN {table}{alias} ON {left} = {right}",
                join_type.as_sql()
            )
            .expect("writing to SQL buffer should not fail");
        }
        Ok(sql)
    }

    fn where_clause(
        &self,
        spec: &QuerySpec,
        ctx: &QueryContext,
        root: Option<&FilterNode>,
        params: &mut Vec<Value>,
    ) -> Result<String, QueryError> {
        build_where_clause(root, &self.scope(spec, ctx), params)
    }

    /// `GROUP BY`/`ORDER BY` entries may name a source column or a select alias.
    fn group_or_order_ref(
        &self,
        name: &str,
        spec: &QuerySpec,
        ctx: &QueryContext,
    ) -> Result<String, QueryError> {
        if !ctx.source_columns.iter().any(|c| c == name) && select_aliases(spec).any(|a| a == name) {
            return Ok(quote_alias(name));
        }
        self.column_ref(name, spec, ctx)
    }

    fn group_by_clause(&self, spec: &QuerySpec, ctx: &QueryContext) -> Result<String, QueryError> {
        if spec.group_by.is_empty() {
            return Ok(String::new());
        }
        let columns = spec
            .group_by
            .iter()
            .map(|name| self.group_or_order_ref(name, spec, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(" GROUP BY {}", columns.join(", ")))
    }

    fn order_by_clause(&self, spec: &QuerySpec, ctx: &QueryContext) -> Result<String, QueryError> {
        if spec.order_by.is_empty() {
            return Ok(String::new());
        }
        let mut terms = Vec::with_capacity(spec.order_by.len());
        for order in &spec.order_by {
            let direction = parse_direction(&order.column, &order.direction)?;
            let column = self.group_or_order_ref(&order.column, spec, ctx)?;
            terms.push(format!("{column} {}", direction.as_sql()));
        }
        Ok(format!(" ORDER BY {}", terms.join(", ")))
    }

    /// Compile the row query. `LIMIT` is always present and capped at
    /// [`MAX_ROWS`]; `OFFSET` appears only in paginated mode.
    ///
    /// # Errors
    /// Returns `QueryError` if validation or any clause builder fails.
    pub fn build_query(&self, spec: &QuerySpec) -> Result<BuiltQuery, QueryError> {
        self.validate_query_spec(spec)?;
        let ctx = self.context(spec)?;
        let root = spec.filter_root().map(FilterNode::Group);

        let mut params = Vec::new();
        let select = self.select_clause(spec, &ctx)?;
        let from = self.from_clause(spec, &ctx)?;
        let where_sql = self.where_clause(spec, &ctx, root.as_ref(), &mut params)?;
        let group_by = self.group_by_clause(spec, &ctx)?;
        let order_by = self.order_by_clause(spec, &ctx)?;

        let mut sql = format!(
            "SELECT {select}{from}{where_sql}{group_by}{order_by} LIMIT {}",
            effective_limit(spec.limit)
        );
        if let Some(offset) = spec.offset {
            write!(&mut sql, " OFFSET {}", offset.max(0)).expect("writing to SQL buffer should not fail");
        }

        debug!(%sql, params = params.len(), "compiled query");
        Ok(BuiltQuery { sql, params })
    }

    /// Compile the total-count query used for pagination. Grouped requests
    /// count groups, not source rows.
    ///
    /// # Errors
    /// Returns `QueryError` if validation or any clause builder fails.
    pub fn build_count_query(&self, spec: &QuerySpec) -> Result<BuiltQuery, QueryError> {
        self.validate_query_spec(spec)?;
        let ctx = self.context(spec)?;
        let root = spec.filter_root().map(FilterNode::Group);

        let mut params = Vec::new();
        let from = self.from_clause(spec, &ctx)?;
        let where_sql = self.where_clause(spec, &ctx, root.as_ref(), &mut params)?;

        let sql = if spec.group_by.is_empty() {
            format!("SELECT COUNT(*) AS \"total\"{from}{where_sql}")
        } else {
            let select = self.select_clause(spec, &ctx)?;
            let group_by = self.group_by_clause(spec, &ctx)?;
            format!(
                "SELECT COUNT(*) AS \"total\" FROM (SELECT {select}{from}{where_sql}{group_by}) AS \"grouped_rows\""
            )
        };

        debug!(%sql, params = params.len(), "compiled count query");
        Ok(BuiltQuery { sql, params })
    }

    /// Compile the distinct-values-with-counts query for one column, applying
    /// every active filter except the column's own.
    ///
    /// # Errors
    /// Returns `QueryError::UnknownColumn` for an unqualified column the
    /// source does not have, or any validation error.
    pub fn build_facet_query(&self, spec: &QuerySpec, column: &str) -> Result<BuiltQuery, QueryError> {
        self.check_facet_spec(spec).map_err(|err| {
            warn!(source_table = %spec.source_table, column, error = %err, "rejected facet query");
            err
        })?;
        let ctx = self.context(spec)?;

        if !column.contains('.') && !ctx.source_columns.iter().any(|c| c == column) {
            return Err(QueryError::UnknownColumn(column.to_string()));
        }

        let root = spec
            .filter_root()
            .map(|group| FilterNode::Group(exclude_column_from_filter_group(&group, column)));

        let mut params = Vec::new();
        let target = self.column_ref(column, spec, &ctx)?;
        let from = self.from_clause(spec, &ctx)?;
        let where_sql = self.where_clause(spec, &ctx, root.as_ref(), &mut params)?;

        let sql = format!(
            "SELECT {target} AS \"value\", COUNT(*) AS \"count\"{from}{where_sql} GROUP BY {target} ORDER BY {target}"
        );
        debug!(%sql, column, "compiled facet query");
        Ok(BuiltQuery { sql, params })
    }
}

fn check_filters(spec: &QuerySpec) -> Result<(), QueryError> {
    match spec.filter_root() {
        Some(root) => validate_filters(&FilterNode::Group(root)),
        None => Ok(()),
    }
}

fn parse_aggregate(name: &str) -> Result<AggregateFunction, QueryError> {
    AggregateFunction::parse(name).ok_or_else(|| QueryError::InvalidAggregateFunction(name.to_string()))
}

fn parse_direction(column: &str, direction: &str) -> Result<OrderDirection, QueryError> {
    OrderDirection::parse(direction).ok_or_else(|| QueryError::InvalidOrderDirection {
        column: column.to_string(),
        direction: direction.to_string(),
    })
}

fn default_aggregate_alias(agg: AggregateFunction, column: &str) -> String {
    let name = agg.as_sql().to_ascii_lowercase();
    if column == "*" {
        format!("{name}_all")
    } else {
        format!("{name}_{}", column.replace(['.', ' '], "_"))
    }
}

/// Every output alias a request defines, as the caller spelled it.
fn select_aliases(spec: &QuerySpec) -> impl Iterator<Item = String> + '_ {
    let columns = spec.columns.iter().filter_map(|column| {
        match (column.alias.as_deref().filter(|a| !a.is_empty()), &column.aggregate_function) {
            (Some(alias), _) => Some(alias.to_string()),
            (None, Some(agg)) => {
                AggregateFunction::parse(agg).map(|agg| default_aggregate_alias(agg, &column.column))
            }
            (None, None) => None,
        }
    });
    let expressions = spec.expression_columns.iter().map(|expr| expr.alias.clone());
    columns.chain(expressions)
}

fn take_first(parts: &mut [Option<String>], matches: impl Fn(usize) -> bool) -> Option<String> {
    parts
        .iter_mut()
        .enumerate()
        .find(|(i, part)| part.is_some() && matches(*i))
        .and_then(|(_, part)| part.take())
}

/// Requested limit, capped at [`MAX_ROWS`]. Non-positive or missing limits
/// fall back to the cap: SQLite reads a negative limit as "no limit".
#[must_use]
pub fn effective_limit(requested: Option<i64>) -> i64 {
    requested
        .filter(|limit| *limit > 0)
        .map_or(MAX_ROWS, |limit| limit.min(MAX_ROWS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_capped() {
        assert_eq!(effective_limit(Some(999_999)), MAX_ROWS);
        assert_eq!(effective_limit(Some(100)), 100);
        assert_eq!(effective_limit(None), MAX_ROWS);
        assert_eq!(effective_limit(Some(-1)), MAX_ROWS);
    }

    #[test]
    fn default_aggregate_aliases() {
        assert_eq!(default_aggregate_alias(AggregateFunction::Sum, "DOT_latest"), "sum_DOT_latest");
        assert_eq!(default_aggregate_alias(AggregateFunction::Avg, "tally.ayes"), "avg_tally_ayes");
        assert_eq!(default_aggregate_alias(AggregateFunction::Count, "*"), "count_all");
    }

    #[test]
    fn only_database_errors_are_server_errors() {
        assert!(QueryError::NoColumnsSelected.is_client_error());
        assert!(QueryError::UnknownCustomTable("x".into()).is_client_error());
        let db = QueryError::Database(rusqlite::Error::InvalidQuery);
        assert!(!db.is_client_error());
    }
}

//! Compilation of the recursive filter tree into a parameterized WHERE clause.

use rusqlite::types::Value;
use serde_json::Value as JsonValue;

use super::catalog::SchemaCatalog;
use super::identifier::qualify_column;
use super::QueryError;
use crate::query_spec::{FilterCondition, FilterGroup, FilterNode, FilterOperator, GroupOperator};

pub const MAX_FILTER_DEPTH: usize = 10;
pub const MAX_FILTER_CONDITIONS: usize = 100;

/// How numeric filter values are bound against columns whose declared type is
/// text-like or unknown.
///
/// SQLite compares a TEXT column against a bound integer by type first, so
/// `status = 1` never matches the text `'1'`. `TextAffinity` binds such
/// numbers as strings; `Native` binds them unchanged for strictly typed
/// engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumericBinding {
    #[default]
    TextAffinity,
    Native,
}

impl NumericBinding {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text-affinity" | "text_affinity" => Some(Self::TextAffinity),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}

/// Everything a condition needs to know about the query it belongs to.
pub struct FilterScope<'a> {
    pub catalog: &'a SchemaCatalog<'a>,
    pub source_table: &'a str,
    pub source_columns: &'a [String],
    /// Join alias (or table name) to table name.
    pub aliases: &'a [(String, String)],
    pub has_joins: bool,
    pub numeric_binding: NumericBinding,
}

/// # Errors
/// Returns `QueryError::InvalidOperator` for the first leaf or group operator
/// outside its allowlist.
pub fn validate_operators(node: &FilterNode) -> Result<(), QueryError> {
    match node {
        FilterNode::Condition(cond) => {
            FilterOperator::parse(&cond.operator)
                .ok_or_else(|| QueryError::InvalidOperator(cond.operator.clone()))?;
        }
        FilterNode::Group(group) => {
            GroupOperator::parse(&group.operator)
                .ok_or_else(|| QueryError::InvalidOperator(group.operator.clone()))?;
            for child in &group.conditions {
                validate_operators(child)?;
            }
        }
    }
    Ok(())
}

fn measure(node: &FilterNode, depth: usize, max_depth: &mut usize, leaves: &mut usize) {
    match node {
        FilterNode::Condition(_) => *leaves += 1,
        FilterNode::Group(group) => {
            let depth = depth + 1;
            *max_depth = (*max_depth).max(depth);
            for child in &group.conditions {
                measure(child, depth, max_depth, leaves);
            }
        }
    }
}

/// Enforce the nesting and size limits over the whole tree. The root group
/// counts as the first level.
///
/// # Errors
/// Returns `QueryError::FilterNestingTooDeep` or
/// `QueryError::TooManyFilterConditions`.
pub fn check_filter_limits(node: &FilterNode) -> Result<(), QueryError> {
    let mut depth = 0;
    let mut leaves = 0;
    measure(node, 0, &mut depth, &mut leaves);

    if depth > MAX_FILTER_DEPTH {
        return Err(QueryError::FilterNestingTooDeep {
            depth,
            max: MAX_FILTER_DEPTH,
        });
    }
    if leaves > MAX_FILTER_CONDITIONS {
        return Err(QueryError::TooManyFilterConditions {
            count: leaves,
            max: MAX_FILTER_CONDITIONS,
        });
    }
    Ok(())
}

/// All structural checks that run before any SQL is built.
///
/// # Errors
/// See [`check_filter_limits`] and [`validate_operators`].
pub fn validate_filters(node: &FilterNode) -> Result<(), QueryError> {
    check_filter_limits(node)?;
    validate_operators(node)
}

fn is_text_like(column_type: Option<&str>) -> bool {
    let Some(column_type) = column_type else {
        return true;
    };
    let upper = column_type.to_ascii_uppercase();
    upper.is_empty() || upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT")
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

fn bind_scalar(
    value: &JsonValue,
    cond: &FilterCondition,
    scope: &FilterScope<'_>,
) -> Result<Value, QueryError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Number(num) => {
            if scope.numeric_binding == NumericBinding::TextAffinity {
                let column_type =
                    scope
                        .catalog
                        .get_column_type(&cond.column, scope.source_table, scope.aliases)?;
                if is_text_like(column_type.as_deref()) {
                    return Ok(Value::Text(num.to_string()));
                }
            }
            if let Some(int) = num.as_i64() {
                Ok(Value::Integer(int))
            } else {
                Ok(Value::Real(num.as_f64().unwrap_or_default()))
            }
        }
        JsonValue::Array(_) | JsonValue::Object(_) => Err(QueryError::InvalidFilterValue {
            column: cond.column.clone(),
            reason: format!("{} operator requires a scalar value", cond.operator),
        }),
    }
}

/// Compile one leaf, pushing its values onto `params`. Returns an empty
/// string when the condition is skipped.
///
/// # Errors
/// Returns `QueryError::InvalidOperator`, `QueryError::InvalidIdentifier` or
/// `QueryError::InvalidFilterValue`.
pub fn build_condition(
    cond: &FilterCondition,
    scope: &FilterScope<'_>,
    params: &mut Vec<Value>,
) -> Result<String, QueryError> {
    let op = FilterOperator::parse(&cond.operator)
        .ok_or_else(|| QueryError::InvalidOperator(cond.operator.clone()))?;
    let column = qualify_column(
        &cond.column,
        scope.source_table,
        scope.source_columns,
        scope.has_joins,
    )?;
    let invalid = |reason: &str| QueryError::InvalidFilterValue {
        column: cond.column.clone(),
        reason: reason.to_string(),
    };

    match op {
        FilterOperator::IsNull | FilterOperator::IsNotNull => {
            Ok(format!("{column} {}", op.as_sql()))
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let JsonValue::Array(values) = &cond.value else {
                return Err(invalid(&format!("{} operator requires an array value", op.as_sql())));
            };
            if values.is_empty() {
                return Err(invalid(&format!(
                    "{} operator requires at least one value",
                    op.as_sql()
                )));
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                params.push(bind_scalar(value, cond, scope)?);
                placeholders.push("?");
            }
            Ok(format!("{column} {} ({})", op.as_sql(), placeholders.join(", ")))
        }
        FilterOperator::Between => {
            let values = match &cond.value {
                JsonValue::Array(values) if values.len() == 2 => values,
                _ => return Err(invalid("BETWEEN operator requires exactly 2 values")),
            };
            params.push(bind_scalar(&values[0], cond, scope)?);
            params.push(bind_scalar(&values[1], cond, scope)?);
            Ok(format!("{column} BETWEEN ? AND ?"))
        }
        _ if is_blank(&cond.value) => Ok(String::new()),
        FilterOperator::NotEq => {
            params.push(bind_scalar(&cond.value, cond, scope)?);
            Ok(format!("({column} != ? OR {column} IS NULL)"))
        }
        _ => {
            params.push(bind_scalar(&cond.value, cond, scope)?);
            Ok(format!("{column} {} ?", op.as_sql()))
        }
    }
}

/// Compile a group by joining its non-empty children with the group's
/// operator. Nested groups are parenthesized; the returned fragment is not.
///
/// # Errors
/// Propagates any error from [`build_condition`].
pub fn build_group(
    group: &FilterGroup,
    scope: &FilterScope<'_>,
    params: &mut Vec<Value>,
) -> Result<String, QueryError> {
    let op = GroupOperator::parse(&group.operator)
        .ok_or_else(|| QueryError::InvalidOperator(group.operator.clone()))?;

    let mut parts = Vec::with_capacity(group.conditions.len());
    for child in &group.conditions {
        match child {
            FilterNode::Condition(cond) => {
                let sql = build_condition(cond, scope, params)?;
                if !sql.is_empty() {
                    parts.push(sql);
                }
            }
            FilterNode::Group(sub) => {
                let sql = build_group(sub, scope, params)?;
                if !sql.is_empty() {
                    parts.push(format!("({sql})"));
                }
            }
        }
    }

    Ok(parts.join(&format!(" {} ", op.as_sql())))
}

/// Compile a whole tree into a `WHERE ...` clause, or an empty string.
///
/// # Errors
/// See [`build_group`].
pub fn build_where_clause(
    root: Option<&FilterNode>,
    scope: &FilterScope<'_>,
    params: &mut Vec<Value>,
) -> Result<String, QueryError> {
    let sql = match root {
        None => String::new(),
        Some(FilterNode::Group(group)) => build_group(group, scope, params)?,
        Some(FilterNode::Condition(cond)) => build_condition(cond, scope, params)?,
    };
    if sql.is_empty() {
        Ok(sql)
    } else {
        Ok(format!(" WHERE {sql}"))
    }
}

/// Rebuild a group without any leaf that filters on `column`, dropping
/// sub-groups left empty.
#[must_use]
pub fn exclude_column_from_filter_group(group: &FilterGroup, column: &str) -> FilterGroup {
    let conditions = group
        .conditions
        .iter()
        .filter_map(|child| match child {
            FilterNode::Condition(cond) if cond.column == column => None,
            FilterNode::Condition(_) => Some(child.clone()),
            FilterNode::Group(sub) => {
                let sub = exclude_column_from_filter_group(sub, column);
                (!sub.conditions.is_empty()).then_some(FilterNode::Group(sub))
            }
        })
        .collect();

    FilterGroup {
        operator: group.operator.clone(),
        conditions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_builder::catalog::ColumnTypeCache;
    use rusqlite::Connection;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE referenda (id INTEGER PRIMARY KEY, status TEXT, category TEXT, \
             DOT_latest REAL, track TEXT, \"tally.ayes\" REAL, category_id INTEGER);
             CREATE TABLE categories (id INTEGER PRIMARY KEY, category TEXT);",
        )
        .unwrap();
        conn
    }

    fn node(value: serde_json::Value) -> FilterNode {
        serde_json::from_value(value).unwrap()
    }

    fn compile_with(
        conn: &Connection,
        tree: &FilterNode,
        has_joins: bool,
        numeric_binding: NumericBinding,
    ) -> Result<(String, Vec<Value>), QueryError> {
        let cache = ColumnTypeCache::new();
        let catalog = SchemaCatalog::new(conn, &cache);
        let columns = catalog.get_columns("referenda")?;
        let aliases = vec![("c".to_string(), "categories".to_string())];
        let scope = FilterScope {
            catalog: &catalog,
            source_table: "referenda",
            source_columns: &columns,
            aliases: &aliases,
            has_joins,
            numeric_binding,
        };
        validate_filters(tree)?;
        let mut params = Vec::new();
        let sql = match tree {
            FilterNode::Group(group) => build_group(group, &scope, &mut params)?,
            FilterNode::Condition(cond) => build_condition(cond, &scope, &mut params)?,
        };
        Ok((sql, params))
    }

    fn compile(tree: &FilterNode) -> Result<(String, Vec<Value>), QueryError> {
        compile_with(&conn(), tree, false, NumericBinding::TextAffinity)
    }

    fn nested(levels: usize) -> serde_json::Value {
        let mut tree = json!({ "column": "status", "operator": "=", "value": "Executed" });
        for _ in 0..levels {
            tree = json!({ "operator": "AND", "conditions": [tree] });
        }
        tree
    }

    fn flat(count: usize) -> serde_json::Value {
        let conditions: Vec<_> = (0..count)
            .map(|i| json!({ "column": "id", "operator": "!=", "value": i }))
            .collect();
        json!({ "operator": "OR", "conditions": conditions })
    }

    #[test]
    fn compound_and_clause() {
        let tree = node(json!({
            "operator": "AND",
            "conditions": [
                { "column": "status", "operator": "=", "value": "Executed" },
                { "column": "DOT_latest", "operator": ">", "value": 10000 },
                { "column": "category", "operator": "IS NOT NULL", "value": null }
            ]
        }));
        let (sql, params) = compile(&tree).unwrap();
        assert_eq!(sql, "\"status\" = ? AND \"DOT_latest\" > ? AND \"category\" IS NOT NULL");
        assert_eq!(params, vec![Value::Text("Executed".into()), Value::Integer(10000)]);
    }

    #[test]
    fn nested_groups_are_parenthesized() {
        let tree = node(json!({
            "operator": "AND",
            "conditions": [
                { "column": "category", "operator": "IS NOT NULL", "value": null },
                { "operator": "OR", "conditions": [
                    { "column": "status", "operator": "=", "value": "Executed" },
                    { "column": "DOT_latest", "operator": ">", "value": 50000 }
                ]}
            ]
        }));
        let (sql, params) = compile(&tree).unwrap();
        assert_eq!(
            sql,
            "\"category\" IS NOT NULL AND (\"status\" = ? OR \"DOT_latest\" > ?)"
        );
        assert_eq!(params, vec![Value::Text("Executed".into()), Value::Integer(50000)]);
    }

    #[test]
    fn values_are_always_parameters() {
        let payload = "'; DROP TABLE x;--";
        let tree = node(json!({ "column": "status", "operator": "LIKE", "value": payload }));
        let (sql, params) = compile(&tree).unwrap();
        assert_eq!(sql, "\"status\" LIKE ?");
        assert!(!sql.contains("DROP"));
        assert_eq!(params, vec![Value::Text(payload.into())]);
    }

    #[test]
    fn not_equal_includes_null_rows() {
        let tree = node(json!({ "column": "category", "operator": "!=", "value": "Foo" }));
        let (sql, params) = compile(&tree).unwrap();
        assert_eq!(sql, "(\"category\" != ? OR \"category\" IS NULL)");
        assert_eq!(params, vec![Value::Text("Foo".into())]);
    }

    #[test]
    fn in_requires_non_empty_array() {
        let err = compile(&node(json!({ "column": "status", "operator": "IN", "value": [] })))
            .unwrap_err();
        assert!(err.to_string().contains("at least one value"), "{err}");

        let err = compile(&node(json!({ "column": "status", "operator": "IN", "value": "x" })))
            .unwrap_err();
        assert!(err.to_string().contains("array value"), "{err}");

        let (sql, params) = compile(&node(
            json!({ "column": "status", "operator": "NOT IN", "value": ["Executed", "Rejected"] }),
        ))
        .unwrap();
        assert_eq!(sql, "\"status\" NOT IN (?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn between_requires_two_values() {
        let err = compile(&node(json!({ "column": "DOT_latest", "operator": "BETWEEN", "value": [1] })))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilterValue { .. }));
        assert!(err.to_string().contains("exactly 2 values"), "{err}");

        let (sql, params) = compile(&node(
            json!({ "column": "DOT_latest", "operator": "BETWEEN", "value": [1, 5000] }),
        ))
        .unwrap();
        assert_eq!(sql, "\"DOT_latest\" BETWEEN ? AND ?");
        assert_eq!(params, vec![Value::Integer(1), Value::Integer(5000)]);
    }

    #[test]
    fn blank_values_skip_the_condition() {
        let tree = node(json!({
            "operator": "AND",
            "conditions": [
                { "column": "status", "operator": "=", "value": "" },
                { "column": "track", "operator": "LIKE" },
                { "operator": "OR", "conditions": [
                    { "column": "category", "operator": "!=", "value": null }
                ]},
                { "column": "id", "operator": ">", "value": 5 }
            ]
        }));
        let (sql, params) = compile(&tree).unwrap();
        assert_eq!(sql, "\"id\" > ?");
        assert_eq!(params, vec![Value::Integer(5)]);
    }

    #[test]
    fn numbers_against_text_columns_bind_as_text() {
        let tree = node(json!({ "column": "status", "operator": "=", "value": 42 }));
        let (_, params) = compile(&tree).unwrap();
        assert_eq!(params, vec![Value::Text("42".into())]);

        let (_, params) = compile_with(&conn(), &tree, false, NumericBinding::Native).unwrap();
        assert_eq!(params, vec![Value::Integer(42)]);

        let tree = node(json!({ "column": "c.id", "operator": "=", "value": 3 }));
        let (_, params) = compile_with(&conn(), &tree, true, NumericBinding::TextAffinity).unwrap();
        assert_eq!(params, vec![Value::Integer(3)]);

        let tree = node(json!({ "column": "id", "operator": "IN", "value": [true, 2.5] }));
        let (_, params) = compile(&tree).unwrap();
        assert_eq!(params, vec![Value::Integer(1), Value::Real(2.5)]);
    }

    #[test]
    fn joins_qualify_bare_columns() {
        let tree = node(json!({
            "operator": "AND",
            "conditions": [
                { "column": "category", "operator": "=", "value": "Development" },
                { "column": "c.category", "operator": "=", "value": "Outreach" },
                { "column": "tally.ayes", "operator": ">", "value": 1 }
            ]
        }));
        let (sql, _) = compile_with(&conn(), &tree, true, NumericBinding::TextAffinity).unwrap();
        assert_eq!(
            sql,
            "\"referenda\".\"category\" = ? AND \"c\".\"category\" = ? AND \"referenda\".\"tally.ayes\" > ?"
        );
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let err = compile(&node(json!({ "column": "id", "operator": "UNION", "value": "x" })))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperator(op) if op == "UNION"));

        let err = compile(&node(json!({ "operator": "XOR", "conditions": [] }))).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperator(_)));
    }

    #[test]
    fn malformed_column_names_are_rejected() {
        let err = compile(&node(json!({ "column": "id = 1 OR 1", "operator": "=", "value": 1 })))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidIdentifier(_)));
    }

    #[test]
    fn nesting_limit_is_inclusive() {
        assert!(check_filter_limits(&node(nested(MAX_FILTER_DEPTH))).is_ok());
        assert!(compile(&node(nested(MAX_FILTER_DEPTH))).is_ok());
        assert!(matches!(
            check_filter_limits(&node(nested(MAX_FILTER_DEPTH + 1))),
            Err(QueryError::FilterNestingTooDeep { depth: 11, max: 10 })
        ));
    }

    #[test]
    fn condition_limit_is_counted_over_the_whole_tree() {
        assert!(check_filter_limits(&node(flat(MAX_FILTER_CONDITIONS))).is_ok());
        assert!(matches!(
            check_filter_limits(&node(flat(MAX_FILTER_CONDITIONS + 1))),
            Err(QueryError::TooManyFilterConditions { count: 101, max: 100 })
        ));

        let split = json!({ "operator": "AND", "conditions": [flat(60), flat(41)] });
        assert!(matches!(
            check_filter_limits(&node(split)),
            Err(QueryError::TooManyFilterConditions { count: 101, .. })
        ));
    }

    #[test]
    fn excluding_a_column_drops_its_leaves_and_empty_groups() {
        let tree = node(json!({
            "operator": "AND",
            "conditions": [
                { "column": "status", "operator": "=", "value": "Executed" },
                { "operator": "OR", "conditions": [
                    { "column": "status", "operator": "=", "value": "Rejected" }
                ]},
                { "operator": "OR", "conditions": [
                    { "column": "status", "operator": "=", "value": "Approved" },
                    { "column": "track", "operator": "=", "value": "Treasurer" }
                ]}
            ]
        }));
        let FilterNode::Group(group) = tree else {
            panic!("expected group");
        };

        let pruned = exclude_column_from_filter_group(&group, "status");
        assert_eq!(pruned.conditions.len(), 1);
        let FilterNode::Group(inner) = &pruned.conditions[0] else {
            panic!("expected nested group");
        };
        assert_eq!(inner.conditions.len(), 1);

        let conn = conn();
        let (sql, params) =
            compile_with(&conn, &FilterNode::Group(pruned), false, NumericBinding::TextAffinity)
                .unwrap();
        assert_eq!(sql, "(\"track\" = ?)");
        assert_eq!(params, vec![Value::Text("Treasurer".into())]);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl JoinType {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INNER" => Some(Self::Inner),
            "LEFT" => Some(Self::Left),
            "RIGHT" => Some(Self::Right),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Inner => "INNER",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ASC" => Some(Self::Asc),
            "DESC" => Some(Self::Desc),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// Comparison operators a filter condition may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

impl FilterOperator {
    /// Operators are matched exactly, the way the client sends them.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::NotEq),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Gte),
            "<=" => Some(Self::Lte),
            "LIKE" => Some(Self::Like),
            "NOT LIKE" => Some(Self::NotLike),
            "IN" => Some(Self::In),
            "NOT IN" => Some(Self::NotIn),
            "IS NULL" => Some(Self::IsNull),
            "IS NOT NULL" => Some(Self::IsNotNull),
            "BETWEEN" => Some(Self::Between),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::Between => "BETWEEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperator {
    And,
    Or,
}

impl GroupOperator {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// A query as submitted by the dashboard's query builder.
///
/// Enumerated fields (aggregates, operators, join types, directions) are kept
/// as the raw strings the client sent; they are checked against their
/// allowlists by `QueryCompiler::validate_query_spec` before any SQL is built.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySpec {
    pub source_table: String,
    pub columns: Vec<ColumnSpec>,
    pub expression_columns: Vec<ExpressionColumnSpec>,
    pub column_order: Option<Vec<String>>,
    pub joins: Vec<JoinSpec>,
    pub filters: Option<Filters>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl QuerySpec {
    #[must_use]
    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// Presence of `offset`, even zero, switches the request to paginated mode.
    #[must_use]
    pub const fn is_paginated(&self) -> bool {
        self.offset.is_some()
    }

    /// The filter tree normalised to a single root group.
    #[must_use]
    pub fn filter_root(&self) -> Option<FilterGroup> {
        self.filters.clone().map(Filters::into_root)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub column: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub aggregate_function: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionColumnSpec {
    pub expression: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub aggregate_function: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JoinSpec {
    #[serde(rename = "type", default)]
    pub join_type: String,
    pub table: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub on: JoinOn,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct JoinOn {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrderSpec {
    pub column: String,
    #[serde(default = "default_direction")]
    pub direction: String,
}

fn default_direction() -> String {
    "ASC".to_string()
}

/// Either a bare list of conditions (implicitly AND-ed) or a full tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Filters {
    List(Vec<FilterNode>),
    Tree(FilterNode),
}

impl Filters {
    #[must_use]
    pub fn into_root(self) -> FilterGroup {
        match self {
            Self::List(conditions) => FilterGroup {
                operator: "AND".to_string(),
                conditions,
            },
            Self::Tree(FilterNode::Group(group)) => group,
            Self::Tree(leaf @ FilterNode::Condition(_)) => FilterGroup {
                operator: "AND".to_string(),
                conditions: vec![leaf],
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group(FilterGroup),
    Condition(FilterCondition),
}

impl FilterNode {
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterGroup {
    pub operator: String,
    pub conditions: Vec<FilterNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: String,
    #[serde(default)]
    pub value: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_nested_filter_tree() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "sourceTable": "referenda",
            "columns": [{ "column": "id" }],
            "filters": {
                "operator": "AND",
                "conditions": [
                    { "column": "category", "operator": "IS NOT NULL" },
                    { "operator": "OR", "conditions": [
                        { "column": "status", "operator": "=", "value": "Executed" }
                    ]}
                ]
            }
        }))
        .unwrap();

        let root = spec.filter_root().unwrap();
        assert_eq!(root.conditions.len(), 2);
        assert!(!root.conditions[0].is_group());
        assert!(root.conditions[1].is_group());
        match &root.conditions[0] {
            FilterNode::Condition(cond) => assert!(cond.value.is_null()),
            FilterNode::Group(_) => panic!("expected a condition"),
        }
    }

    #[test]
    fn bare_condition_list_becomes_and_group() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "sourceTable": "referenda",
            "filters": [
                { "column": "status", "operator": "=", "value": "Executed" },
                { "column": "track", "operator": "=", "value": "Treasurer" }
            ]
        }))
        .unwrap();

        let root = spec.filter_root().unwrap();
        assert_eq!(root.operator, "AND");
        assert_eq!(root.conditions.len(), 2);
    }

    #[test]
    fn join_type_field_is_renamed() {
        let join: JoinSpec = serde_json::from_value(json!({
            "type": "left",
            "table": "categories",
            "alias": "c",
            "on": { "left": "category_id", "right": "c.id" }
        }))
        .unwrap();
        assert_eq!(JoinType::parse(&join.join_type), Some(JoinType::Left));
        assert_eq!(join.on.right, "c.id");
    }

    #[test]
    fn offset_zero_is_paginated() {
        let spec: QuerySpec =
            serde_json::from_value(json!({ "sourceTable": "referenda", "offset": 0 })).unwrap();
        assert!(spec.is_paginated());
        assert!(!QuerySpec::default().is_paginated());
    }

    #[test]
    fn operators_are_case_sensitive_but_keywords_are_not() {
        assert_eq!(FilterOperator::parse("NOT IN"), Some(FilterOperator::NotIn));
        assert_eq!(FilterOperator::parse("not in"), None);
        assert_eq!(AggregateFunction::parse("sum"), Some(AggregateFunction::Sum));
        assert_eq!(OrderDirection::parse("desc"), Some(OrderDirection::Desc));
        assert_eq!(GroupOperator::parse("or"), Some(GroupOperator::Or));
    }
}

use super::QueryError;

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | ' ')
}

fn is_safe_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Quote a single identifier part. The caller has already checked the
/// character class, so no embedded quote can appear.
fn quote_part(part: &str) -> String {
    format!("\"{part}\"")
}

/// Validate and quote a table, column or `qualifier.column` reference.
///
/// A dotted name is first looked up as a literal column of the source table
/// (`tally.ayes` is a single column); only when that fails is it split on the
/// last dot into qualifier and column.
///
/// # Errors
/// Returns `QueryError::InvalidIdentifier` when `name` is empty, has an empty
/// part, or contains a character outside `[A-Za-z0-9_. ]`.
pub fn quote_identifier(name: &str, source_columns: Option<&[String]>) -> Result<String, QueryError> {
    if name.trim().is_empty() || !name.chars().all(is_identifier_char) {
        return Err(QueryError::InvalidIdentifier(name.to_string()));
    }

    if !name.contains('.') {
        return Ok(quote_part(name));
    }

    if source_columns.is_some_and(|columns| columns.iter().any(|c| c == name)) {
        return Ok(quote_part(name));
    }

    match name.rsplit_once('.') {
        Some((qualifier, column)) if !qualifier.is_empty() && !column.is_empty() => {
            Ok(format!("{}.{}", quote_part(qualifier), quote_part(column)))
        }
        _ => Err(QueryError::InvalidIdentifier(name.to_string())),
    }
}

/// Quote a name that must not be split, such as a table or source name.
///
/// # Errors
/// Returns `QueryError::InvalidIdentifier` on an empty name or a character
/// outside `[A-Za-z0-9_. ]`.
pub fn quote_name(name: &str) -> Result<String, QueryError> {
    if name.trim().is_empty() || !name.chars().all(is_identifier_char) {
        return Err(QueryError::InvalidIdentifier(name.to_string()));
    }
    Ok(quote_part(name))
}

/// Render a column reference as seen from the source table. With joins in
/// play, unqualified names (and literal dotted columns of the source) are
/// prefixed with the source table so they cannot become ambiguous.
///
/// # Errors
/// Returns `QueryError::InvalidIdentifier` as [`quote_identifier`] does.
pub fn qualify_column(
    name: &str,
    source_table: &str,
    source_columns: &[String],
    has_joins: bool,
) -> Result<String, QueryError> {
    let is_source_column = source_columns.iter().any(|c| c == name);
    if has_joins && (is_source_column || !name.contains('.')) {
        let column = quote_name(name)?;
        return Ok(format!("{}.{column}", quote_name(source_table)?));
    }
    quote_identifier(name, Some(source_columns))
}

/// Join aliases are referenced from other clauses (`c.id`), so they must be
/// plain identifiers rather than sanitized labels.
///
/// # Errors
/// Returns `QueryError::InvalidIdentifier` if the alias is not `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_table_alias(alias: &str) -> Result<&str, QueryError> {
    if is_safe_name(alias) {
        Ok(alias)
    } else {
        Err(QueryError::InvalidIdentifier(alias.to_string()))
    }
}

/// Turn a caller-chosen display label into a safe column alias. Never fails.
#[must_use]
pub fn sanitize_alias(alias: &str) -> String {
    let mut out: String = alias
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if !out.starts_with(|ch: char| ch.is_ascii_alphabetic() || ch == '_') {
        out.insert(0, '_');
    }
    out
}

/// Quoted, sanitized alias ready for an `AS` clause.
#[must_use]
pub fn quote_alias(alias: &str) -> String {
    quote_part(&sanitize_alias(alias))
}

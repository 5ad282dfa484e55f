//! Validation of free-text SQL expressions used for computed columns.
//!
//! Expressions are spliced into the query text, so they pass three separate
//! checks: a denylist of statement keywords and comment syntax, an allowlist
//! of functions and keywords, and column membership for every other word.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub const MAX_EXPRESSION_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,
    #[error("expression column requires an alias")]
    MissingAlias,
    #[error("expression exceeds {MAX_EXPRESSION_LEN} characters")]
    TooLong,
    #[error("expression contains a blocked pattern: {0}")]
    BlockedPattern(&'static str),
    #[error("expression has an unterminated quote or unbalanced parentheses")]
    Unbalanced,
    #[error("expression contains a disallowed character: {0:?}")]
    InvalidCharacter(char),
    #[error("unknown column or function: {0}")]
    UnknownColumnOrFunction(String),
    #[error("dotted column {0} must be double-quoted")]
    UnquotedDottedName(String),
}

static BLOCKED_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r";").expect("Invalid regex: semicolon pattern"), "semicolon"),
        (Regex::new(r"--").expect("Invalid regex: line comment pattern"), "line comment"),
        (Regex::new(r"/\*").expect("Invalid regex: block comment pattern"), "block comment"),
        (
            Regex::new(
                r"(?i)\b(UNION|SELECT|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|EXEC|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX|TRUNCATE)\b",
            )
            .expect("Invalid regex: statement keyword pattern"),
            "statement keyword",
        ),
        (
            Regex::new(r"(?i)\b(load_extension|fts3_tokenizer|writefile)\b")
                .expect("Invalid regex: dangerous function pattern"),
            "dangerous function",
        ),
    ]
});

static ALLOWED_FUNCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // aggregate
        "COUNT", "SUM", "AVG", "MIN", "MAX", "TOTAL", "GROUP_CONCAT",
        // numeric
        "ABS", "ROUND", "CEIL", "CEILING", "FLOOR",
        // text
        "UPPER", "LOWER", "LENGTH", "TRIM", "LTRIM", "RTRIM", "SUBSTR", "SUBSTRING", "REPLACE",
        "INSTR", "PRINTF",
        // null handling and conversion
        "COALESCE", "IFNULL", "NULLIF", "IIF", "CAST", "TYPEOF",
        // date
        "DATE", "TIME", "DATETIME", "JULIANDAY", "STRFTIME", "UNIXEPOCH",
        // json
        "JSON_EXTRACT", "JSON_ARRAY_LENGTH", "JSON_TYPE",
        // window
        "ROW_NUMBER", "RANK", "DENSE_RANK", "LAG", "LEAD", "FIRST_VALUE", "LAST_VALUE", "NTILE",
    ]
    .into_iter()
    .collect()
});

static ALLOWED_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "AS", "AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE", "BETWEEN", "TRUE", "FALSE", "ASC",
        "DESC", "OVER", "PARTITION", "BY", "ORDER", "DISTINCT", "ALL", "ESCAPE",
        "CASE", "WHEN", "THEN", "ELSE", "END",
        "INTEGER", "REAL", "TEXT", "NUMERIC",
    ]
    .into_iter()
    .collect()
});

fn is_allowed_word(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    ALLOWED_FUNCTIONS.contains(upper.as_str()) || ALLOWED_KEYWORDS.contains(upper.as_str())
}

/// Characters that may appear outside quotes. Parameter markers
/// (`?`, `:`, `@`, `$`) and alternative quoting (`` ` ``, `[`) are excluded.
fn is_expression_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || ch.is_ascii_whitespace()
        || matches!(
            ch,
            '_' | '.' | '(' | ')' | ',' | '+' | '-' | '*' | '/' | '%' | '<' | '>' | '=' | '!' | '|'
                | '&' | '~'
        )
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    /// `"..."` identifier with `""` escapes resolved.
    Quoted(String),
    /// Bare word: a keyword, function name or column.
    Word(&'a str),
}

/// Consume a quoted run starting at byte `start` (the opening quote).
/// A doubled quote is an escaped quote. Returns the unescaped contents and
/// the byte offset just past the closing quote.
fn read_quoted(text: &str, start: usize, quote: char) -> Result<(String, usize), ExpressionError> {
    let mut contents = String::new();
    let mut chars = text[start + 1..].char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        if ch != quote {
            contents.push(ch);
            continue;
        }
        if chars.peek().is_some_and(|(_, next)| *next == quote) {
            chars.next();
            contents.push(quote);
            continue;
        }
        return Ok((contents, start + 1 + offset + ch.len_utf8()));
    }
    Err(ExpressionError::Unbalanced)
}

fn scan_while(text: &str, start: usize, keep: impl Fn(char) -> bool) -> usize {
    text[start..]
        .char_indices()
        .find(|(_, ch)| !keep(*ch))
        .map_or(text.len(), |(offset, _)| start + offset)
}

fn scan_number(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let digits = |from: usize| scan_while(text, from, |ch| ch.is_ascii_digit());
    let mut end = digits(start);
    if bytes.get(end) == Some(&b'.') {
        end = digits(end + 1);
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            end = digits(exp);
        }
    }
    end
}

/// Split an expression the way SQLite reads it, left to right. String
/// literals and quoted identifiers are exclusive states, so a quote of one
/// kind inside the other never opens a new run. Literals and numbers are
/// dropped; identifiers and bare words are returned for the allowlist check.
fn tokenize(text: &str) -> Result<Vec<Token<'_>>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut depth = 0_i32;
    let mut pos = 0;

    while let Some(ch) = text[pos..].chars().next() {
        match ch {
            '\'' => {
                pos = read_quoted(text, pos, '\'')?.1;
            }
            '"' => {
                let (name, end) = read_quoted(text, pos, '"')?;
                tokens.push(Token::Quoted(name));
                pos = end;
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                let end = scan_while(text, pos, |c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
                tokens.push(Token::Word(&text[pos..end]));
                pos = end;
            }
            '0'..='9' => pos = scan_number(text, pos),
            '.' if text[pos + 1..].starts_with(|c: char| c.is_ascii_digit()) => {
                pos = scan_number(text, pos + 1);
            }
            '(' => {
                depth += 1;
                pos += 1;
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ExpressionError::Unbalanced);
                }
                pos += 1;
            }
            _ if is_expression_char(ch) => pos += ch.len_utf8(),
            _ => return Err(ExpressionError::InvalidCharacter(ch)),
        }
    }

    if depth != 0 {
        return Err(ExpressionError::Unbalanced);
    }
    Ok(tokens)
}

/// Check an expression against `available_columns`.
///
/// # Errors
/// Returns the first `ExpressionError` found, checking in order: length,
/// blocked patterns, characters and quoting/parentheses, then every
/// identifier and word.
pub fn validate_expression(expression: &str, available_columns: &[String]) -> Result<(), ExpressionError> {
    if expression.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(ExpressionError::TooLong);
    }

    if let Some((_, label)) = BLOCKED_PATTERNS.iter().find(|(re, _)| re.is_match(expression)) {
        return Err(ExpressionError::BlockedPattern(label));
    }

    let is_column = |name: &str| available_columns.iter().any(|c| c == name);
    for token in tokenize(expression)? {
        match token {
            Token::Quoted(name) if is_column(&name) => {}
            Token::Quoted(name) => return Err(ExpressionError::UnknownColumnOrFunction(name)),
            Token::Word(word) if word.contains('.') => {
                // Unquoted, SQLite reads `a.b` as table `a`, column `b`.
                return Err(if is_column(word) {
                    ExpressionError::UnquotedDottedName(word.to_string())
                } else {
                    ExpressionError::UnknownColumnOrFunction(word.to_string())
                });
            }
            Token::Word(word) if is_allowed_word(word) || is_column(word) => {}
            Token::Word(word) => return Err(ExpressionError::UnknownColumnOrFunction(word.to_string())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        ["id", "title", "status", "DOT_latest", "USD_latest", "tally.ayes", "proposal_time"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn accepts_functions_over_known_columns() {
        let cols = columns();
        assert_eq!(validate_expression("UPPER(title)", &cols), Ok(()));
        assert_eq!(validate_expression("DOT_latest * 1.5e3 / 100", &cols), Ok(()));
        assert_eq!(
            validate_expression("CASE WHEN status = 'Executed' THEN USD_latest ELSE 0 END", &cols),
            Ok(())
        );
        assert_eq!(validate_expression("CAST(\"tally.ayes\" AS REAL)", &cols), Ok(()));
        assert_eq!(
            validate_expression("strftime('%Y-%m', proposal_time)", &cols),
            Ok(())
        );
        assert_eq!(
            validate_expression("SUM(USD_latest) OVER (PARTITION BY status ORDER BY id)", &cols),
            Ok(())
        );
    }

    #[test]
    fn string_literals_are_not_identifiers() {
        let cols = columns();
        assert_eq!(
            validate_expression("COALESCE(status, 'unknown_status value')", &cols),
            Ok(())
        );
        assert_eq!(validate_expression("title || 'it''s'", &cols), Ok(()));
    }

    #[test]
    fn blocks_statement_syntax() {
        let cols = columns();
        assert_eq!(
            validate_expression("title; DROP TABLE x", &cols),
            Err(ExpressionError::BlockedPattern("semicolon"))
        );
        assert_eq!(
            validate_expression("title -- trailing", &cols),
            Err(ExpressionError::BlockedPattern("line comment"))
        );
        assert_eq!(
            validate_expression("title /* c */", &cols),
            Err(ExpressionError::BlockedPattern("block comment"))
        );
        assert_eq!(
            validate_expression("id IN (select id from users)", &cols),
            Err(ExpressionError::BlockedPattern("statement keyword"))
        );
        assert_eq!(
            validate_expression("load_extension('x')", &cols),
            Err(ExpressionError::BlockedPattern("dangerous function"))
        );
    }

    #[test]
    fn keyword_match_respects_word_boundaries() {
        let cols = vec!["selected".to_string(), "updated_at".to_string()];
        assert_eq!(validate_expression("selected + 1", &cols), Ok(()));
        assert_eq!(validate_expression("DATE(updated_at)", &cols), Ok(()));
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let cols = columns();
        assert_eq!(
            validate_expression("nonexistent_col + 1", &cols),
            Err(ExpressionError::UnknownColumnOrFunction("nonexistent_col".to_string()))
        );
        assert_eq!(
            validate_expression("\"password_hash\"", &cols),
            Err(ExpressionError::UnknownColumnOrFunction("password_hash".to_string()))
        );
        assert_eq!(
            validate_expression("title FROM referenda", &cols),
            Err(ExpressionError::UnknownColumnOrFunction("FROM".to_string()))
        );
    }

    #[test]
    fn quote_inside_identifier_does_not_open_a_literal() {
        let cols = vec!["Column With Space".to_string(), "odd'name".to_string()];
        assert_eq!(
            validate_expression(r#""Column With'" || hex(randomblob(4)) || "'Space""#, &cols),
            Err(ExpressionError::UnknownColumnOrFunction("Column With'".to_string()))
        );
        assert_eq!(
            validate_expression(r#""odd'name" || hex(randomblob(4))"#, &cols),
            Err(ExpressionError::UnknownColumnOrFunction("hex".to_string()))
        );
        assert_eq!(validate_expression(r#""odd'name" || 'x'"#, &cols), Ok(()));
    }

    #[test]
    fn double_quote_inside_literal_does_not_open_an_identifier() {
        let cols = vec!["title".to_string(), "we\"ird".to_string()];
        assert_eq!(
            validate_expression(r#"'say "hi' || hex(title) || '"'"#, &cols),
            Err(ExpressionError::UnknownColumnOrFunction("hex".to_string()))
        );
        assert_eq!(validate_expression(r#""we""ird" || 'a "b"'"#, &cols), Ok(()));
    }

    #[test]
    fn dotted_columns_must_be_quoted() {
        let cols = columns();
        assert_eq!(
            validate_expression("tally.ayes * 2", &cols),
            Err(ExpressionError::UnquotedDottedName("tally.ayes".to_string()))
        );
        assert_eq!(
            validate_expression("users.password_hash", &cols),
            Err(ExpressionError::UnknownColumnOrFunction("users.password_hash".to_string()))
        );
        assert_eq!(validate_expression("\"tally.ayes\" * .5", &cols), Ok(()));
    }

    #[test]
    fn structural_limits() {
        let cols = columns();
        assert_eq!(validate_expression("  ", &cols), Err(ExpressionError::Empty));
        let long = format!("id + {}", "1 + ".repeat(200));
        assert_eq!(validate_expression(&long, &cols), Err(ExpressionError::TooLong));
        assert_eq!(validate_expression("UPPER(title", &cols), Err(ExpressionError::Unbalanced));
        assert_eq!(validate_expression("title || 'open", &cols), Err(ExpressionError::Unbalanced));
        assert_eq!(validate_expression("title) || (id", &cols), Err(ExpressionError::Unbalanced));
        assert_eq!(
            validate_expression("id + ?", &cols),
            Err(ExpressionError::InvalidCharacter('?'))
        );
        assert_eq!(
            validate_expression("[title]", &cols),
            Err(ExpressionError::InvalidCharacter('['))
        );
        assert_eq!(validate_expression("'a?b' || title", &cols), Ok(()));
    }
}

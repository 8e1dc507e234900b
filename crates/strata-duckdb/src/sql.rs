//! Quoting helpers for statements assembled from table and column names.

/// Quote an identifier (table, column, schema or database alias).
///
/// ```
/// assert_eq!(strata_duckdb::sql::quote_ident("my \"table\""), "\"my \"\"table\"\"\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

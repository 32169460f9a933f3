//! Live query definitions and the SQL issued on their behalf.

pub mod sql;

use std::fmt;
use std::sync::Arc;

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use uuid::Uuid;

use crate::core::{LiveQueryError, Result, Value};

/// Literal substituted for every positional placeholder during normalization.
pub const NEUTRAL_LITERAL: &str = "'1'";

const QUERY_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_7665_7175_6572_795f_6465_7073_0001);

/// An immutable read-only SQL selection plus its positional parameters.
#[derive(Clone)]
pub struct Query {
    sql: Arc<str>,
    params: Arc<[Value]>,
}

impl Query {
    /// Parses `sql` and accepts it only if it is a single `SELECT`-style query.
    pub fn new(sql: impl AsRef<str>) -> Result<Self> {
        Self::with_params(sql, Vec::new())
    }

    pub fn with_params(sql: impl AsRef<str>, params: Vec<Value>) -> Result<Self> {
        let sql = sql.as_ref().trim().trim_end_matches(';').trim_end();
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| LiveQueryError::Parse(e.to_string()))?;

        match statements.as_slice() {
            [Statement::Query(_)] => {}
            [] => return Err(LiveQueryError::Parse("empty query".to_string())),
            [_] => {
                return Err(LiveQueryError::Parse(
                    "live queries must be read-only selections".to_string(),
                ));
            }
            _ => {
                return Err(LiveQueryError::Parse(format!(
                    "expected a single statement, found {}",
                    statements.len()
                )));
            }
        }

        Ok(Self {
            sql: Arc::from(sql),
            params: Arc::from(params),
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The query text with every `$n` placeholder replaced by [`NEUTRAL_LITERAL`].
    ///
    /// Placeholders inside string literals, quoted identifiers and comments are
    /// left alone since the tokenizer never reports them as placeholders.
    pub fn normalized(&self) -> Result<String> {
        let dialect = PostgreSqlDialect {};
        let tokens = Tokenizer::new(&dialect, &self.sql)
            .tokenize_with_location()
            .map_err(|e| LiveQueryError::Parse(e.to_string()))?;

        let line_starts: Vec<usize> = std::iter::once(0)
            .chain(self.sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();

        let mut out = String::with_capacity(self.sql.len());
        let mut copied = 0;
        for token in tokens {
            let Token::Placeholder(ref placeholder) = token.token else {
                continue;
            };
            if !is_positional(placeholder) {
                continue;
            }
            let start = byte_offset(
                &self.sql,
                &line_starts,
                token.span.start.line,
                token.span.start.column,
            )
            .ok_or_else(|| {
                LiveQueryError::Parse(format!("placeholder {} has no location", placeholder))
            })?;
            out.push_str(&self.sql[copied..start]);
            out.push_str(NEUTRAL_LITERAL);
            copied = start + placeholder.len();
        }
        out.push_str(&self.sql[copied..]);
        Ok(out)
    }

    /// Stable key of the normalized text; parameter-equivalent queries share it.
    pub fn cache_key(&self) -> Result<Uuid> {
        let normalized = self.normalized()?;
        Ok(Uuid::new_v5(&QUERY_KEY_NAMESPACE, normalized.as_bytes()))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("sql", &&*self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

fn is_positional(placeholder: &str) -> bool {
    placeholder
        .strip_prefix('$')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Converts a 1-based (line, char column) location into a byte offset.
fn byte_offset(sql: &str, line_starts: &[usize], line: u64, column: u64) -> Option<usize> {
    let line_idx = usize::try_from(line).ok()?.checked_sub(1)?;
    let col_idx = usize::try_from(column).ok()?.checked_sub(1)?;
    let start = *line_starts.get(line_idx)?;
    sql[start..]
        .char_indices()
        .nth(col_idx)
        .map(|(offset, _)| start + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_select() {
        let query = Query::new("SELECT id, name FROM users WHERE age > 3;").unwrap();
        assert_eq!(query.sql(), "SELECT id, name FROM users WHERE age > 3");
        assert!(query.params().is_empty());
    }

    #[test]
    fn test_rejects_non_queries() {
        assert!(matches!(
            Query::new("DELETE FROM users"),
            Err(LiveQueryError::Parse(_))
        ));
        assert!(matches!(
            Query::new("SELECT 1; SELECT 2"),
            Err(LiveQueryError::Parse(_))
        ));
        assert!(matches!(Query::new("SELEC nonsense"), Err(LiveQueryError::Parse(_))));
        assert!(matches!(Query::new("   "), Err(LiveQueryError::Parse(_))));
    }

    #[test]
    fn test_normalized_replaces_placeholders() {
        let query = Query::with_params(
            "SELECT * FROM users WHERE id = $1 AND name <> $2",
            vec![Value::Integer(5), Value::from("x")],
        )
        .unwrap();
        assert_eq!(
            query.normalized().unwrap(),
            "SELECT * FROM users WHERE id = '1' AND name <> '1'"
        );
    }

    #[test]
    fn test_normalized_skips_literals() {
        let query = Query::new("SELECT '$1' AS raw, id\nFROM t WHERE id = $12").unwrap();
        assert_eq!(
            query.normalized().unwrap(),
            "SELECT '$1' AS raw, id\nFROM t WHERE id = '1'"
        );
    }

    #[test]
    fn test_cache_key_equivalence() {
        let a = Query::with_params("SELECT * FROM t WHERE id = $1", vec![Value::Integer(1)]).unwrap();
        let b = Query::with_params("SELECT * FROM t WHERE id = $1", vec![Value::Integer(9)]).unwrap();
        let c = Query::new("SELECT * FROM t WHERE id = '1'").unwrap();
        let d = Query::new("SELECT * FROM t WHERE id = 1").unwrap();

        assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());
        assert_eq!(a.cache_key().unwrap(), c.cache_key().unwrap());
        assert_ne!(a.cache_key().unwrap(), d.cache_key().unwrap());
    }
}

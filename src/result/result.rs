use std::sync::Arc;

use crate::core::{LiveQueryError, Result, Row, Value};

/// Raw result set returned by a [`QueryExecutor`](crate::connection::QueryExecutor).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of `name`, or a `Query` error naming the missing column.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            LiveQueryError::Query(format!("result set has no column '{}'", name))
        })
    }

    /// Reads column `name` of every row as text.
    pub fn text_column(&self, name: &str) -> Result<Vec<String>> {
        let idx = self.require_column(name)?;
        self.rows
            .iter()
            .map(|row| match row.get(idx) {
                Some(Value::Text(s)) => Ok(s.clone()),
                Some(other) => Err(LiveQueryError::Query(format!(
                    "column '{}' expected TEXT, got {}",
                    name,
                    other.type_name()
                ))),
                None => Err(LiveQueryError::Query(format!(
                    "row is shorter than its column list ('{}')",
                    name
                ))),
            })
            .collect()
    }

    /// Splits column `name` off every row, returning `(text, remaining row)`.
    pub fn split_text_column(self, name: &str) -> Result<Vec<(String, Row)>> {
        let idx = self.require_column(name)?;
        let columns: Arc<[String]> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, c)| c.clone())
            .collect();

        self.rows
            .into_iter()
            .map(|mut values| {
                if idx >= values.len() {
                    return Err(LiveQueryError::Query(format!(
                        "row is shorter than its column list ('{}')",
                        name
                    )));
                }
                let key = match values.remove(idx) {
                    Value::Text(s) => s,
                    other => {
                        return Err(LiveQueryError::Query(format!(
                            "column '{}' expected TEXT, got {}",
                            name,
                            other.type_name()
                        )));
                    }
                };
                Ok((key, Row::new(Arc::clone(&columns), values)))
            })
            .collect()
    }
}

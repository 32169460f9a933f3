use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::Value;

/// Content hash of one result row, standing in for row identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    pub fn new(hash: impl AsRef<str>) -> Self {
        Self(Arc::from(hash.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(hash: &str) -> Self {
        Self::new(hash)
    }
}

impl From<String> for Fingerprint {
    fn from(hash: String) -> Self {
        Self(Arc::from(hash))
    }
}

/// One result row: column names in query order, paired with their values.
///
/// Rows decoded from the same result set share a single column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Builds a row over a shared column list.
    ///
    /// Surplus values are dropped and missing values are padded with `Null`
    /// so that `columns` and `values` always line up.
    pub fn new(columns: Arc<[String]>, mut values: Vec<Value>) -> Self {
        values.resize(columns.len(), Value::Null);
        Self { columns, values }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self {
            columns: Arc::from(columns),
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup() {
        let row = Row::from_pairs([("id", Value::Integer(1)), ("name", Value::from("Alice"))]);
        assert_eq!(row.get("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.columns(), ["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_row_pads_missing_values() {
        let columns: Arc<[String]> = Arc::from(vec!["a".to_string(), "b".to_string()]);
        let row = Row::new(columns, vec![Value::Integer(1)]);
        assert_eq!(row.values(), [Value::Integer(1), Value::Null]);
    }

    #[test]
    fn test_row_serializes_in_column_order() {
        let row = Row::from_pairs([("z", 1i64), ("a", 2i64)]);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"z":1,"a":2}"#);
    }
}

//! Validated table identifiers

use std::fmt;

use serde::Serialize;

use super::{DataKind, Interval, SchemaError};

/// Schema-qualified table name, validated so it can be interpolated into SQL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: &str) -> Result<Self, SchemaError> {
        let schema = match schema {
            Some(s) if !s.is_empty() => Some(validate_identifier(s)?),
            _ => None,
        };
        Ok(Self {
            schema,
            name: validate_identifier(name)?,
        })
    }

    /// Table holding one kind at one interval, e.g. `market.futures_ohlcv_1d`
    pub fn for_series(
        schema: Option<&str>,
        kind: DataKind,
        interval: Interval,
    ) -> Result<Self, SchemaError> {
        Self::new(
            schema,
            &format!("{}_{}", kind.table_base(), interval.as_suffix()),
        )
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sibling table in the same schema with `suffix` appended to the name
    pub fn with_suffix(&self, suffix: &str) -> Result<Self, SchemaError> {
        Self::new(self.schema.as_deref(), &format!("{}{}", self.name, suffix))
    }

    /// Double-quoted, schema-qualified form for SQL text
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Accept only `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes (PostgreSQL NAMEDATALEN)
pub fn validate_identifier(ident: &str) -> Result<String, SchemaError> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && ident.len() <= 63 {
        Ok(ident.to_string())
    } else {
        Err(SchemaError::InvalidIdentifier(ident.to_string()))
    }
}

/// Double-quote a list of validated column names for SQL text
pub fn quote_columns<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{}\"", c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

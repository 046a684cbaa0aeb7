//! Canonical data schema for the sync engine
//!
//! Targets, windows and normalized records shared by every stage of the
//! pipeline. Provider payloads are decoded into these types before they
//! reach persistence.

mod record;
mod table;
mod target;

pub use record::*;
pub use table::*;
pub use target::*;

use thiserror::Error;

/// Errors raised while parsing schema values from strings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    #[error("Unknown {what}: '{value}'")]
    Unknown { what: &'static str, value: String },

    #[error("Invalid SQL identifier: '{0}'")]
    InvalidIdentifier(String),
}

impl SchemaError {
    pub(crate) fn unknown(what: &'static str, value: &str) -> Self {
        SchemaError::Unknown {
            what,
            value: value.to_string(),
        }
    }
}

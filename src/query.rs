//! Query identifiers and fetch requests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeResult, ValidationError};

/// Opaque handle for one parsed, potentially streaming query.
///
/// Issued by the engine on a successful parse and used as the correlation
/// value for every streaming message about that query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(u32);

impl QueryId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to begin streaming results for a parsed query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Query to run, as returned by a parse.
    pub query_id: QueryId,
    /// Operation to run when the document defines several; empty selects the only one.
    #[serde(default)]
    pub operation_name: String,
    /// Variables as JSON text. Empty means no variables.
    #[serde(default)]
    pub variables: String,
}

impl FetchRequest {
    /// Request with no operation name and no variables.
    #[must_use]
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            operation_name: String::new(),
            variables: String::new(),
        }
    }

    /// Select the operation to run.
    #[must_use]
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = name.into();
        self
    }

    /// Set the variables, as JSON object text.
    #[must_use]
    pub fn variables(mut self, variables: impl Into<String>) -> Self {
        self.variables = variables.into();
        self
    }

    /// Parse the variables text into a JSON object.
    ///
    /// Empty text yields an empty object; anything that is not a JSON object is
    /// rejected.
    pub fn parsed_variables(&self) -> BridgeResult<serde_json::Map<String, serde_json::Value>> {
        if self.variables.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }

        let value: serde_json::Value = serde_json::from_str(&self.variables).map_err(|e| {
            ValidationError::InvalidVariables {
                reason: e.to_string(),
            }
        })?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(ValidationError::InvalidVariables {
                reason: format!("expected a JSON object, got {other}"),
            }
            .into()),
        }
    }
}

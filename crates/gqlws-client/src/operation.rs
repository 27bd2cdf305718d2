//! Operation payloads and the typed GraphQL operation trait.
//!
//! The engine never builds query text itself. It consumes either a
//! [`GraphqlOperation`] implementation (query text supplied by the caller or
//! a code generator) or a ready-made [`GraphqlRequestPayload`].

use serde::{Deserialize, Serialize};

use crate::error::{GraphqlError, SubscriptionError};

/// Typed GraphQL operation definition.
///
/// Implement this trait for each subscription the client drives. Identical
/// implementations always produce identical request payloads.
pub trait GraphqlOperation {
    /// Variables type.
    type Variables: Serialize + Send + Sync;

    /// GraphQL query text.
    const QUERY: &'static str;
    /// Operation name, empty when the document is anonymous.
    const OPERATION_NAME: &'static str = "";
}

/// Wire payload of a `subscribe`/`start` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlRequestPayload {
    /// Query text.
    pub query: String,
    /// Variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
    /// Optional operation name.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Protocol extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphqlRequestPayload {
    /// Create a payload from raw query text.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
            extensions: None,
        }
    }

    /// Attach variables.
    #[must_use]
    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Attach an operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Attach protocol extensions.
    #[must_use]
    pub fn with_extensions(mut self, extensions: serde_json::Value) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Build the payload for a typed operation.
    ///
    /// # Errors
    /// Returns a JSON error if the variables fail to serialize.
    pub fn from_operation<O: GraphqlOperation>(
        variables: O::Variables,
    ) -> Result<Self, SubscriptionError> {
        let variables = serde_json::to_value(variables)?;
        let mut payload = Self::new(O::QUERY);
        if !variables.is_null() {
            payload = payload.with_variables(variables);
        }
        if !O::OPERATION_NAME.is_empty() {
            payload = payload.with_operation_name(O::OPERATION_NAME);
        }
        Ok(payload)
    }
}

/// Result payload carried by a `next`/`data` message.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphqlResultPayload {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

/// GraphQL response container for decoding delivered data bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct GraphqlResponse<T> {
    /// Response data.
    #[serde(default)]
    pub data: Option<T>,
    /// GraphQL errors.
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

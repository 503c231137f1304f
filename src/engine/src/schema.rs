//! Schema references and the validator capability
//!
//! Schema document validation itself is owned by an external collaborator;
//! the engine only stores per-policy schema references and forwards requests
//! to a [`SchemaValidator`].

use serde::{Deserialize, Serialize};

use crate::request::CheckInput;

/// Reference to a schema document plus the actions it is waived for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRef {
    pub reference: String,
    #[serde(default)]
    pub ignore_when_actions: Vec<String>,
}

/// Schema references attached to a compiled resource policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_schema: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_schema: Option<SchemaRef>,
}

/// Which side of the request failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorSource {
    Principal,
    Resource,
}

/// A single schema validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
    pub source: ValidationErrorSource,
}

/// Validates request attributes against the schemas referenced by a policy.
pub trait SchemaValidator: Send + Sync {
    fn validate(
        &self,
        schemas: Option<&PolicySchemas>,
        input: &CheckInput,
    ) -> crate::error::Result<Vec<ValidationError>>;
}

/// Validator that accepts everything. Used when schema enforcement is
/// disabled or handled upstream.
#[derive(Debug, Default)]
pub struct NopValidator;

impl SchemaValidator for NopValidator {
    fn validate(
        &self,
        _schemas: Option<&PolicySchemas>,
        _input: &CheckInput,
    ) -> crate::error::Result<Vec<ValidationError>> {
        Ok(Vec::new())
    }
}

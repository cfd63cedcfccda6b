//! Model schema registry for decoding erased payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use driftsync_common::{AnyModel, Error, ModelName, MutationEvent, Result};

/// JSON type of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Int,
    Double,
    Boolean,
    /// Any JSON value, including nested objects and arrays.
    Json,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Double => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

/// A single field of a model schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelField {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl ModelField {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Shape of one model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: ModelName,
    pub fields: Vec<ModelField>,
}

impl ModelSchema {
    pub fn new(name: ModelName, fields: Vec<ModelField>) -> Self {
        Self { name, fields }
    }

    /// Check a model against this schema.
    ///
    /// Fields not declared by the schema are allowed; declared fields must
    /// carry the declared type, and required fields must be present and
    /// non-null.
    ///
    /// # Errors
    /// - Model belongs to another model type
    /// - A required field is missing
    /// - A field has the wrong JSON type
    pub fn validate(&self, model: &AnyModel) -> Result<()> {
        if model.model_name() != &self.name {
            return Err(Error::Decode(format!(
                "Expected a {} but got a {}",
                self.name,
                model.model_name()
            )));
        }

        for field in &self.fields {
            match model.field(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(Error::Decode(format!(
                        "{} {} is missing required field '{}'",
                        self.name,
                        model.id(),
                        field.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.matches(value) => {
                    return Err(Error::Decode(format!(
                        "{} {} field '{}' is not of type {:?}",
                        self.name,
                        model.id(),
                        field.name,
                        field.field_type
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Registry of known model schemas.
///
/// Models whose name is not registered are decoded without field checks.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    schemas: HashMap<ModelName, ModelSchema>,
}

impl ModelRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model schema.
    ///
    /// # Preconditions
    /// - The schema's model name must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&mut self, schema: ModelSchema) -> Result<()> {
        if self.schemas.contains_key(&schema.name) {
            return Err(Error::AlreadyExists(format!(
                "Model '{}' is already registered",
                schema.name
            )));
        }
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Look up a schema by model name.
    pub fn schema(&self, name: &ModelName) -> Option<&ModelSchema> {
        self.schemas.get(name)
    }

    /// Names of all registered models, sorted.
    pub fn models(&self) -> Vec<ModelName> {
        let mut names: Vec<ModelName> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check a model against its registered schema, if any.
    pub fn validate(&self, model: &AnyModel) -> Result<()> {
        match self.schemas.get(model.model_name()) {
            Some(schema) => schema.validate(model),
            None => Ok(()),
        }
    }

    /// Decode the payload of a mutation event.
    ///
    /// # Errors
    /// - Payload is not valid JSON or has no id
    /// - Payload id does not match the event's model id
    /// - Payload violates the registered schema
    pub fn decode(&self, event: &MutationEvent) -> Result<AnyModel> {
        let model = event.decode_model()?;
        self.validate(&model)?;
        Ok(model)
    }
}

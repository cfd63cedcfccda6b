//! Erased model records and the outbox data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::query::QueryPredicate;
use crate::types::{monotonic_timestamp, ModelId, ModelName};
use crate::{Error, Result};

/// Name of the field that carries a record's identity.
pub const ID_FIELD: &str = "id";

/// A model instance with its concrete type erased.
///
/// The record is kept as a JSON object together with the name of the model
/// it belongs to. The identity is read from the `"id"` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyModel {
    model_name: ModelName,
    id: ModelId,
    fields: Map<String, Value>,
}

impl AnyModel {
    /// Create a model from a JSON object.
    ///
    /// # Errors
    /// - `fields` is not an object
    /// - the object has no non-empty string `"id"` field
    pub fn new(model_name: ModelName, fields: Value) -> Result<Self> {
        let Value::Object(fields) = fields else {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                model_name
            )));
        };

        let id = match fields.get(ID_FIELD) {
            Some(Value::String(id)) => ModelId::new(id.clone())?,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "{} payload is missing a string \"{}\" field",
                    model_name, ID_FIELD
                )))
            }
        };

        Ok(Self {
            model_name,
            id,
            fields,
        })
    }

    /// Decode a model from its serialized JSON payload.
    pub fn from_json(model_name: ModelName, json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string()))?;
        Self::new(model_name, value).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Serialize the model fields to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }

    pub fn model_name(&self) -> &ModelName {
        &self.model_name
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    /// Get a field value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Set a field value. The identity field cannot be changed.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if name == ID_FIELD {
            return Err(Error::InvalidInput(
                "The id field of a model cannot be reassigned".to_string(),
            ));
        }
        self.fields.insert(name, value);
        Ok(())
    }
}

/// Kind of local change recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// One pending or historical local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    /// Identifier of the event record itself.
    pub id: String,
    /// Identity of the target record.
    pub model_id: ModelId,
    pub model_name: ModelName,
    /// Serialized payload of the model at the time of mutation.
    pub json: String,
    pub mutation_type: MutationType,
    /// Last known server version of the target record.
    pub version: Option<u64>,
    /// Conditional-write predicate attached by the application.
    ///
    /// Events carrying a condition are never merged with other events.
    pub condition_json: Option<String>,
    /// Set once the event has been handed to the transport.
    pub in_process: bool,
    /// FIFO ordering key of the outbox.
    pub created_at: DateTime<Utc>,
}

impl MutationEvent {
    /// Record a mutation of `model`.
    pub fn new(
        model: &AnyModel,
        mutation_type: MutationType,
        condition: Option<&QueryPredicate>,
    ) -> Result<Self> {
        let condition_json = condition.map(serde_json::to_string).transpose()?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model.id().clone(),
            model_name: model.model_name().clone(),
            json: model.to_json()?,
            mutation_type,
            version: None,
            condition_json,
            in_process: false,
            created_at: monotonic_timestamp(),
        })
    }

    /// Record a mutation of `model` that carries a known server version.
    pub fn with_version(
        model: &AnyModel,
        mutation_type: MutationType,
        version: u64,
    ) -> Result<Self> {
        let mut event = Self::new(model, mutation_type, None)?;
        event.version = Some(version);
        Ok(event)
    }

    /// Decode the payload back into a model.
    pub fn decode_model(&self) -> Result<AnyModel> {
        let model = AnyModel::from_json(self.model_name.clone(), &self.json)?;
        if model.id() != &self.model_id {
            return Err(Error::Decode(format!(
                "payload id {} does not match event model id {}",
                model.id(),
                self.model_id
            )));
        }
        Ok(model)
    }

    /// Decode the conditional-write predicate, if any.
    pub fn condition(&self) -> Result<Option<QueryPredicate>> {
        self.condition_json
            .as_deref()
            .map(|json| serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string())))
            .transpose()
    }
}

/// Last known server state of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationSyncMetadata {
    pub model_id: ModelId,
    pub model_name: ModelName,
    pub version: u64,
    pub deleted: bool,
    /// Unix milliseconds of the last remote change.
    pub last_changed_at: i64,
}

impl MutationSyncMetadata {
    /// Storage key for the metadata of one record.
    pub fn key(model_name: &ModelName, model_id: &ModelId) -> String {
        format!("{}|{}", model_name, model_id)
    }

    /// The mutation type a remote change with this metadata represents.
    pub fn mutation_type(&self) -> MutationType {
        if self.deleted {
            MutationType::Delete
        } else if self.version <= 1 {
            MutationType::Create
        } else {
            MutationType::Update
        }
    }
}

/// A remote record together with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationSync {
    pub model: AnyModel,
    pub sync_metadata: MutationSyncMetadata,
}

impl MutationSync {
    /// Build the change event that announces this remote state locally.
    pub fn to_mutation_event(&self) -> Result<MutationEvent> {
        MutationEvent::with_version(
            &self.model,
            self.sync_metadata.mutation_type(),
            self.sync_metadata.version,
        )
    }
}

/// An outbox event removed after a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: MutationEvent,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: MutationEvent, error: impl Into<String>) -> Self {
        Self {
            event,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str, title: &str) -> AnyModel {
        AnyModel::new(
            ModelName::new("Post").unwrap(),
            json!({ "id": id, "title": title }),
        )
        .unwrap()
    }

    #[test]
    fn test_any_model_requires_id() {
        let name = ModelName::new("Post").unwrap();
        assert!(AnyModel::new(name.clone(), json!({ "title": "t" })).is_err());
        assert!(AnyModel::new(name.clone(), json!({ "id": 5 })).is_err());
        assert!(AnyModel::new(name, json!(["id"])).is_err());
    }

    #[test]
    fn test_id_field_is_immutable() {
        let mut model = post("p1", "t");
        assert!(model.set_field("id", json!("p2")).is_err());
        model.set_field("title", json!("changed")).unwrap();
        assert_eq!(model.field("title"), Some(&json!("changed")));
    }

    #[test]
    fn test_mutation_event_decodes_payload() {
        let model = post("p1", "hello");
        let event = MutationEvent::new(&model, MutationType::Create, None).unwrap();

        assert_eq!(event.model_id.as_str(), "p1");
        assert!(!event.in_process);
        assert!(event.version.is_none());
        assert_eq!(event.decode_model().unwrap(), model);
    }

    #[test]
    fn test_decode_rejects_mismatched_id() {
        let mut event = MutationEvent::new(&post("p1", "t"), MutationType::Update, None).unwrap();
        event.json = post("p2", "t").to_json().unwrap();
        assert!(matches!(event.decode_model(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_condition_round_trips() {
        let condition = QueryPredicate::field("title").eq("t");
        let event =
            MutationEvent::new(&post("p1", "t"), MutationType::Update, Some(&condition)).unwrap();
        assert_eq!(event.condition().unwrap(), Some(condition));
    }

    #[test]
    fn test_metadata_mutation_type() {
        let mut metadata = MutationSyncMetadata {
            model_id: ModelId::new("p1").unwrap(),
            model_name: ModelName::new("Post").unwrap(),
            version: 1,
            deleted: false,
            last_changed_at: 0,
        };
        assert_eq!(metadata.mutation_type(), MutationType::Create);
        metadata.version = 3;
        assert_eq!(metadata.mutation_type(), MutationType::Update);
        metadata.deleted = true;
        assert_eq!(metadata.mutation_type(), MutationType::Delete);
    }

    #[test]
    fn test_mutation_event_serialization() {
        let event = MutationEvent::new(&post("p1", "t"), MutationType::Delete, None).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"mutationType\":\"delete\""));
        assert!(json.contains("\"inProcess\":false"));

        let restored: MutationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, event);
    }
}

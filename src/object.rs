// src/object.rs

use crate::types::date::ParseDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A dynamically-typed Parse record.
///
/// LiveQuery events can be decoded into any `DeserializeOwned` type; `ParseObject`
/// is the catch-all for callers that do not model their classes as structs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseObject {
    #[serde(skip_serializing_if = "Option::is_none", rename = "objectId")]
    pub object_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "createdAt"
    )]
    pub created_at: Option<ParseDate>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "updatedAt"
    )]
    pub updated_at: Option<ParseDate>,
    #[serde(rename = "className", skip_serializing_if = "Option::is_none", default)]
    pub class_name: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl ParseObject {
    pub fn new(class_name: &str) -> Self {
        ParseObject {
            class_name: Some(class_name.to_string()),
            fields: HashMap::new(),
            object_id: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn get_object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Sets a field. Values that cannot be represented as JSON are logged and skipped.
    pub fn set<T: Serialize>(&mut self, field_name: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(json_val) => {
                self.fields.insert(field_name.to_string(), json_val);
            }
            Err(e) => log::warn!("Could not set field '{}': {}", field_name, e),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, field_name: &str) -> Option<T> {
        self.fields
            .get(field_name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

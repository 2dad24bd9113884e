//! Store mutation notifications as delivered on the change stream.
//!
//! The wire shape mirrors a DynamoDB stream record:
//! `{"eventName": "MODIFY", "dynamodb": {"NewImage": {...}, "OldImage": {...}}}`.

use serde::{Deserialize, Serialize};

use crate::model::{ChangeEventType, Item};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "eventName")]
    pub event_name: ChangeEventType,
    #[serde(rename = "dynamodb")]
    pub change: StreamChange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<String>,
}

/// A delivered batch of notifications: `{"Records": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<StreamRecord>,
}

impl StreamBatch {
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }
}

impl StreamRecord {
    pub fn new(event_name: ChangeEventType, new_image: Option<Item>, old_image: Option<Item>) -> Self {
        Self {
            event_name,
            change: StreamChange { new_image, old_image, ..StreamChange::default() },
        }
    }
}

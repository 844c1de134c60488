//! The unit of data flowing along edges.
//!
//! Every node consumes and produces an ordered sequence of [`DataItem`]s.
//! The wire shape matches what workflow authors see in the editor:
//!
//! ```json
//! { "json": { "total": 3 }, "binary": { "report": { "data": "aGk=", "mimeType": "text/plain" } }, "pairedItemIndex": 0 }
//! ```

use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;

/// One item on an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
    /// The structured payload.
    #[serde(default)]
    pub json: JsonValue,
    /// Named binary attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BTreeMap<String, BinaryData>>,
    /// Index of the input item this item was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_item_index: Option<usize>,
}

impl DataItem {
    /// Creates an item carrying only json.
    #[must_use]
    pub fn new(json: JsonValue) -> Self {
        Self {
            json,
            binary: None,
            paired_item_index: None,
        }
    }

    /// An item with an empty json object.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(JsonValue::Object(serde_json::Map::new()))
    }

    /// The item emitted in place of a failed node's output when the node is
    /// set to continue on error.
    #[must_use]
    pub fn error(message: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::new(json!({
            "error": {
                "message": message.into(),
                "nodeId": node_id.into(),
            }
        }))
    }

    #[must_use]
    pub fn with_paired_item(mut self, index: usize) -> Self {
        self.paired_item_index = Some(index);
        self
    }

    #[must_use]
    pub fn with_binary(mut self, name: impl Into<String>, data: BinaryData) -> Self {
        self.binary
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), data);
        self
    }

    /// Turns trigger data into the trigger's output items.
    ///
    /// An array yields one item per element, `null` yields a single empty
    /// item, anything else is wrapped as one item.
    #[must_use]
    pub fn from_trigger(data: JsonValue) -> Vec<Self> {
        match data {
            JsonValue::Array(values) => values
                .into_iter()
                .enumerate()
                .map(|(i, v)| Self::new(v).with_paired_item(i))
                .collect(),
            JsonValue::Null => vec![Self::empty()],
            other => vec![Self::new(other)],
        }
    }

    /// Whether this item was produced by a node that failed and continued.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.json.get("error").is_some_and(JsonValue::is_object)
    }
}

impl Default for DataItem {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<JsonValue> for DataItem {
    fn from(json: JsonValue) -> Self {
        Self::new(json)
    }
}

/// The json payloads of a sequence of items.
#[must_use]
pub fn jsons(items: &[DataItem]) -> Vec<JsonValue> {
    items.iter().map(|item| item.json.clone()).collect()
}

/// A binary attachment. Bytes travel base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryData {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl BinaryData {
    #[must_use]
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
            file_name: None,
        }
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

mod base64_bytes {
    use super::{Deserialize, Deserializer, STANDARD, Serializer};
    use base64::Engine as _;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

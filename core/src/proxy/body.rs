//! Wire-shaped request body model
//!
//! Only the fields the interceptors touch are typed; everything else is
//! preserved verbatim through decode/encode via flattened maps, so an
//! untouched body re-encodes to semantically identical JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProxyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Root-level `system`: either a plain string or structured blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemField {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemField {
    /// Joined text of the field, blocks separated by newlines.
    pub fn joined_text(&self) -> String {
        match self {
            SystemField::Text(text) => text.clone(),
            SystemField::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Joined text of all text-bearing blocks.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestBody {
    pub fn decode(bytes: &Bytes) -> Result<Self, ProxyError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Bytes, ProxyError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let original = json!({
            "model": "base-v1",
            "max_tokens": 1024,
            "stream": true,
            "metadata": {"user_id": "u-1"},
            "system": [
                {"type": "text", "text": "persona", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "instructions"}
            ],
            "messages": [
                {"role": "user", "content": "hello"}
            ]
        });
        let bytes = Bytes::from(serde_json::to_vec(&original).unwrap());

        let decoded = RequestBody::decode(&bytes).unwrap();
        let encoded = decoded.encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value, original);
    }

    #[test]
    fn string_system_decodes_as_text() {
        let bytes = Bytes::from(r#"{"system": "just a string"}"#);
        let decoded = RequestBody::decode(&bytes).unwrap();
        assert_eq!(
            decoded.system,
            Some(SystemField::Text("just a string".to_string()))
        );
    }

    #[test]
    fn message_content_joined_text_skips_non_text_blocks() {
        let content: MessageContent = serde_json::from_value(json!([
            {"type": "text", "text": "a"},
            {"type": "tool_use", "id": "t1", "name": "grep", "input": {}},
            {"type": "text", "text": "b"}
        ]))
        .unwrap();
        assert_eq!(content.joined_text(), "a\nb");
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let bytes = Bytes::from("{not json");
        assert!(matches!(
            RequestBody::decode(&bytes),
            Err(ProxyError::Parse(_))
        ));
    }
}

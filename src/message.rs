//! The JSON payload carried by every delivery.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix appended to the text of a message that failed on the primary queue.
pub const RETRY_MARKER: &str = " retry";

/// Application payload: `{ "TextMessage": "...", ...other fields }`.
///
/// Only `text` is interpreted. Any other field is kept as-is and written back in
/// the order it was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "TextMessage")]
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// A message with only a text field.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: Map::new(),
        }
    }

    /// Parses a delivery body. Fails when the body is not a JSON object with a
    /// string `TextMessage`.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serializes back to JSON, `TextMessage` first. Numbers are written exactly
    /// as they were read.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Appends `suffix` to the text, leaving every other field untouched.
    pub fn mark(&mut self, suffix: &str) {
        self.text.push_str(suffix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_keeps_unknown_fields_in_order() {
        let raw = concat!(
            r#"{"Id":7,"TextMessage":"error","#,
            r#""Meta":{"source":"lab","tags":["a","b"]},"Flag":null}"#
        );
        let mut message = Message::decode(raw.as_bytes()).unwrap();
        message.mark(RETRY_MARKER);

        let encoded = String::from_utf8(message.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            concat!(
                r#"{"TextMessage":"error retry","Id":7,"#,
                r#""Meta":{"source":"lab","tags":["a","b"]},"Flag":null}"#
            )
        );
    }

    #[test]
    fn mark_keeps_number_literals() {
        let raw = concat!(
            r#"{"TextMessage":"error","Amount":1.10,"#,
            r#""Big":123456789012345678901234567890,"Exp":1e+2}"#
        );
        let mut message = Message::decode(raw.as_bytes()).unwrap();
        message.mark(RETRY_MARKER);

        let encoded = String::from_utf8(message.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            concat!(
                r#"{"TextMessage":"error retry","Amount":1.10,"#,
                r#""Big":123456789012345678901234567890,"Exp":1e+2}"#
            )
        );
    }

    #[test]
    fn decode_requires_text_field() {
        assert!(Message::decode(br#"{"Other":"x"}"#).is_err());
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"TextMessage":42}"#).is_err());
    }

    #[test]
    fn plain_message_encodes_single_field() {
        let encoded = Message::new("hello").encode().unwrap();
        assert_eq!(encoded, br#"{"TextMessage":"hello"}"#.to_vec());
    }
}

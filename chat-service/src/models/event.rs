//! Wire events streamed to the client for a chat turn.

use serde::{Deserialize, Serialize};

/// One event of a turn's event stream.
///
/// Serialized as `{"type": "token" | "end" | "error", "content": "..."}`.
/// A turn yields any number of `Token` events followed by exactly one
/// `End` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { content: String },
    End { content: String },
    Error { content: String },
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: content.into(),
        }
    }

    pub fn end(content: impl Into<String>) -> Self {
        StreamEvent::End {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        StreamEvent::Error {
            content: content.into(),
        }
    }

    /// Whether this event closes the turn.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. })
    }

    pub fn content(&self) -> &str {
        match self {
            StreamEvent::Token { content }
            | StreamEvent::End { content }
            | StreamEvent::Error { content } => content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_to_tagged_wire_format() {
        let token = serde_json::to_value(StreamEvent::token("S3 ")).unwrap();
        assert_eq!(token, json!({"type": "token", "content": "S3 "}));

        let end = serde_json::to_value(StreamEvent::end("done")).unwrap();
        assert_eq!(end, json!({"type": "end", "content": "done"}));

        let error = serde_json::to_value(StreamEvent::error("Streaming failed.")).unwrap();
        assert_eq!(error, json!({"type": "error", "content": "Streaming failed."}));
    }

    #[test]
    fn only_end_and_error_are_terminal() {
        assert!(!StreamEvent::token("x").is_terminal());
        assert!(StreamEvent::end("x").is_terminal());
        assert!(StreamEvent::error("x").is_terminal());
    }
}

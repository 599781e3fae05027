//! Streaming fragments.
//!
//! A generation round is delivered as a lazy, single-consumption sequence of
//! [`Fragment`]s: content deltas in provider-emission order followed by one
//! aggregate message.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

/// A lazy sequence of fragments. Finite, not restartable.
pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// An incremental piece of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    /// Text appended to the text block at `index`.
    Text { index: usize, text: String },

    /// Part of the tool-use block at `index`. `id` and `name` arrive on the
    /// first delta of a block; `arguments` is a partial JSON string.
    ToolUse {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
}

impl Delta {
    pub fn text(index: usize, text: impl Into<String>) -> Self {
        Self::Text {
            index,
            text: text.into(),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Text { index, .. } | Self::ToolUse { index, .. } => *index,
        }
    }
}

/// One element of a response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Fragment {
    /// Incremental content.
    Delta(Delta),

    /// The fully assembled assistant message of a generation round.
    Aggregate(Message),

    /// The tool-role message the agent loop appended after executing tools.
    ToolResults(Message),
}

impl Fragment {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate(_))
    }

    /// The message carried by aggregate and tool-result fragments.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Aggregate(m) | Self::ToolResults(m) => Some(m),
            Self::Delta(_) => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Aggregate(m) | Self::ToolResults(m) => Some(m),
            Self::Delta(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_flag() {
        assert!(Fragment::Aggregate(Message::assistant("hi")).is_aggregate());
        assert!(!Fragment::Delta(Delta::text(0, "hi")).is_aggregate());
        assert!(!Fragment::ToolResults(Message::tool_results("p", vec![])).is_aggregate());
    }

    #[test]
    fn fragment_serialization() {
        let json = serde_json::to_string(&Fragment::Delta(Delta::text(0, "Hel"))).unwrap();
        assert!(json.contains(r#""type":"delta""#));
        assert!(json.contains(r#""kind":"text""#));
        assert!(json.contains(r#""text":"Hel""#));
    }

    #[test]
    fn tool_use_delta_deserializes_without_id() {
        let json = r#"{"kind":"tool_use","index":1,"arguments":"{\"ci"}"#;
        let delta: Delta = serde_json::from_str(json).unwrap();
        match delta {
            Delta::ToolUse { index, id, arguments, .. } => {
                assert_eq!(index, 1);
                assert!(id.is_none());
                assert_eq!(arguments, "{\"ci");
            }
            other => panic!("Wrong variant: {other:?}"),
        }
    }
}

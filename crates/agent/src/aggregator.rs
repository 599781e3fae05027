//! Stream aggregation: folds a round's fragments into one assistant message.
//!
//! Text deltas are concatenated per block index. Tool-use deltas are merged
//! per index: `id` and `name` come from whichever delta carries them first,
//! argument fragments are concatenated and parsed once the round ends.
//! A provider-supplied aggregate always wins over the reconstruction.

use std::collections::BTreeMap;

use bigtalk_core::error::{Error, ProviderError, Result};
use bigtalk_core::fragment::{Delta, Fragment, FragmentStream};
use bigtalk_core::message::{ContentBlock, Message, ToolUse};
use futures::StreamExt;

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// Accumulates fragments of a single generation round.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    blocks: BTreeMap<usize, PartialBlock>,
    aggregate: Option<Message>,
    deltas: usize,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in.
    ///
    /// Fails when a delta changes the kind of a block that is already open.
    pub fn push(&mut self, fragment: &Fragment) -> Result<()> {
        match fragment {
            Fragment::Delta(delta) => self.push_delta(delta),
            Fragment::Aggregate(message) => {
                self.aggregate = Some(message.clone());
                Ok(())
            }
            // Not part of a generation round
            Fragment::ToolResults(_) => Ok(()),
        }
    }

    fn push_delta(&mut self, delta: &Delta) -> Result<()> {
        self.deltas += 1;
        let index = delta.index();

        match (self.blocks.get_mut(&index), delta) {
            (None, Delta::Text { text, .. }) => {
                self.blocks.insert(index, PartialBlock::Text(text.clone()));
            }
            (None, Delta::ToolUse { id, name, arguments, .. }) => {
                self.blocks.insert(
                    index,
                    PartialBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                );
            }
            (Some(PartialBlock::Text(buf)), Delta::Text { text, .. }) => buf.push_str(text),
            (
                Some(PartialBlock::ToolUse {
                    id: open_id,
                    name: open_name,
                    arguments: buf,
                }),
                Delta::ToolUse { id, name, arguments, .. },
            ) => {
                if open_id.is_none() {
                    *open_id = id.clone();
                }
                if open_name.is_none() {
                    *open_name = name.clone();
                }
                buf.push_str(arguments);
            }
            _ => {
                return Err(ProviderError::InvalidResponse(format!(
                    "content block {index} changed kind mid-stream"
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Whether the provider sent its own aggregate.
    pub fn has_aggregate(&self) -> bool {
        self.aggregate.is_some()
    }

    /// Number of deltas folded so far.
    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    /// Assemble an assistant message from the deltas alone.
    pub fn reconstruct(&self) -> Result<Message> {
        let mut content = Vec::with_capacity(self.blocks.len());

        for (index, block) in &self.blocks {
            match block {
                PartialBlock::Text(text) => content.push(ContentBlock::text(text.clone())),
                PartialBlock::ToolUse { id, name, arguments } => {
                    let (Some(id), Some(name)) = (id, name) else {
                        return Err(ProviderError::InvalidResponse(format!(
                            "tool use at block {index} never received an id and name"
                        ))
                        .into());
                    };
                    content.push(ContentBlock::ToolUse(ToolUse::new(
                        id.clone(),
                        name.clone(),
                        parse_arguments(name, arguments)?,
                    )));
                }
            }
        }

        Ok(Message::assistant_blocks(content))
    }

    /// The round's assistant message: the provider's aggregate if one
    /// arrived, otherwise the reconstruction.
    pub fn finish(self) -> Result<Message> {
        match self.aggregate {
            Some(message) => Ok(message),
            None => self.reconstruct(),
        }
    }
}

fn parse_arguments(tool_name: &str, raw: &str) -> Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| {
        Error::Provider(ProviderError::InvalidResponse(format!(
            "arguments for tool '{tool_name}' are not valid JSON: {e}"
        )))
    })
}

/// Drain a fragment stream and return the round's assistant message.
pub async fn aggregate(mut stream: FragmentStream) -> Result<Message> {
    let mut aggregator = StreamAggregator::new();
    while let Some(fragment) = stream.next().await {
        aggregator.push(&fragment?)?;
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> Fragment {
        Fragment::Delta(Delta::ToolUse {
            index,
            id: id.map(Into::into),
            name: name.map(Into::into),
            arguments: args.into(),
        })
    }

    #[test]
    fn text_deltas_concatenate_per_index() {
        let mut agg = StreamAggregator::new();
        for f in [
            Fragment::Delta(Delta::text(0, "Hel")),
            Fragment::Delta(Delta::text(0, "lo")),
            Fragment::Delta(Delta::text(2, "!")),
        ] {
            agg.push(&f).unwrap();
        }
        assert_eq!(agg.delta_count(), 3);
        let msg = agg.finish().unwrap();
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.text(), "Hello!");
    }

    #[test]
    fn tool_use_arguments_merge_and_parse() {
        let mut agg = StreamAggregator::new();
        agg.push(&Fragment::Delta(Delta::text(0, "Checking."))).unwrap();
        agg.push(&tool_delta(1, Some("call_1"), Some("get_weather"), "{\"ci"))
            .unwrap();
        agg.push(&tool_delta(1, None, None, "ty\": \"Tokyo\"}")).unwrap();

        let msg = agg.finish().unwrap();
        let uses = msg.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].id, "call_1");
        assert_eq!(uses[0].arguments["city"], "Tokyo");
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut agg = StreamAggregator::new();
        agg.push(&tool_delta(0, Some("a"), Some("now"), "")).unwrap();
        let msg = agg.finish().unwrap();
        assert_eq!(msg.tool_uses()[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn invalid_arguments_are_a_provider_error() {
        let mut agg = StreamAggregator::new();
        agg.push(&tool_delta(0, Some("a"), Some("now"), "{not json"))
            .unwrap();
        let err = agg.finish().unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn missing_tool_name_is_rejected() {
        let mut agg = StreamAggregator::new();
        agg.push(&tool_delta(0, Some("a"), None, "{}")).unwrap();
        assert!(agg.reconstruct().is_err());
    }

    #[test]
    fn kind_change_is_rejected() {
        let mut agg = StreamAggregator::new();
        agg.push(&Fragment::Delta(Delta::text(0, "x"))).unwrap();
        assert!(agg.push(&tool_delta(0, Some("a"), Some("t"), "")).is_err());
    }

    #[test]
    fn provider_aggregate_is_authoritative() {
        let mut agg = StreamAggregator::new();
        agg.push(&Fragment::Delta(Delta::text(0, "draft"))).unwrap();
        let provided = Message::assistant("final");
        agg.push(&Fragment::Aggregate(provided.clone())).unwrap();

        assert!(agg.has_aggregate());
        assert_eq!(agg.finish().unwrap(), provided);
    }

    #[test]
    fn no_fragments_yield_empty_message() {
        let msg = StreamAggregator::new().finish().unwrap();
        assert!(msg.content.is_empty());
        assert!(!msg.has_tool_uses());
    }

    #[tokio::test]
    async fn aggregate_drains_stream() {
        let stream: FragmentStream = futures::stream::iter(vec![
            Ok(Fragment::Delta(Delta::text(0, "a"))),
            Ok(Fragment::Delta(Delta::text(0, "b"))),
        ])
        .boxed();
        assert_eq!(aggregate(stream).await.unwrap().text(), "ab");
    }

    #[tokio::test]
    async fn aggregate_surfaces_stream_error() {
        let stream: FragmentStream = futures::stream::iter(vec![
            Ok(Fragment::Delta(Delta::text(0, "a"))),
            Err(ProviderError::StreamInterrupted("reset".into()).into()),
        ])
        .boxed();
        assert!(aggregate(stream).await.is_err());
    }
}

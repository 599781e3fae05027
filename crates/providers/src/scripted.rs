//! A deterministic provider that replays canned assistant messages.
//!
//! Each call to [`Provider::stream`] consumes the next scripted turn and
//! streams it the way a real backend would: text chunks and partial tool-use
//! arguments as deltas, followed by the assembled message as the aggregate.
//! Used for offline development and throughout the test suites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bigtalk_core::error::{Error, ProviderError};
use bigtalk_core::fragment::{Delta, Fragment, FragmentStream};
use bigtalk_core::message::{ContentBlock, Message};
use bigtalk_core::provider::{Provider, ProviderRequest};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Stream this assistant message.
    Reply(Message),

    /// Fail before the first fragment.
    Fail(ProviderError),

    /// Stream the message's deltas, then fail instead of sending the aggregate.
    FailMidStream(Message, ProviderError),
}

impl From<Message> for Turn {
    fn from(message: Message) -> Self {
        Self::Reply(message)
    }
}

pub struct ScriptedProvider {
    name: String,
    turns: Mutex<VecDeque<Turn>>,
    /// Replay the final turn forever once the script runs out.
    repeat_last: bool,
    last: Mutex<Option<Turn>>,
    requests: Mutex<Vec<ProviderRequest>>,
    chunk_chars: usize,
    latency: Option<Duration>,
    emit_aggregate: bool,
    closed: AtomicBool,
    abandoned: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, responses: Vec<Message>) -> Self {
        Self::with_turns(name, responses.into_iter().map(Turn::from).collect())
    }

    pub fn with_turns(name: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            name: name.into(),
            turns: Mutex::new(turns.into()),
            repeat_last: false,
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            chunk_chars: 8,
            latency: None,
            emit_aggregate: true,
            closed: AtomicBool::new(false),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Keep replaying the last turn after the script is exhausted.
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Split text deltas into chunks of at most `chars` characters.
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    /// Sleep before every fragment.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Leave assembling the message to the consumer.
    pub fn without_aggregate(mut self) -> Self {
        self.emit_aggregate = false;
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a consumer dropped one of this provider's streams before it ended.
    pub fn was_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> Option<Turn> {
        let next = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(turn) => {
                *last = Some(turn.clone());
                Some(turn)
            }
            None if self.repeat_last => last.clone(),
            None => None,
        }
    }
}

/// Break an assistant message into the deltas a streaming backend would send.
pub fn deltas_for(message: &Message, chunk_chars: usize) -> Vec<Delta> {
    let chunk_chars = chunk_chars.max(1);
    let mut deltas = Vec::new();

    for (index, block) in message.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                let chars: Vec<char> = text.chars().collect();
                for chunk in chars.chunks(chunk_chars) {
                    deltas.push(Delta::text(index, chunk.iter().collect::<String>()));
                }
            }
            ContentBlock::ToolUse(tool_use) => {
                let args = tool_use.arguments.to_string();
                let split = args
                    .char_indices()
                    .map(|(i, _)| i)
                    .nth(args.chars().count() / 2)
                    .unwrap_or(args.len());
                let (head, tail) = args.split_at(split);
                deltas.push(Delta::ToolUse {
                    index,
                    id: Some(tool_use.id.clone()),
                    name: Some(tool_use.name.clone()),
                    arguments: head.to_string(),
                });
                if !tail.is_empty() {
                    deltas.push(Delta::ToolUse {
                        index,
                        id: None,
                        name: None,
                        arguments: tail.to_string(),
                    });
                }
            }
            // Assistants never carry results
            ContentBlock::ToolResult(_) => {}
        }
    }

    deltas
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> Result<FragmentStream, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let (message, failure) = match self.next_turn() {
            Some(Turn::Reply(message)) => (message, None),
            Some(Turn::Fail(e)) => return Err(e),
            Some(Turn::FailMidStream(message, e)) => (message, Some(e)),
            None => {
                return Err(ProviderError::InvalidResponse(format!(
                    "{}: no scripted response left",
                    self.name
                )));
            }
        };

        let mut message = message;
        message.id = uuid::Uuid::new_v4().to_string();

        let mut fragments: Vec<Result<Fragment, ProviderError>> =
            deltas_for(&message, self.chunk_chars)
                .into_iter()
                .map(|d| Ok(Fragment::Delta(d)))
                .collect();
        match failure {
            Some(e) => fragments.push(Err(e)),
            None if self.emit_aggregate => fragments.push(Ok(Fragment::Aggregate(message))),
            None => {}
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<bigtalk_core::Result<Fragment>>(64);
        let latency = self.latency;
        let abandoned = Arc::clone(&self.abandoned);
        let name = self.name.clone();

        tokio::spawn(async move {
            for fragment in fragments {
                if let Some(latency) = latency {
                    tokio::select! {
                        _ = tokio::time::sleep(latency) => {}
                        _ = tx.closed() => {
                            abandoned.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                if tx.send(fragment.map_err(Error::from)).await.is_err() {
                    abandoned.store(true, Ordering::SeqCst);
                    return;
                }
            }
            debug!(provider = %name, "Scripted stream finished");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

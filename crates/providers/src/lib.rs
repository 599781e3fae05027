//! Provider plumbing for BigTalk.
//!
//! All providers implement the `bigtalk_core::Provider` trait. The registry
//! maps the `provider` half of a `"provider/model"` id to a lazily created
//! instance; the scripted provider replays canned turns for offline use.

pub mod registry;
pub mod scripted;

pub use registry::{ProviderFactory, ProviderRegistry, split_model_id};
pub use scripted::{ScriptedProvider, Turn};

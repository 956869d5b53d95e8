//! Handler capability contract.
//!
//! A handler implements any subset of the five stage capabilities. Which ones
//! it implements is declared once through [`HandlerMetadata::capabilities`]
//! and read at registration; the dispatcher never queries a handler for a
//! capability it did not declare.

use std::{collections::BTreeSet, fmt, ops::BitOr};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    switchyard_common::{Message, MessageKind, RequestContext, ToolSchema},
};

use crate::error::Error;

// ── Stage ───────────────────────────────────────────────────────────────────

/// One phase of message processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Output,
    Streaming,
    Retrieval,
    Tool,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Self::Input,
        Self::Output,
        Self::Streaming,
        Self::Retrieval,
        Self::Tool,
    ];

    pub fn capability(self) -> Capabilities {
        match self {
            Self::Input => Capabilities::INPUT,
            Self::Output => Capabilities::OUTPUT,
            Self::Streaming => Capabilities::STREAMING,
            Self::Retrieval => Capabilities::RETRIEVAL,
            Self::Tool => Capabilities::TOOLS,
        }
    }

    /// Stages whose faults are isolated: the failing handler is skipped and
    /// dispatch continues.
    pub fn is_isolated(self) -> bool {
        !matches!(self, Self::Tool)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Streaming => "streaming",
            Self::Retrieval => "retrieval",
            Self::Tool => "tool",
        })
    }
}

// ── Capabilities ────────────────────────────────────────────────────────────

/// Set of stage capabilities a handler implements.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const ALL: Self = Self(0b1_1111);
    pub const INPUT: Self = Self(1);
    pub const NONE: Self = Self(0);
    pub const OUTPUT: Self = Self(1 << 1);
    pub const RETRIEVAL: Self = Self(1 << 3);
    pub const STREAMING: Self = Self(1 << 2);
    pub const TOOLS: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn supports(self, stage: Stage) -> bool {
        self.contains(stage.capability())
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = Stage::ALL
            .iter()
            .filter(|s| self.supports(**s))
            .map(ToString::to_string)
            .collect();
        write!(f, "Capabilities({})", names.join("|"))
    }
}

// ── Metadata ────────────────────────────────────────────────────────────────

/// Immutable description of a handler, read once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerMetadata {
    /// Unique within a registry.
    pub name: String,
    /// Higher runs earlier in ordered stages.
    pub priority: i32,
    /// Kinds accepted by the input and retrieval stages; empty accepts all.
    pub input_kinds: BTreeSet<MessageKind>,
    /// Kinds accepted by the output and streaming stages; empty accepts all.
    pub output_kinds: BTreeSet<MessageKind>,
    pub capabilities: Capabilities,
    pub description: String,
}

impl HandlerMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            input_kinds: BTreeSet::new(),
            output_kinds: BTreeSet::new(),
            capabilities: Capabilities::NONE,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_input_kinds<I, K>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<MessageKind>,
    {
        self.input_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_output_kinds<I, K>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<MessageKind>,
    {
        self.output_kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether this handler takes part in `stage` for a message of `kind`.
    pub fn accepts(&self, stage: Stage, kind: &MessageKind) -> bool {
        if !self.capabilities.supports(stage) {
            return false;
        }
        let kinds = match stage {
            Stage::Input | Stage::Retrieval => &self.input_kinds,
            Stage::Output | Stage::Streaming => &self.output_kinds,
            Stage::Tool => return true,
        };
        kinds.is_empty() || kinds.contains(kind)
    }
}

// ── Stage results ───────────────────────────────────────────────────────────

/// Result of an input-stage handler call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputVerdict {
    /// Not handled here; offer the message to the next handler.
    #[default]
    Continue,
    /// Handled; no further handler sees the message.
    Handled,
    /// Refuse the message (e.g. missing identity). Stops the stage and
    /// rejects the turn.
    Reject(String),
}

impl From<bool> for InputVerdict {
    fn from(handled: bool) -> Self {
        if handled {
            Self::Handled
        } else {
            Self::Continue
        }
    }
}

/// Result of an output or chunk transform.
#[derive(Debug, Default)]
pub enum OutputAction {
    /// Keep the message as it is.
    #[default]
    Pass,
    /// Continue the chain with this message instead.
    Replace(Message),
    /// Stop the chain; nothing is delivered.
    Suppress,
}

/// How a dispatched stream ended, passed to [`Handler::stream_closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

/// Retrieval result produced by one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Producing handler; filled in by the dispatcher.
    #[serde(default)]
    pub handler: String,
    pub tag: String,
    pub content: Value,
}

impl Enrichment {
    pub fn new(tag: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            handler: String::new(),
            tag: tag.into(),
            content: content.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }
}

// ── Handler trait ───────────────────────────────────────────────────────────

/// A pluggable unit taking part in one or more stages.
///
/// Every capability method has a no-op default; only the capabilities
/// declared in [`HandlerMetadata::capabilities`] are ever invoked. Context is
/// always read from the message (or argument) passed in, never from ambient
/// state.
#[async_trait]
pub trait Handler: Send + Sync {
    fn metadata(&self) -> HandlerMetadata;

    /// Called before the first dispatch. Must be idempotent.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Releases handler-held resources. Must be idempotent.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// May attach a new context to `message` before returning.
    async fn handle_input(&self, _message: &mut Message) -> Result<InputVerdict> {
        Ok(InputVerdict::Continue)
    }

    async fn transform_output(&self, _message: &Message) -> Result<OutputAction> {
        Ok(OutputAction::Pass)
    }

    /// Per-chunk transform. The chunk already carries the stream's context.
    async fn transform_chunk(&self, _chunk: &Message) -> Result<OutputAction> {
        Ok(OutputAction::Pass)
    }

    /// Stream cleanup path; called at most once per dispatched stream.
    fn stream_closed(&self, _end: StreamEnd) {}

    /// Must not mutate shared state.
    async fn retrieve(&self, _query: &Message) -> Result<Option<Enrichment>> {
        Ok(None)
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    async fn execute_tool(
        &self,
        name: &str,
        _arguments: Value,
        _context: Option<&RequestContext>,
    ) -> Result<Value> {
        Err(Error::unknown_tool(name).into())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_combine() {
        let caps = Capabilities::INPUT | Capabilities::TOOLS;
        assert!(caps.supports(Stage::Input));
        assert!(caps.supports(Stage::Tool));
        assert!(!caps.supports(Stage::Output));
        assert!(Capabilities::ALL.contains(caps));
        assert!(Capabilities::NONE.is_empty());
        assert_eq!(format!("{caps:?}"), "Capabilities(input|tool)");
    }

    #[test]
    fn empty_kind_set_accepts_all() {
        let meta = HandlerMetadata::new("h").with_capabilities(Capabilities::ALL);
        assert!(meta.accepts(Stage::Input, &MessageKind::text()));
        assert!(meta.accepts(Stage::Output, &MessageKind::new("webhook")));
    }

    #[test]
    fn kind_sets_are_per_direction() {
        let meta = HandlerMetadata::new("h")
            .with_capabilities(Capabilities::ALL)
            .with_input_kinds(["text"])
            .with_output_kinds(["action"]);
        assert!(meta.accepts(Stage::Input, &MessageKind::text()));
        assert!(meta.accepts(Stage::Retrieval, &MessageKind::text()));
        assert!(!meta.accepts(Stage::Input, &MessageKind::new("action")));
        assert!(meta.accepts(Stage::Output, &MessageKind::new("action")));
        assert!(!meta.accepts(Stage::Streaming, &MessageKind::text()));
        assert!(meta.accepts(Stage::Tool, &MessageKind::new("anything")));
    }

    #[test]
    fn undeclared_capability_is_not_accepted() {
        let meta = HandlerMetadata::new("h").with_capabilities(Capabilities::OUTPUT);
        assert!(!meta.accepts(Stage::Input, &MessageKind::text()));
    }

    #[test]
    fn bool_maps_to_verdict() {
        assert_eq!(InputVerdict::from(true), InputVerdict::Handled);
        assert_eq!(InputVerdict::from(false), InputVerdict::Continue);
    }

    #[test]
    fn empty_enrichment() {
        assert!(Enrichment::new("t", Value::Null).is_empty());
        assert!(Enrichment::new("t", "").is_empty());
        assert!(!Enrichment::new("t", 0).is_empty());
        assert!(!Enrichment::new("t", serde_json::json!({"k": 1})).is_empty());
    }
}

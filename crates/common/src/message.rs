//! The unit of conversation passed between handlers.

use std::{
    collections::BTreeMap,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
};

use {
    chrono::{DateTime, Utc},
    futures::{Stream, StreamExt, stream},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::{
    context::RequestContext,
    tools::{ToolCall, ToolCallRecord, ToolOutcome},
};

/// Finite, single-consumer sequence of message fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

// ── MessageKind ─────────────────────────────────────────────────────────────

/// Semantic type tag used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(String);

impl MessageKind {
    pub const ACTION: &'static str = "action";
    pub const ERROR: &'static str = "error";
    pub const STREAM: &'static str = "stream";
    pub const STREAM_CHUNK: &'static str = "stream_chunk";
    pub const TEXT: &'static str = "text";
    pub const WEBHOOK: &'static str = "webhook";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn text() -> Self {
        Self::new(Self::TEXT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for MessageKind {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MessageKind {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ── Message ─────────────────────────────────────────────────────────────────

/// One request or response fragment.
///
/// A message carrying a stream treats `payload` as a placeholder; consumers
/// drain the stream instead. Because the stream can only be consumed once,
/// `Message` is not `Clone`; use [`Message::fork`] to copy everything else.
#[derive(Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<Arc<RequestContext>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_trace: Vec<ToolCallRecord>,
    #[serde(skip)]
    stream: StreamSlot,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: impl Into<MessageKind>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            attributes: BTreeMap::new(),
            origin: String::new(),
            context: None,
            tool_trace: Vec::new(),
            stream: StreamSlot::default(),
            created_at: Utc::now(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::TEXT, Value::String(content.into()))
    }

    /// A single stream fragment.
    pub fn chunk(payload: impl Into<Value>) -> Self {
        Self::new(MessageKind::STREAM_CHUNK, payload)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageKind::ERROR, Value::String(text.into()))
    }

    /// A streaming response: `stream` yields the fragments, the payload is a
    /// placeholder.
    pub fn streaming(stream: ChunkStream) -> Self {
        let mut message = Self::new(MessageKind::STREAM, Value::Null);
        message.set_stream(stream);
        message
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<Arc<RequestContext>>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_deref()
    }

    /// Shared handle to the attached context.
    pub fn context_handle(&self) -> Option<Arc<RequestContext>> {
        self.context.clone()
    }

    /// Replace the attached context. The previous context is left untouched.
    pub fn attach_context(&mut self, context: impl Into<Arc<RequestContext>>) {
        self.context = Some(context.into());
    }

    pub fn set_context_handle(&mut self, context: Option<Arc<RequestContext>>) {
        self.context = context;
    }

    pub fn payload_text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    pub fn tool_trace(&self) -> &[ToolCallRecord] {
        &self.tool_trace
    }

    /// Append a tool invocation to the trace. Returns the record id.
    pub fn record_tool_call(&mut self, call: &ToolCall, outcome: ToolOutcome) -> String {
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", self.tool_trace.len() + 1));
        self.tool_trace.push(ToolCallRecord {
            id: id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            outcome,
            at: Utc::now(),
        });
        id
    }

    /// Append records produced elsewhere, e.g. on the request of a turn.
    pub fn extend_tool_trace(&mut self, records: impl IntoIterator<Item = ToolCallRecord>) {
        self.tool_trace.extend(records);
    }

    pub fn last_tool_call(&self) -> Option<&ToolCallRecord> {
        self.tool_trace.last()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_set()
    }

    /// Detach the stream; afterwards the message is a plain head message.
    pub fn take_stream(&mut self) -> Option<ChunkStream> {
        self.stream.slot().take()
    }

    pub fn set_stream(&mut self, stream: ChunkStream) {
        *self.stream.slot() = Some(stream);
    }

    /// Copy of every field except the stream.
    pub fn fork(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            attributes: self.attributes.clone(),
            origin: self.origin.clone(),
            context: self.context.clone(),
            tool_trace: self.tool_trace.clone(),
            stream: StreamSlot::default(),
            created_at: self.created_at,
        }
    }

    /// New message derived from this one: same context and attributes,
    /// different kind and payload.
    pub fn derive(&self, kind: impl Into<MessageKind>, payload: impl Into<Value>) -> Self {
        let mut message = Self::new(kind, payload);
        message.attributes = self.attributes.clone();
        message.context = self.context.clone();
        message
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("attributes", &self.attributes)
            .field("origin", &self.origin)
            .field("context", &self.context)
            .field("tool_trace", &self.tool_trace.len())
            .field("streaming", &self.stream.is_set())
            .finish()
    }
}

/// Holds the stream behind a mutex so `&Message` stays `Send` across
/// `.await` points even though the stream itself is not `Sync`.
#[derive(Default)]
struct StreamSlot(Mutex<Option<ChunkStream>>);

impl StreamSlot {
    fn slot(&mut self) -> &mut Option<ChunkStream> {
        self.0.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    fn is_set(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Wrap a finite sequence of fragments into a [`ChunkStream`].
///
/// Values that are not messages become `stream_chunk` messages.
pub fn chunk_stream_from_iter<I, T>(items: I) -> ChunkStream
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Into<ChunkItem>,
{
    Box::pin(stream::iter(items.into_iter().map(|item| item.into().into_message())))
}

/// Wrap any stream of fragments into a [`ChunkStream`].
pub fn chunk_stream<S, T>(source: S) -> ChunkStream
where
    S: Stream<Item = T> + Send + 'static,
    T: Into<ChunkItem>,
{
    Box::pin(source.map(|item| item.into().into_message()))
}

/// Either an already-built message or a raw fragment payload.
pub enum ChunkItem {
    Message(Message),
    Raw(Value),
}

impl ChunkItem {
    fn into_message(self) -> Message {
        match self {
            Self::Message(m) => m,
            Self::Raw(v) => Message::chunk(v),
        }
    }
}

impl From<Message> for ChunkItem {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Value> for ChunkItem {
    fn from(value: Value) -> Self {
        Self::Raw(value)
    }
}

impl From<&str> for ChunkItem {
    fn from(value: &str) -> Self {
        Self::Raw(Value::String(value.to_string()))
    }
}

impl From<String> for ChunkItem {
    fn from(value: String) -> Self {
        Self::Raw(Value::String(value))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn kind_compares_with_str() {
        let msg = Message::text("hi");
        assert_eq!(msg.kind, MessageKind::TEXT);
        assert_eq!(msg.payload_text(), Some("hi"));
    }

    #[test]
    fn tool_calls_get_sequential_ids() {
        let mut msg = Message::text("hi");
        let first = msg.record_tool_call(
            &ToolCall::new("calc", json!({"expr": "1+1"})),
            ToolOutcome::Success { result: json!(2) },
        );
        let second = msg.record_tool_call(
            &ToolCall::new("calc", json!({})),
            ToolOutcome::Failed {
                error: "bad".into(),
            },
        );
        let third = msg.record_tool_call(
            &ToolCall::new("calc", json!({})).with_id("abc"),
            ToolOutcome::TimedOut { after_ms: 5 },
        );
        assert_eq!((first.as_str(), second.as_str(), third.as_str()), ("call_1", "call_2", "abc"));
        assert_eq!(msg.tool_trace().len(), 3);
        assert_eq!(msg.last_tool_call().unwrap().id, "abc");
    }

    #[test]
    fn fork_shares_context_and_drops_stream() {
        let ctx = Arc::new(RequestContext::new("u-1"));
        let msg = Message::streaming(chunk_stream_from_iter(["a", "b"]))
            .with_context(Arc::clone(&ctx))
            .with_attribute("chat_id", 7);
        let copy = msg.fork();
        assert!(msg.is_streaming());
        assert!(!copy.is_streaming());
        assert!(Arc::ptr_eq(&copy.context_handle().unwrap(), &ctx));
        assert_eq!(copy.attributes["chat_id"], json!(7));
    }

    #[test]
    fn derive_keeps_context() {
        let msg = Message::text("q").with_context(RequestContext::new("u-1"));
        let reply = msg.derive(MessageKind::TEXT, "a");
        assert_eq!(reply.context().unwrap().user_id(), "u-1");
        assert!(reply.tool_trace().is_empty());
    }

    #[tokio::test]
    async fn raw_fragments_become_chunks() {
        let mut stream = chunk_stream_from_iter(vec![
            ChunkItem::from("a"),
            ChunkItem::from(Message::text("b")),
        ]);
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.kind, MessageKind::STREAM_CHUNK);
        assert_eq!(second.kind, MessageKind::TEXT);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn serialization_skips_stream() {
        let msg = Message::streaming(chunk_stream_from_iter(["x"]));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], json!("stream"));
        let back: Message = serde_json::from_value(json).unwrap();
        assert!(!back.is_streaming());
    }
}

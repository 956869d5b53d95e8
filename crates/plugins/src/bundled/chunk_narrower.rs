//! `chunk-narrower` handler: strips context attributes from stream chunks,
//! keeping only the identity fields.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait};

use switchyard_common::Message;

use crate::handler::{Capabilities, Handler, HandlerMetadata, OutputAction};

/// Runs last in the streaming stage.
#[derive(Debug, Default)]
pub struct ChunkNarrower;

impl ChunkNarrower {
    pub const NAME: &'static str = "chunk-narrower";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ChunkNarrower {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(Self::NAME)
            .with_priority(i32::MIN)
            .with_capabilities(Capabilities::STREAMING)
            .with_description("narrows chunk contexts to user and session")
    }

    async fn transform_chunk(&self, chunk: &Message) -> Result<OutputAction> {
        let Some(context) = chunk.context() else {
            return Ok(OutputAction::Pass);
        };
        if context.attributes().is_empty() {
            return Ok(OutputAction::Pass);
        }
        let mut narrowed = chunk.fork();
        narrowed.set_context_handle(Some(Arc::new(context.narrowed())));
        Ok(OutputAction::Replace(narrowed))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {serde_json::json, switchyard_common::RequestContext};

    use super::*;

    #[tokio::test]
    async fn drops_attributes_keeps_identity() {
        let ctx = RequestContext::new("u-1")
            .with_session("s-1")
            .with_attribute("chat_id", 99);
        let chunk = Message::chunk("x").with_context(ctx);

        let OutputAction::Replace(out) = ChunkNarrower::new().transform_chunk(&chunk).await.unwrap() else {
            panic!("expected a replacement");
        };
        let narrowed = out.context().unwrap();
        assert_eq!(narrowed.user_id(), "u-1");
        assert_eq!(narrowed.session_id(), Some("s-1"));
        assert!(narrowed.attributes().is_empty());
        assert_eq!(out.payload, json!("x"));
    }

    #[tokio::test]
    async fn passes_bare_chunks() {
        let chunk = Message::chunk("x").with_context(RequestContext::new("u-1"));
        let action = ChunkNarrower::new().transform_chunk(&chunk).await.unwrap();
        assert!(matches!(action, OutputAction::Pass));
        let action = ChunkNarrower::new()
            .transform_chunk(&Message::chunk("y"))
            .await
            .unwrap();
        assert!(matches!(action, OutputAction::Pass));
    }
}

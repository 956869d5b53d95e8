//! `context-guard` handler: rejects inbound messages that carry no usable
//! request context before any other input handler sees them.

use {anyhow::Result, async_trait::async_trait, tracing::warn};

use switchyard_common::Message;

use crate::handler::{Capabilities, Handler, HandlerMetadata, InputVerdict};

/// Runs first in the input stage and rejects the turn when the message has
/// no context or the context has no user id.
#[derive(Debug, Default)]
pub struct ContextGuard;

impl ContextGuard {
    pub const NAME: &'static str = "context-guard";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ContextGuard {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(Self::NAME)
            .with_priority(i32::MAX)
            .with_capabilities(Capabilities::INPUT)
            .with_description("rejects messages without a resolved user identity")
    }

    async fn handle_input(&self, message: &mut Message) -> Result<InputVerdict> {
        let Some(context) = message.context() else {
            warn!(kind = %message.kind, origin = %message.origin, "message has no context, rejecting");
            return Ok(InputVerdict::Reject("message has no request context".into()));
        };
        if !context.has_identity() {
            warn!(kind = %message.kind, origin = %message.origin, "context missing user id, rejecting");
            return Ok(InputVerdict::Reject("request context has no user id".into()));
        }
        Ok(InputVerdict::Continue)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use switchyard_common::RequestContext;

    use super::*;

    #[tokio::test]
    async fn rejects_missing_context() {
        let verdict = ContextGuard::new()
            .handle_input(&mut Message::text("hi"))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            InputVerdict::Reject("message has no request context".into())
        );
    }

    #[tokio::test]
    async fn rejects_blank_user() {
        let mut msg = Message::text("hi").with_context(RequestContext::new("  "));
        let verdict = ContextGuard::new().handle_input(&mut msg).await.unwrap();
        assert!(matches!(verdict, InputVerdict::Reject(_)));
    }

    #[tokio::test]
    async fn passes_identified_messages() {
        let mut msg = Message::text("hi").with_context(RequestContext::new("u-1"));
        let verdict = ContextGuard::new().handle_input(&mut msg).await.unwrap();
        assert_eq!(verdict, InputVerdict::Continue);
    }

    #[test]
    fn runs_before_everything() {
        let meta = ContextGuard::new().metadata();
        assert_eq!(meta.name, "context-guard");
        assert_eq!(meta.priority, i32::MAX);
    }
}

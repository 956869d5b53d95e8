//! Per-turn state machine driving the dispatcher through the stages in order.
//!
//! ```text
//! Created → InputDispatched → {Rejected | Enriched} → ToolLoop* → OutputDispatched → {Delivered | Suppressed}
//! ```

use std::{fmt, time::Duration};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    switchyard_common::{Message, MessageKind, RequestContext, ToolCall},
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    dispatch::{Dispatcher, InputOutcome, OutputOutcome},
    error::{Error, Result},
    retrieval::RetrievalReport,
    stream::StreamDispatch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Created,
    InputDispatched,
    Rejected,
    Enriched,
    ToolLoop,
    OutputDispatched,
    Delivered,
    Suppressed,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Created, InputDispatched)
                | (InputDispatched, Rejected | Enriched)
                | (Enriched | ToolLoop, ToolLoop | OutputDispatched)
                | (OutputDispatched, Delivered | Suppressed)
        )
    }

    /// `Delivered` ends the turn; `Rejected` and `Suppressed` end it without
    /// delivery.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Delivered | Self::Suppressed)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::InputDispatched => "input_dispatched",
            Self::Rejected => "rejected",
            Self::Enriched => "enriched",
            Self::ToolLoop => "tool_loop",
            Self::OutputDispatched => "output_dispatched",
            Self::Delivered => "delivered",
            Self::Suppressed => "suppressed",
        })
    }
}

/// One conversational turn. Owns the inbound message; the context attached
/// to it during the input stage is carried into every later stage.
pub struct Turn {
    id: Uuid,
    dispatcher: Dispatcher,
    request: Message,
    state: TurnState,
    input: Option<InputOutcome>,
    retrieval: RetrievalReport,
}

impl Turn {
    pub fn new(dispatcher: Dispatcher, request: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            dispatcher,
            request,
            state: TurnState::Created,
            input: None,
            retrieval: RetrievalReport::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn context(&self) -> Option<&RequestContext> {
        self.request.context()
    }

    pub fn input_outcome(&self) -> Option<&InputOutcome> {
        self.input.as_ref()
    }

    pub fn retrieval(&self) -> &RetrievalReport {
        &self.retrieval
    }

    fn advance(&mut self, next: TurnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(turn = %self.id, from = %self.state, to = %next, "turn transition");
        self.state = next;
        Ok(())
    }

    /// Run the input stage. A rejection ends the turn.
    pub async fn dispatch_input(&mut self) -> Result<InputOutcome> {
        self.advance(TurnState::InputDispatched)?;
        let outcome = self.dispatcher.dispatch_input(&mut self.request).await;
        if let InputOutcome::Rejected { by, reason } = &outcome {
            info!(turn = %self.id, handler = %by, reason = %reason, "turn rejected");
            self.advance(TurnState::Rejected)?;
        }
        self.input = Some(outcome.clone());
        Ok(outcome)
    }

    /// Run the retrieval stage against the request.
    pub async fn enrich(&mut self) -> Result<&RetrievalReport> {
        self.advance(TurnState::Enriched)?;
        self.retrieval = self.dispatcher.dispatch_retrieval(&self.request).await;
        Ok(&self.retrieval)
    }

    /// Invoke a tool on behalf of the turn. May be repeated. The tool's own
    /// error is returned as is; the turn stays in the tool loop.
    pub async fn call_tool(&mut self, call: ToolCall, deadline: Option<Duration>) -> Result<Value> {
        self.advance(TurnState::ToolLoop)?;
        self.dispatcher
            .dispatch_tool(&mut self.request, call, deadline)
            .await
    }

    /// A response derived from the request, carrying its context.
    pub fn respond_with(&self, kind: impl Into<MessageKind>, payload: impl Into<Value>) -> Message {
        self.prepare(self.request.derive(kind, payload))
    }

    /// Run the output stage and finish the turn.
    pub async fn deliver(&mut self, response: Message) -> Result<OutputOutcome> {
        self.advance(TurnState::OutputDispatched)?;
        let response = self.prepare(response);
        let outcome = self.dispatcher.dispatch_output(response).await;
        self.advance(if outcome.is_suppressed() {
            TurnState::Suppressed
        } else {
            TurnState::Delivered
        })?;
        Ok(outcome)
    }

    /// Hand a streamed response to the streaming stage. The turn is
    /// delivered once the stream is handed over.
    pub fn deliver_stream(&mut self, response: Message) -> Result<StreamDispatch> {
        self.advance(TurnState::OutputDispatched)?;
        let stream = self.dispatcher.dispatch_stream(self.prepare(response));
        self.advance(TurnState::Delivered)?;
        Ok(stream)
    }

    /// Fill in the request's context and tool trace. A response that brings
    /// its own context keeps it; a different identity is only logged.
    fn prepare(&self, mut response: Message) -> Message {
        if response.context().is_none() {
            response.set_context_handle(self.request.context_handle());
        } else if self.foreign_identity(&response) {
            warn!(
                turn = %self.id,
                "response context identity differs from the request, delivering as is"
            );
        }
        if response.tool_trace().is_empty() {
            response.extend_tool_trace(self.request.tool_trace().iter().cloned());
        }
        response
    }

    fn foreign_identity(&self, response: &Message) -> bool {
        match (self.request.context(), response.context()) {
            (Some(request), Some(response)) => !request.same_identity(response),
            _ => false,
        }
    }
}

impl fmt::Debug for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Turn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("request", &self.request)
            .finish()
    }
}

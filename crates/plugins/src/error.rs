use std::time::Duration;

use thiserror::Error;

use crate::{handler::Stage, turn::TurnState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// Raised by a handler that needs an identity the message does not carry.
    /// Blocks only that handler's processing of the message.
    #[error("handler `{handler}` needs a request context: {reason}")]
    ContextMissing { handler: String, reason: String },

    #[error("a different handler is already registered as `{name}`")]
    DuplicateHandler { name: String },

    #[error("invalid metadata for handler `{name}`: {reason}")]
    InvalidMetadata { name: String, reason: String },

    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },

    #[error("tool `{name}` timed out after {}ms", timeout.as_millis())]
    ToolTimeout { name: String, timeout: Duration },

    #[error("handler `{handler}` failed during {stage}: {source}")]
    HandlerFault {
        handler: String,
        stage: Stage,
        #[source]
        source: BoxError,
    },

    #[error("setup of handler `{name}` failed: {source}")]
    Setup {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("turn cannot move from {from} to {to}")]
    InvalidTransition { from: TurnState, to: TurnState },
}

impl Error {
    #[must_use]
    pub fn context_missing(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContextMissing {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_metadata(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool { name: name.into() }
    }

    #[must_use]
    pub fn handler_fault(handler: impl Into<String>, stage: Stage, source: anyhow::Error) -> Self {
        Self::HandlerFault {
            handler: handler.into(),
            stage,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn setup(name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Setup {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Classify an error returned by a handler call: engine errors pass
    /// through, anything else becomes a [`Error::HandlerFault`].
    pub fn from_handler(handler: &str, stage: Stage, error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(engine) => engine,
            Err(other) => Self::handler_fault(handler, stage, other),
        }
    }

    /// True for [`Error::ContextMissing`], including when wrapped in `anyhow`.
    pub fn is_context_missing(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<Error>(),
            Some(Error::ContextMissing { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Stage algorithms: input (short-circuit), output (sequential transform
//! chain) and tool (first-registered provider). Retrieval and streaming live
//! in their own modules.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    switchyard_common::{Message, ToolCall, ToolOutcome, ToolSchema},
    switchyard_config::DispatchConfig,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    handler::{InputVerdict, OutputAction, Stage},
    registry::{HandlerEntry, Registry},
    stats::CircuitBreaker,
};

#[cfg(feature = "metrics")]
use crate::metrics;

/// Result of the input stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    Handled { by: String },
    Rejected { by: String, reason: String },
    Unhandled,
}

impl InputOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Result of the output stage.
#[derive(Debug)]
pub enum OutputOutcome {
    Delivered(Message),
    /// A handler asked for nothing to be delivered.
    Suppressed { by: String },
}

impl OutputOutcome {
    pub fn delivered(self) -> Option<Message> {
        match self {
            Self::Delivered(m) => Some(m),
            Self::Suppressed { .. } => None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed { .. })
    }
}

/// Routes messages through the registry's handlers. Cheap to clone; one
/// dispatcher is shared by all concurrent turns.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: Arc<DispatchConfig>,
    breaker: CircuitBreaker,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatchConfig) -> Self {
        let breaker = CircuitBreaker::from_config(&config.circuit_breaker);
        Self {
            registry,
            config: Arc::new(config),
            breaker,
        }
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Tool schemas to hand to the model.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry.tool_schemas()
    }

    pub(crate) fn is_skipped(&self, entry: &HandlerEntry) -> bool {
        self.breaker.is_open(entry.name(), entry.stats())
    }

    /// Record a handler error in an isolated stage. A declined message
    /// (`ContextMissing`) is not counted as a fault.
    pub(crate) fn record_fault(
        &self,
        entry: &HandlerEntry,
        stage: Stage,
        error: &anyhow::Error,
        latency: Duration,
    ) {
        if Error::is_context_missing(error) {
            entry.stats().record_success(latency);
            debug!(handler = entry.name(), stage = %stage, error = %error, "handler declined message");
            return;
        }
        entry.stats().record_failure(latency);
        warn!(handler = entry.name(), stage = %stage, error = %error, "handler failed, skipping");
        #[cfg(feature = "metrics")]
        metrics::handler_fault(entry.name(), stage);
    }

    /// Input stage: offer the message to each handler in order until one
    /// handles or rejects it. Faulting handlers are skipped; a fault also
    /// discards any context the handler attached before failing.
    pub async fn dispatch_input(&self, message: &mut Message) -> InputOutcome {
        let handlers = self.registry.handlers_for(Stage::Input, &message.kind);
        debug!(stage = %Stage::Input, kind = %message.kind, count = handlers.len(), "dispatching");

        for entry in handlers {
            if self.is_skipped(&entry) {
                continue;
            }
            let context_before = message.context_handle();
            let start = Instant::now();
            let result = entry.handler().handle_input(message).await;
            let latency = start.elapsed();
            #[cfg(feature = "metrics")]
            metrics::handler_call(entry.name(), Stage::Input, latency);

            match result {
                Ok(InputVerdict::Continue) => entry.stats().record_success(latency),
                Ok(InputVerdict::Handled) => {
                    entry.stats().record_success(latency);
                    debug!(handler = entry.name(), "input handled");
                    return InputOutcome::Handled {
                        by: entry.name().to_string(),
                    };
                },
                Ok(InputVerdict::Reject(reason)) => {
                    entry.stats().record_success(latency);
                    info!(handler = entry.name(), reason = %reason, "input rejected");
                    return InputOutcome::Rejected {
                        by: entry.name().to_string(),
                        reason,
                    };
                },
                Err(e) => {
                    message.set_context_handle(context_before);
                    self.record_fault(&entry, Stage::Input, &e, latency);
                },
            }
        }
        InputOutcome::Unhandled
    }

    /// Output stage: thread the message through each handler's transform.
    ///
    /// A suppression stops the chain and nothing is delivered. A faulting
    /// handler acts as the identity transform. On a streaming message the
    /// chain runs on the head and the stream is reattached afterwards.
    pub async fn dispatch_output(&self, mut message: Message) -> OutputOutcome {
        let stream = message.take_stream();
        let handlers = self.registry.handlers_for(Stage::Output, &message.kind);
        debug!(stage = %Stage::Output, kind = %message.kind, count = handlers.len(), "dispatching");

        let mut current = message;
        for entry in handlers {
            if self.is_skipped(&entry) {
                continue;
            }
            let start = Instant::now();
            let result = entry.handler().transform_output(&current).await;
            let latency = start.elapsed();
            #[cfg(feature = "metrics")]
            metrics::handler_call(entry.name(), Stage::Output, latency);

            match result {
                Ok(OutputAction::Pass) => entry.stats().record_success(latency),
                Ok(OutputAction::Replace(mut next)) => {
                    entry.stats().record_success(latency);
                    if next.context().is_none() {
                        next.set_context_handle(current.context_handle());
                    }
                    current = next;
                },
                Ok(OutputAction::Suppress) => {
                    entry.stats().record_success(latency);
                    info!(handler = entry.name(), "output suppressed");
                    return OutputOutcome::Suppressed {
                        by: entry.name().to_string(),
                    };
                },
                Err(e) => self.record_fault(&entry, Stage::Output, &e, latency),
            }
        }

        if let Some(stream) = stream
            && !current.is_streaming()
        {
            current.set_stream(stream);
        }
        OutputOutcome::Delivered(current)
    }

    /// Tool stage: invoke the first-registered provider of `call.name`.
    ///
    /// Errors are not isolated: the provider's error, a timeout, or an
    /// unknown tool is returned to the caller. Every invocation is appended
    /// to the message's tool trace. `deadline` defaults to the configured
    /// tool timeout.
    pub async fn dispatch_tool(
        &self,
        message: &mut Message,
        call: ToolCall,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let Some(entry) = self.registry.tool_provider(&call.name) else {
            warn!(tool = %call.name, "no handler provides tool");
            return Err(Error::unknown_tool(&call.name));
        };
        let deadline = deadline.unwrap_or_else(|| self.config.tool_timeout());
        let context = message.context_handle();
        debug!(tool = %call.name, handler = entry.name(), "executing tool");

        let start = Instant::now();
        let result = tokio::time::timeout(
            deadline,
            entry
                .handler()
                .execute_tool(&call.name, call.arguments.clone(), context.as_deref()),
        )
        .await;
        let latency = start.elapsed();
        #[cfg(feature = "metrics")]
        metrics::tool_call(&call.name, latency, !matches!(result, Ok(Ok(_))));

        match result {
            Ok(Ok(value)) => {
                entry.stats().record_success(latency);
                message.record_tool_call(&call, ToolOutcome::Success {
                    result: value.clone(),
                });
                Ok(value)
            },
            Ok(Err(e)) => {
                entry.stats().record_failure(latency);
                let err = Error::from_handler(entry.name(), Stage::Tool, e);
                warn!(tool = %call.name, handler = entry.name(), error = %err, "tool failed");
                message.record_tool_call(&call, ToolOutcome::Failed {
                    error: err.to_string(),
                });
                Err(err)
            },
            Err(_) => {
                entry.stats().record_failure(latency);
                warn!(
                    tool = %call.name,
                    handler = entry.name(),
                    timeout_ms = deadline.as_millis(),
                    "tool timed out"
                );
                message.record_tool_call(&call, ToolOutcome::TimedOut {
                    after_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                });
                Err(Error::ToolTimeout {
                    name: call.name,
                    timeout: deadline,
                })
            },
        }
    }
}

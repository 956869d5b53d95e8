//! Streaming stage.
//!
//! The engine stamps the origin message's context onto every chunk before
//! any handler sees it, then runs the chunk through the streaming handlers in
//! order. When the origin has no context, a chunk keeps the one it carries.
//! Chunks are delivered in source order. Cancelling (or dropping) the
//! dispatched stream stops pulling from the source and notifies each
//! streaming handler through
//! [`Handler::stream_closed`](crate::Handler::stream_closed) exactly once,
//! even if the stream was never polled. Every handler with the streaming
//! capability is notified, whether or not its output kinds matched a chunk.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use {
    futures::{Stream, StreamExt, stream},
    switchyard_common::{ChunkStream, Message, RequestContext},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    dispatch::Dispatcher,
    handler::{OutputAction, Stage, StreamEnd},
    registry::HandlerEntry,
};

#[cfg(feature = "metrics")]
use crate::metrics;

/// Transformed chunk stream returned by [`Dispatcher::dispatch_stream`].
pub struct StreamDispatch {
    chunks: ChunkStream,
    token: CancellationToken,
    context: Option<Arc<RequestContext>>,
}

impl StreamDispatch {
    /// Stop at the next chunk boundary. No further chunks are pulled from the
    /// source.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Context stamped on every chunk. `None` leaves chunk contexts as the
    /// source produced them.
    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_deref()
    }

    pub fn into_chunk_stream(self) -> ChunkStream {
        self.chunks
    }
}

impl Stream for StreamDispatch {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.chunks.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for StreamDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDispatch")
            .field("cancelled", &self.token.is_cancelled())
            .field("context", &self.context)
            .finish()
    }
}

/// Notifies the streaming handlers once, whichever way the stream ends.
struct CloseGuard {
    handlers: Vec<Arc<HandlerEntry>>,
    closed: bool,
}

impl CloseGuard {
    fn close(&mut self, end: StreamEnd) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(end = ?end, handlers = self.handlers.len(), "stream closed");
        for entry in &self.handlers {
            entry.handler().stream_closed(end);
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.close(StreamEnd::Cancelled);
    }
}

fn same_identity(a: Option<&RequestContext>, b: Option<&RequestContext>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_identity(b),
        (None, None) => true,
        _ => false,
    }
}

impl Dispatcher {
    /// Streaming stage with a fresh cancellation token.
    pub fn dispatch_stream(&self, message: Message) -> StreamDispatch {
        self.dispatch_stream_with_cancel(message, CancellationToken::new())
    }

    /// Streaming stage. A message without a stream is treated as a
    /// single-chunk stream. The handler set is fixed when this is called.
    pub fn dispatch_stream_with_cancel(
        &self,
        mut message: Message,
        token: CancellationToken,
    ) -> StreamDispatch {
        let origin = message.context_handle();
        let mut source: ChunkStream = match message.take_stream() {
            Some(stream) => stream,
            None => Box::pin(stream::once(async move { message })),
        };
        let handlers: Vec<Arc<HandlerEntry>> = self
            .registry()
            .snapshot()
            .entries()
            .iter()
            .filter(|e| e.metadata().capabilities.supports(Stage::Streaming))
            .cloned()
            .collect();
        debug!(stage = %Stage::Streaming, count = handlers.len(), "dispatching stream");

        let dispatcher = self.clone();
        let cancel = token.clone();
        let context = origin.clone();
        // Owned by the stream from the start so that dropping it unpolled
        // still notifies the handlers.
        let mut guard = CloseGuard {
            handlers,
            closed: false,
        };
        let chunks = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        guard.close(StreamEnd::Cancelled);
                        break;
                    },
                    next = source.next() => next,
                };
                let Some(chunk) = next else {
                    guard.close(StreamEnd::Completed);
                    break;
                };
                let transformed = dispatcher.transform_chunk(&guard.handlers, &origin, chunk).await;
                if cancel.is_cancelled() {
                    guard.close(StreamEnd::Cancelled);
                    break;
                }
                if let Some(chunk) = transformed {
                    yield chunk;
                }
            }
        };

        StreamDispatch {
            chunks: Box::pin(chunks),
            token,
            context,
        }
    }

    /// Run one chunk through the streaming handlers. Returns `None` when a
    /// handler suppressed it.
    async fn transform_chunk(
        &self,
        handlers: &[Arc<HandlerEntry>],
        origin: &Option<Arc<RequestContext>>,
        mut chunk: Message,
    ) -> Option<Message> {
        if origin.is_some() {
            chunk.set_context_handle(origin.clone());
        }
        let anchor = chunk.context_handle();
        let anchor = anchor.as_deref();

        let mut current = chunk;
        for entry in handlers {
            if !entry.metadata().accepts(Stage::Streaming, &current.kind) || self.is_skipped(entry) {
                continue;
            }
            let start = Instant::now();
            let result = entry.handler().transform_chunk(&current).await;
            let latency = start.elapsed();
            #[cfg(feature = "metrics")]
            metrics::handler_call(entry.name(), Stage::Streaming, latency);

            match result {
                Ok(OutputAction::Pass) => entry.stats().record_success(latency),
                Ok(OutputAction::Replace(mut next)) => {
                    entry.stats().record_success(latency);
                    if next.context().is_none() {
                        next.set_context_handle(current.context_handle());
                    } else if !same_identity(next.context(), anchor) {
                        warn!(
                            handler = entry.name(),
                            "chunk replacement changes the stream identity, keeping the original"
                        );
                        continue;
                    }
                    current = next;
                },
                Ok(OutputAction::Suppress) => {
                    entry.stats().record_success(latency);
                    debug!(handler = entry.name(), "chunk suppressed");
                    return None;
                },
                Err(e) => self.record_fault(entry, Stage::Streaming, &e, latency),
            }
        }
        Some(current)
    }
}

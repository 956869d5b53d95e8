//! Handler registry and stage dispatcher.
//!
//! Handlers declare which stages they take part in through
//! [`HandlerMetadata`]. The [`Registry`] keeps them ordered by priority and
//! registration order; the [`Dispatcher`] runs the stage algorithms over that
//! order: short-circuiting input, the sequential output chain, per-chunk
//! streaming with context stamping, concurrent retrieval, and
//! first-registered tool dispatch. [`Turn`] sequences the stages for one
//! conversational turn.

pub mod bundled;
pub mod dispatch;
pub mod error;
pub mod handler;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod retrieval;
pub mod stats;
pub mod stream;
pub mod turn;

pub use {
    dispatch::{Dispatcher, InputOutcome, OutputOutcome},
    error::{Error, Result},
    handler::{
        Capabilities, Enrichment, Handler, HandlerMetadata, InputVerdict, OutputAction, Stage,
        StreamEnd,
    },
    registry::{HandlerEntry, Registry, Snapshot},
    retrieval::{HandlerFailure, RetrievalReport},
    stats::{CircuitBreaker, HandlerStats},
    stream::StreamDispatch,
    turn::{Turn, TurnState},
};

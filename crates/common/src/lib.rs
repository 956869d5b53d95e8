//! Shared types used across all switchyard crates: messages, request context,
//! tool schemas and the common error type.

pub mod context;
pub mod error;
pub mod message;
pub mod tools;

pub use {
    context::RequestContext,
    error::{Error, Result},
    message::{ChunkItem, ChunkStream, Message, MessageKind, chunk_stream, chunk_stream_from_iter},
    tools::{
        ParameterSchema, PropertySchema, ToolCall, ToolCallRecord, ToolOutcome, ToolParameter,
        ToolSchema,
    },
};

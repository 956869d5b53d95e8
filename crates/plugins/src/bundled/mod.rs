//! Handlers shipped with the engine.

pub mod chunk_narrower;
pub mod context_guard;

pub use {chunk_narrower::ChunkNarrower, context_guard::ContextGuard};

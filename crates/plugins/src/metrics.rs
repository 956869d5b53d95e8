//! Metric names and recording helpers, compiled in with the `metrics` feature.

use std::time::Duration;

use ::metrics::{counter, histogram};

use crate::handler::Stage;

/// Handler invocation metrics
pub mod handlers {
    /// Total number of handler invocations, labelled by stage
    pub const CALLS_TOTAL: &str = "switchyard_handler_calls_total";
    /// Handler invocations that faulted and were skipped
    pub const FAULTS_TOTAL: &str = "switchyard_handler_faults_total";
    /// Handler invocation duration in seconds
    pub const CALL_DURATION_SECONDS: &str = "switchyard_handler_call_duration_seconds";
}

/// Tool execution metrics
pub mod tools {
    /// Total number of tool executions
    pub const EXECUTIONS_TOTAL: &str = "switchyard_tool_executions_total";
    /// Tool executions that failed or timed out
    pub const EXECUTION_ERRORS_TOTAL: &str = "switchyard_tool_execution_errors_total";
    /// Tool execution duration in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "switchyard_tool_execution_duration_seconds";
}

pub mod labels {
    pub const HANDLER: &str = "handler";
    pub const STAGE: &str = "stage";
    pub const TOOL: &str = "tool";
}

pub(crate) fn handler_call(handler: &str, stage: Stage, latency: Duration) {
    let handler = handler.to_string();
    let stage = stage.to_string();
    counter!(handlers::CALLS_TOTAL, labels::HANDLER => handler.clone(), labels::STAGE => stage.clone())
        .increment(1);
    histogram!(handlers::CALL_DURATION_SECONDS, labels::HANDLER => handler, labels::STAGE => stage)
        .record(latency.as_secs_f64());
}

pub(crate) fn handler_fault(handler: &str, stage: Stage) {
    counter!(
        handlers::FAULTS_TOTAL,
        labels::HANDLER => handler.to_string(),
        labels::STAGE => stage.to_string()
    )
    .increment(1);
}

pub(crate) fn tool_call(tool: &str, latency: Duration, failed: bool) {
    let tool = tool.to_string();
    counter!(tools::EXECUTIONS_TOTAL, labels::TOOL => tool.clone()).increment(1);
    histogram!(tools::EXECUTION_DURATION_SECONDS, labels::TOOL => tool.clone())
        .record(latency.as_secs_f64());
    if failed {
        counter!(tools::EXECUTION_ERRORS_TOTAL, labels::TOOL => tool).increment(1);
    }
}

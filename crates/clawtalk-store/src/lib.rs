//! Durable Talk state: metadata, message log, context document, pins, jobs,
//! bindings, behaviors, and job reports.
//!
//! The store is the single writer for everything under `talks/`. Mutations are
//! serialized through one lane, bump the optimistic-concurrency triple, and
//! publish change events to registered listeners. On-disk tolerance rules
//! (unknown enums to defaults, dangling behaviors dropped, corrupt lines
//! skipped) are the sole contract with prior data.

mod talk_context;
mod talk_model;
mod talk_store;

pub use talk_context::build_talk_context_block;
pub use talk_model::{
    is_valid_talk_id, normalize_slack_scope, normalize_tool_names, Behavior, Binding,
    BindingPermission, DeliveryMode, Directive, ExecutionMode, FilesystemAccess, Job, JobOutput,
    JobReport, JobReportStatus, JobType, MessageRole, MirrorMode, NetworkAccess, ResponseMode,
    ResponsePolicy, Talk, TalkAgent, TalkMessage, TalkPatch, ToolMode, TriggerPolicy,
    TOOL_NAME_PATTERN,
};
pub use talk_store::{ChangeEvent, TalkStore};

#[cfg(test)]
mod tests;

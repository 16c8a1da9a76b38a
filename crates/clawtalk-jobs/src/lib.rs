//! Talk-scoped job execution: cron/one-shot scheduling, message-triggered
//! event jobs, and the shared execution routine both paths flow through.

mod event_dispatcher;
mod job_executor;
mod job_scheduler;
mod talk_run_set;

pub use event_dispatcher::{
    parse_event_trigger, EventDispatcher, EventDispatcherConfig, HookContext,
    MessageReceivedEvent, ReplyDelivery, DEFAULT_EVENT_JOB_DEBOUNCE_MS, ENV_EVENT_JOB_DEBOUNCE_MS,
};
pub use job_executor::{
    compute_policy_allowed_tools, HttpPromptClient, JobExecutor, JobRunOutcome, PromptRequest,
    PromptResponse, SlackSender, TalkPromptClient, DEFAULT_BASE_TIMEOUT_MS,
};
pub use job_scheduler::{
    due_jobs, run_job_scheduler, DueJob, JobSchedulerConfig, DEFAULT_TICK_INTERVAL,
};
pub use talk_run_set::TalkRunSet;

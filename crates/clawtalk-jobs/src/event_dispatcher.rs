//! Message-triggered event jobs with debounce and per-Talk concurrency.
//!
//! Bound to the host's `message_received` hook. The hook's `ctx.channelId`
//! carries the platform name (e.g. "slack"), never a channel id; candidate
//! jobs are matched by their `on <scope>` trigger against the owning talk's
//! bindings.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use clawtalk_core::current_unix_timestamp_ms;
use clawtalk_store::{normalize_slack_scope, JobType, TalkStore};

use crate::job_executor::JobExecutor;
use crate::talk_run_set::TalkRunSet;

pub const DEFAULT_EVENT_JOB_DEBOUNCE_MS: u64 = 30_000;
pub const ENV_EVENT_JOB_DEBOUNCE_MS: &str = "EVENT_JOB_DEBOUNCE_MS";
const DEBOUNCE_RETENTION_FACTOR: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq)]
/// Inbound message as delivered by the host hook.
pub struct MessageReceivedEvent {
    pub text: String,
    pub from: Option<String>,
    pub source_scope: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Hook context. `channel_id` is the platform name by host contract.
pub struct HookContext {
    pub channel_id: String,
}

#[async_trait]
/// Trait contract for delivering an event-job reply back to its source.
pub trait ReplyDelivery: Send + Sync {
    async fn deliver(&self, talk_id: &str, scope: &str, message: &str) -> Result<()>;
}

#[derive(Clone)]
/// Public struct `EventDispatcherConfig` used across ClawTalk components.
pub struct EventDispatcherConfig {
    pub store: Arc<TalkStore>,
    pub executor: Arc<JobExecutor>,
    pub run_set: Arc<TalkRunSet>,
    pub debounce_ms: u64,
    pub reply: Option<Arc<dyn ReplyDelivery>>,
}

/// Parses an event-job trigger of the form `on <scope>`.
pub fn parse_event_trigger(schedule: &str) -> Option<String> {
    let trimmed = schedule.trim();
    let rest = trimmed.strip_prefix("on ").or_else(|| trimmed.strip_prefix("ON "))?;
    let scope = rest.trim();
    if scope.is_empty() {
        return None;
    }
    Some(scope.to_string())
}

/// Fans one `message_received` hook call out to matching event jobs.
pub struct EventDispatcher {
    config: EventDispatcherConfig,
    debounce: Mutex<HashMap<(String, String), u64>>,
    last_cleanup_unix_ms: Mutex<u64>,
}

impl EventDispatcher {
    pub fn new(config: EventDispatcherConfig) -> Self {
        Self {
            config,
            debounce: Mutex::new(HashMap::new()),
            last_cleanup_unix_ms: Mutex::new(0),
        }
    }

    /// Resolves the debounce window from the environment, falling back to
    /// the 30 s default.
    pub fn debounce_ms_from_env() -> u64 {
        std::env::var(ENV_EVENT_JOB_DEBOUNCE_MS)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_EVENT_JOB_DEBOUNCE_MS)
    }

    fn debounced(&self, talk_id: &str, job_id: &str, now: u64) -> bool {
        let Ok(mut debounce) = self.debounce.lock() else {
            return false;
        };
        let key = (talk_id.to_string(), job_id.to_string());
        if let Some(last_fired) = debounce.get(&key) {
            if now.saturating_sub(*last_fired) < self.config.debounce_ms {
                return true;
            }
        }
        debounce.insert(key, now);
        false
    }

    fn cleanup_debounce(&self, now: u64) {
        let Ok(mut last_cleanup) = self.last_cleanup_unix_ms.lock() else {
            return;
        };
        if now.saturating_sub(*last_cleanup) < self.config.debounce_ms {
            return;
        }
        *last_cleanup = now;
        drop(last_cleanup);
        let retention = self
            .config
            .debounce_ms
            .saturating_mul(DEBOUNCE_RETENTION_FACTOR);
        if let Ok(mut debounce) = self.debounce.lock() {
            debounce.retain(|_key, fired| now.saturating_sub(*fired) <= retention);
        }
    }

    /// Fire-and-forget handler for the host's `message_received` hook. The
    /// host ignores the return value, so nothing here can cancel downstream
    /// processing.
    pub async fn handle_message_received(
        &self,
        event: &MessageReceivedEvent,
        ctx: &HookContext,
    ) {
        let now = current_unix_timestamp_ms();
        self.cleanup_debounce(now);
        let platform = ctx.channel_id.trim();
        if platform.is_empty() {
            return;
        }

        let mut handles = Vec::new();
        for (talk_id, job) in self.config.store.all_active_jobs() {
            if job.job_type != JobType::Event {
                continue;
            }
            let Some(trigger_scope) = parse_event_trigger(&job.schedule) else {
                tracing::warn!(%talk_id, job_id = %job.id, "event job with unparseable trigger");
                continue;
            };
            let Some(talk) = self.config.store.get(&talk_id) else {
                continue;
            };
            let normalized_trigger = normalize_slack_scope(&trigger_scope);
            let matched_binding = talk.platform_bindings.iter().find(|binding| {
                binding.platform.eq_ignore_ascii_case(platform)
                    && normalize_slack_scope(&binding.scope) == normalized_trigger
            });
            let Some(binding) = matched_binding else {
                continue;
            };
            let can_reply = binding.permission.can_write();

            if self.debounced(&talk_id, &job.id, now) {
                tracing::debug!(%talk_id, job_id = %job.id, "event job debounced");
                continue;
            }
            let Some(guard) = self.config.run_set.try_acquire(&talk_id) else {
                tracing::warn!(%talk_id, job_id = %job.id, "talk already running an event job");
                continue;
            };

            let trigger_context = format!(
                "Platform: {platform}\nSource: {scope}\nFrom: {from}\nTime: {time}\nContent: {content}",
                scope = event.source_scope.as_deref().unwrap_or(&trigger_scope),
                from = event.from.as_deref().unwrap_or("unknown"),
                time = if event.timestamp > 0 { event.timestamp } else { now },
                content = event.text,
            );
            let executor = Arc::clone(&self.config.executor);
            let reply = self.config.reply.clone();
            let reply_scope = trigger_scope.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                match executor
                    .execute_job(&talk_id, &job, Some(&trigger_context), "event")
                    .await
                {
                    Ok(outcome) => {
                        println!(
                            "event job complete: talk={talk_id} job={} status={}",
                            job.id,
                            outcome.status.as_str()
                        );
                        if can_reply && !outcome.full_output.is_empty() {
                            if let Some(reply) = reply {
                                if let Err(error) = reply
                                    .deliver(&talk_id, &reply_scope, &outcome.full_output)
                                    .await
                                {
                                    tracing::warn!(%talk_id, %error, "event job reply delivery failed");
                                }
                            }
                        }
                    }
                    Err(error) => {
                        eprintln!(
                            "event job failed: talk={talk_id} job={} error={error}",
                            job.id
                        );
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parse_event_trigger_requires_on_prefix_and_scope() {
        assert_eq!(
            parse_event_trigger("on channel:C123"),
            Some("channel:C123".to_string())
        );
        assert_eq!(parse_event_trigger("  on   slack:*  "), Some("slack:*".to_string()));
        assert!(parse_event_trigger("channel:C123").is_none());
        assert!(parse_event_trigger("on ").is_none());
        assert!(parse_event_trigger("").is_none());
    }
}

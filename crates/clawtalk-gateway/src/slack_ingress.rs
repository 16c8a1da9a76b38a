//! In-process ingress pipeline: dedup, route, mirror.
//!
//! The pipeline's core correctness property is that it never invokes the
//! LLM itself. When a Talk owns an event the decision is recorded as
//! delegated: the host's managed agent produces the reply, so a second
//! response can never originate here.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use clawtalk_routing::{
    compose_event_id, resolve_slack_event, DedupTable, RouteDecision, RouteOutcome,
    SlackIngressEvent, PASS_DELEGATED_TO_AGENT,
};
use clawtalk_store::{MessageRole, TalkStore};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Final ingress outcome for one event.
pub struct IngressOutcome {
    pub event_id: String,
    #[serde(flatten)]
    pub decision: RouteDecision,
    pub duplicate: bool,
}

/// Public struct `SlackIngress` used across ClawTalk components.
pub struct SlackIngress {
    store: Arc<TalkStore>,
    dedup: Arc<DedupTable>,
    pass_counters: Mutex<HashMap<String, u64>>,
}

impl SlackIngress {
    pub fn new(store: Arc<TalkStore>, dedup: Arc<DedupTable>) -> Self {
        Self {
            store,
            dedup,
            pass_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Pass decisions recorded for a talk since startup.
    pub fn pass_count(&self, talk_id: &str) -> u64 {
        self.pass_counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(talk_id).copied())
            .unwrap_or(0)
    }

    fn bump_pass_counter(&self, talk_id: &str) {
        if let Ok(mut counters) = self.pass_counters.lock() {
            *counters.entry(talk_id.to_string()).or_insert(0) += 1;
        }
    }

    /// Computes the decision for one event. Replays return the original
    /// decision with `duplicate=true` and perform no further work.
    pub fn process(&self, event: &SlackIngressEvent) -> IngressOutcome {
        let event_id = event
            .event_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| compose_event_id(event));

        if let Some(cached) = self.dedup.lookup(&event_id) {
            return IngressOutcome {
                event_id,
                decision: cached.decision,
                duplicate: true,
            };
        }

        let resolved = resolve_slack_event(event, &self.store.list());
        let decision = match resolved.decision {
            RouteOutcome::Pass => resolved,
            RouteOutcome::Handled => {
                // Ownership established; the host's managed agent replies.
                if let Some(behavior) = resolved.behavior.as_ref() {
                    let mirrors = behavior
                        .mirror_to_talk
                        .map(|mode| mode.mirrors_inbound())
                        .unwrap_or(false);
                    if mirrors {
                        if let Some(talk_id) = resolved.talk_id.as_deref() {
                            self.mirror_inbound(talk_id, event);
                        }
                    }
                }
                RouteDecision {
                    decision: RouteOutcome::Pass,
                    reason: Some(PASS_DELEGATED_TO_AGENT.to_string()),
                    ..resolved
                }
            }
        };

        if let Some(talk_id) = decision.talk_id.as_deref() {
            self.bump_pass_counter(talk_id);
        }
        self.dedup.record(&event_id, decision.clone());
        IngressOutcome {
            event_id,
            decision,
            duplicate: false,
        }
    }

    /// Fire-and-forget append of the inbound message to the talk history. A
    /// failure logs a warning and never breaks routing.
    fn mirror_inbound(&self, talk_id: &str, event: &SlackIngressEvent) {
        let channel = event
            .channel_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(event.channel_id.as_str());
        let sender = event
            .user_name
            .as_deref()
            .or(event.user_id.as_deref())
            .unwrap_or("unknown");
        let thread = event
            .thread_ts
            .as_deref()
            .map(|ts| format!(" (thread {ts})"))
            .unwrap_or_default();
        let content = format!("[Slack #{channel}{thread} from {sender}]\n{}", event.text);

        let store = Arc::clone(&self.store);
        let talk_id = talk_id.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = store.append_message(&talk_id, MessageRole::User, &content)
                    {
                        tracing::warn!(%talk_id, %error, "failed to mirror inbound message");
                    }
                });
            }
            Err(_) => {
                // No async runtime (direct library use): mirror inline.
                if let Err(error) = self.store.append_message(&talk_id, MessageRole::User, &content)
                {
                    tracing::warn!(talk_id, %error, "failed to mirror inbound message");
                }
            }
        }
    }
}

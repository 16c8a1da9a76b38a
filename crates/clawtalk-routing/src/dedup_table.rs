//! Process-local exactly-once memo over at-least-once Slack delivery.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use clawtalk_core::current_unix_timestamp_ms;
use serde::Serialize;

use crate::routing_resolver::{RouteDecision, SlackIngressEvent};

pub const DEFAULT_DEDUP_TTL_MS: u64 = 6 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Decision memoized for a previously observed event id.
pub struct CachedDecision {
    pub timestamp: u64,
    pub decision: RouteDecision,
}

/// TTL-bounded map from event id to the decision originally taken for it.
pub struct DedupTable {
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CachedDecision>>,
}

impl DedupTable {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms: ttl_ms.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The decision previously recorded for this event id, if unexpired.
    pub fn lookup(&self, event_id: &str) -> Option<CachedDecision> {
        let now = current_unix_timestamp_ms();
        let entries = self.entries.lock().ok()?;
        entries
            .get(event_id)
            .filter(|entry| now.saturating_sub(entry.timestamp) < self.ttl_ms)
            .cloned()
    }

    /// Records a decision, pruning expired entries first. Returns the prior
    /// entry when the id was already present.
    pub fn record(&self, event_id: &str, decision: RouteDecision) -> Option<CachedDecision> {
        let now = current_unix_timestamp_ms();
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        entries.retain(|_key, entry| now.saturating_sub(entry.timestamp) < self.ttl_ms);
        entries.insert(
            event_id.to_string(),
            CachedDecision {
                timestamp: now,
                decision,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupTable {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL_MS)
    }
}

/// Composes the canonical dedup key for an event:
/// `slack:<accountId|default>:<channelId>:<messageTs|threadTs|unknown>:<userId|unknown>`.
pub fn compose_event_id(event: &SlackIngressEvent) -> String {
    let account = event
        .account_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("default");
    let ts = event
        .message_ts
        .as_deref()
        .or(event.thread_ts.as_deref())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown");
    let user = event
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown");
    format!("slack:{account}:{}:{ts}:{user}", event.channel_id)
}

#[cfg(test)]
mod tests {
    use crate::routing_resolver::RouteOutcome;

    use super::*;

    fn pass_decision(reason: &str) -> RouteDecision {
        RouteDecision {
            decision: RouteOutcome::Pass,
            talk_id: Some("t1".to_string()),
            binding_id: None,
            reason: Some(reason.to_string()),
            behavior: None,
        }
    }

    #[test]
    fn unit_replay_returns_original_decision() {
        let table = DedupTable::default();
        assert!(table.lookup("e1").is_none());
        assert!(table.record("e1", pass_decision("delegated-to-agent")).is_none());
        let replay = table.lookup("e1").expect("cached decision");
        assert_eq!(
            replay.decision.reason.as_deref(),
            Some("delegated-to-agent")
        );
        // Re-recording surfaces the prior entry.
        let prior = table.record("e1", pass_decision("other"));
        assert!(prior.is_some());
    }

    #[test]
    fn functional_expired_entries_are_pruned_on_insert() {
        let table = DedupTable::new(1);
        table.record("old", pass_decision("no-binding"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        table.record("new", pass_decision("no-binding"));
        assert!(table.lookup("old").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unit_event_id_composition_uses_documented_fallbacks() {
        let mut event = SlackIngressEvent {
            channel_id: "C123".to_string(),
            ..SlackIngressEvent::default()
        };
        assert_eq!(compose_event_id(&event), "slack:default:C123:unknown:unknown");

        event.account_id = Some("kimfamily".to_string());
        event.thread_ts = Some("111.222".to_string());
        event.user_id = Some("U9".to_string());
        assert_eq!(compose_event_id(&event), "slack:kimfamily:C123:111.222:U9");

        event.message_ts = Some("333.444".to_string());
        assert_eq!(compose_event_id(&event), "slack:kimfamily:C123:333.444:U9");
    }
}

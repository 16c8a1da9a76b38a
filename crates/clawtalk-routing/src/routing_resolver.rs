//! Pure resolution of a Slack event to an owning Talk and routing decision.
//!
//! Scoring ranks each write-permitted Slack binding against the event; the
//! best-scoring Talk owns the event unless the top score ties across talks.
//! After ownership, the binding's Behavior gates the decision (allowed
//! senders, response mode, trigger policy). No I/O happens here, so the same
//! talks and event always produce the same decision.

use std::sync::OnceLock;

use clawtalk_core::{classify_intent, Intent};
use clawtalk_store::{normalize_slack_scope, Behavior, ResponseMode, Talk, TriggerPolicy};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const PASS_NO_BINDING: &str = "no-binding";
pub const PASS_AMBIGUOUS_BINDING: &str = "ambiguous-binding";
pub const PASS_SENDER_NOT_ALLOWED: &str = "sender-not-allowed";
pub const PASS_ON_MESSAGE_DISABLED: &str = "on-message-disabled";
pub const PASS_MENTION_REQUIRED: &str = "mention-required";
pub const PASS_TRIGGER_POLICY_REJECTED: &str = "trigger-policy-rejected";
pub const PASS_DELEGATED_TO_AGENT: &str = "delegated-to-agent";

const SCORE_EXACT_ID: i32 = 100;
const SCORE_OUTBOUND_TARGET: i32 = 95;
const SCORE_CHANNEL_NAME: i32 = 90;
const SCORE_CHANNEL_NAME_SUFFIX: i32 = 80;
const SCORE_WILDCARD: i32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Normalized inbound Slack event as seen by routing and ingress.
pub struct SlackIngressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_target: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RouteOutcome` values.
pub enum RouteOutcome {
    Handled,
    Pass,
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Pass => "pass",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Outcome of routing one Slack event against the current Talks.
pub struct RouteDecision {
    pub decision: RouteOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip)]
    pub behavior: Option<Behavior>,
}

impl RouteDecision {
    fn pass(reason: &str) -> Self {
        Self {
            decision: RouteOutcome::Pass,
            talk_id: None,
            binding_id: None,
            reason: Some(reason.to_string()),
            behavior: None,
        }
    }

    fn pass_for_talk(reason: &str, talk_id: &str, binding_id: &str) -> Self {
        Self {
            decision: RouteOutcome::Pass,
            talk_id: Some(talk_id.to_string()),
            binding_id: Some(binding_id.to_string()),
            reason: Some(reason.to_string()),
            behavior: None,
        }
    }
}

/// Scores one binding against the event. `None` means excluded.
fn score_binding(
    binding: &clawtalk_store::Binding,
    event: &SlackIngressEvent,
) -> Option<i32> {
    if !binding.platform.eq_ignore_ascii_case("slack") {
        return None;
    }
    if !binding.permission.can_write() {
        return None;
    }
    if let Some(bound_account) = binding.account_id.as_deref() {
        let event_account = event.account_id.as_deref().unwrap_or_default();
        if !bound_account.eq_ignore_ascii_case(event_account) {
            return None;
        }
    }

    let scope = normalize_slack_scope(&binding.scope);
    let channel_id = event.channel_id.trim().to_ascii_lowercase();
    if !channel_id.is_empty() {
        let exact_forms = [
            channel_id.clone(),
            format!("channel:{channel_id}"),
            format!("user:{channel_id}"),
            format!("slack:{channel_id}"),
        ];
        if exact_forms.iter().any(|form| *form == scope) {
            return Some(SCORE_EXACT_ID);
        }
    }

    if let Some(target) = event.outbound_target.as_deref() {
        if scope == normalize_slack_scope(target) {
            return Some(SCORE_OUTBOUND_TARGET);
        }
    }

    if let Some(name) = event
        .channel_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        let name = name.to_ascii_lowercase();
        if scope == format!("#{name}") || scope == name {
            return Some(SCORE_CHANNEL_NAME);
        }
        if scope.ends_with(&format!(" #{name}")) {
            return Some(SCORE_CHANNEL_NAME_SUFFIX);
        }
    }

    if matches!(scope.as_str(), "*" | "all" | "slack:*") {
        return Some(SCORE_WILDCARD);
    }

    None
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<@U[A-Z0-9]+>|(^|\s)@\w+").expect("mention pattern"))
}

fn behavior_gate(
    talk: &Talk,
    binding_id: &str,
    behavior: &Behavior,
    event: &SlackIngressEvent,
) -> Option<RouteDecision> {
    if let Some(policy) = behavior.response_policy.as_ref() {
        if let Some(allowed) = policy.allowed_senders.as_ref() {
            let user_name = event.user_name.as_deref().unwrap_or_default();
            let user_id = event.user_id.as_deref().unwrap_or_default();
            let permitted = allowed.iter().any(|sender| {
                sender.eq_ignore_ascii_case(user_name) || sender.eq_ignore_ascii_case(user_id)
            });
            if !permitted {
                return Some(RouteDecision::pass_for_talk(
                    PASS_SENDER_NOT_ALLOWED,
                    &talk.id,
                    binding_id,
                ));
            }
        }
    }

    match behavior.response_mode {
        Some(ResponseMode::Off) => {
            return Some(RouteDecision::pass_for_talk(
                PASS_ON_MESSAGE_DISABLED,
                &talk.id,
                binding_id,
            ));
        }
        Some(ResponseMode::Mentions) => {
            if !mention_pattern().is_match(&event.text) {
                return Some(RouteDecision::pass_for_talk(
                    PASS_MENTION_REQUIRED,
                    &talk.id,
                    binding_id,
                ));
            }
        }
        Some(ResponseMode::All) | None => {}
    }

    if let Some(policy) = behavior.response_policy.as_ref() {
        let intent = classify_intent(&event.text);
        let accepted = match policy.trigger_policy {
            TriggerPolicy::Judgment => true,
            TriggerPolicy::StudyEntriesOnly => intent == Intent::Study,
            TriggerPolicy::AdviceOrStudy => {
                matches!(intent, Intent::Study | Intent::Advice)
            }
        };
        if !accepted {
            return Some(RouteDecision::pass_for_talk(
                PASS_TRIGGER_POLICY_REJECTED,
                &talk.id,
                binding_id,
            ));
        }
    }

    None
}

/// Resolves one event against the given talks.
///
/// Pure over its inputs: the same talks and event always yield the same
/// decision.
pub fn resolve_slack_event(event: &SlackIngressEvent, talks: &[Talk]) -> RouteDecision {
    let mut best: Option<(&Talk, &clawtalk_store::Binding, i32)> = None;
    let mut top_ties = 0_usize;

    for talk in talks {
        let mut talk_best: Option<(&clawtalk_store::Binding, i32)> = None;
        for binding in &talk.platform_bindings {
            let Some(score) = score_binding(binding, event) else {
                continue;
            };
            match talk_best {
                Some((_, current)) if current >= score => {}
                _ => talk_best = Some((binding, score)),
            }
        }
        let Some((binding, score)) = talk_best else {
            continue;
        };
        match &best {
            Some((_, _, current)) if *current > score => {}
            Some((_, _, current)) if *current == score => {
                top_ties = top_ties.saturating_add(1);
            }
            _ => {
                best = Some((talk, binding, score));
                top_ties = 1;
            }
        }
    }

    let Some((talk, binding, score)) = best else {
        return RouteDecision::pass(PASS_NO_BINDING);
    };
    if top_ties >= 2 {
        tracing::warn!(
            channel_id = %event.channel_id,
            score,
            ties = top_ties,
            "multiple talks claim this event; passing"
        );
        return RouteDecision::pass(PASS_AMBIGUOUS_BINDING);
    }

    let behavior = talk.behavior_for_binding(&binding.id);
    if let Some(behavior) = behavior {
        if let Some(rejection) = behavior_gate(talk, &binding.id, behavior, event) {
            return rejection;
        }
    }

    RouteDecision {
        decision: RouteOutcome::Handled,
        talk_id: Some(talk.id.clone()),
        binding_id: Some(binding.id.clone()),
        reason: None,
        behavior: behavior.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use clawtalk_store::{Binding, BindingPermission, ResponsePolicy};

    use super::*;

    fn talk_with_bindings(id: &str, bindings: Vec<Binding>) -> Talk {
        let mut talk: Talk =
            serde_json::from_value(serde_json::json!({"id": id})).expect("decode talk");
        talk.platform_bindings = bindings;
        talk
    }

    fn write_binding(id: &str, scope: &str) -> Binding {
        Binding {
            id: id.to_string(),
            platform: "slack".to_string(),
            scope: scope.to_string(),
            account_id: None,
            display_scope: None,
            permission: BindingPermission::Write,
            created_at: 0,
        }
    }

    fn event_for_channel(channel_id: &str) -> SlackIngressEvent {
        SlackIngressEvent {
            channel_id: channel_id.to_string(),
            text: "hello".to_string(),
            ..SlackIngressEvent::default()
        }
    }

    #[test]
    fn unit_exact_channel_binding_scores_highest() {
        let talks = vec![
            talk_with_bindings("wild", vec![write_binding("b1", "*")]),
            talk_with_bindings("exact", vec![write_binding("b2", "channel:C123")]),
        ];
        let decision = resolve_slack_event(&event_for_channel("C123"), &talks);
        assert_eq!(decision.decision, RouteOutcome::Handled);
        assert_eq!(decision.talk_id.as_deref(), Some("exact"));
        assert_eq!(decision.binding_id.as_deref(), Some("b2"));
    }

    #[test]
    fn unit_unbound_channel_passes_with_no_binding() {
        let talks = vec![talk_with_bindings(
            "t1",
            vec![write_binding("b1", "channel:C123")],
        )];
        let decision = resolve_slack_event(&event_for_channel("C999"), &talks);
        assert_eq!(decision.decision, RouteOutcome::Pass);
        assert_eq!(decision.reason.as_deref(), Some(PASS_NO_BINDING));
        assert!(decision.talk_id.is_none());
    }

    #[test]
    fn unit_read_only_bindings_are_excluded() {
        let mut binding = write_binding("b1", "channel:C123");
        binding.permission = BindingPermission::Read;
        let talks = vec![talk_with_bindings("t1", vec![binding])];
        let decision = resolve_slack_event(&event_for_channel("C123"), &talks);
        assert_eq!(decision.reason.as_deref(), Some(PASS_NO_BINDING));
    }

    #[test]
    fn unit_account_mismatch_excludes_binding() {
        let mut binding = write_binding("b1", "channel:C123");
        binding.account_id = Some("kimfamily".to_string());
        let talks = vec![talk_with_bindings("t1", vec![binding])];

        let mut event = event_for_channel("C123");
        event.account_id = Some("other".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.reason.as_deref(), Some(PASS_NO_BINDING));

        event.account_id = Some("KimFamily".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.decision, RouteOutcome::Handled);
    }

    #[test]
    fn functional_tied_top_score_passes_as_ambiguous() {
        let talks = vec![
            talk_with_bindings("t1", vec![write_binding("b1", "channel:C123")]),
            talk_with_bindings("t2", vec![write_binding("b2", "C123")]),
        ];
        let decision = resolve_slack_event(&event_for_channel("C123"), &talks);
        assert_eq!(decision.decision, RouteOutcome::Pass);
        assert_eq!(decision.reason.as_deref(), Some(PASS_AMBIGUOUS_BINDING));
        assert!(decision.talk_id.is_none());
    }

    #[test]
    fn unit_channel_name_scoring_tiers() {
        let talks = vec![
            talk_with_bindings("name", vec![write_binding("b1", "#ops")]),
            talk_with_bindings("suffix", vec![write_binding("b2", "team room #ops")]),
        ];
        let mut event = event_for_channel("C555");
        event.channel_name = Some("Ops".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.talk_id.as_deref(), Some("name"));
    }

    #[test]
    fn unit_outbound_target_outranks_channel_name() {
        let talks = vec![
            talk_with_bindings("name", vec![write_binding("b1", "#ops")]),
            talk_with_bindings("target", vec![write_binding("b2", "channel:c777")]),
        ];
        let mut event = event_for_channel("C555");
        event.channel_name = Some("ops".to_string());
        event.outbound_target = Some("channel:C777".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.talk_id.as_deref(), Some("target"));
    }

    #[test]
    fn functional_behavior_gate_sender_allowlist() {
        let mut talk = talk_with_bindings("t1", vec![write_binding("b1", "channel:C1")]);
        talk.platform_behaviors = vec![Behavior {
            id: "x1".to_string(),
            platform_binding_id: "b1".to_string(),
            response_policy: Some(ResponsePolicy {
                allowed_senders: Some(vec!["alice".to_string()]),
                ..ResponsePolicy::default()
            }),
            ..Behavior::default()
        }];
        let talks = vec![talk];

        let mut event = event_for_channel("C1");
        event.user_name = Some("Bob".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.reason.as_deref(), Some(PASS_SENDER_NOT_ALLOWED));
        assert_eq!(decision.talk_id.as_deref(), Some("t1"));

        event.user_name = Some("ALICE".to_string());
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.decision, RouteOutcome::Handled);
    }

    #[test]
    fn functional_behavior_gate_response_modes() {
        let make_talks = |mode: ResponseMode| {
            let mut talk = talk_with_bindings("t1", vec![write_binding("b1", "channel:C1")]);
            talk.platform_behaviors = vec![Behavior {
                id: "x1".to_string(),
                platform_binding_id: "b1".to_string(),
                response_mode: Some(mode),
                ..Behavior::default()
            }];
            vec![talk]
        };

        let decision = resolve_slack_event(&event_for_channel("C1"), &make_talks(ResponseMode::Off));
        assert_eq!(decision.reason.as_deref(), Some(PASS_ON_MESSAGE_DISABLED));

        let decision =
            resolve_slack_event(&event_for_channel("C1"), &make_talks(ResponseMode::Mentions));
        assert_eq!(decision.reason.as_deref(), Some(PASS_MENTION_REQUIRED));

        let mut mentioned = event_for_channel("C1");
        mentioned.text = "<@U042> please summarize".to_string();
        let decision = resolve_slack_event(&mentioned, &make_talks(ResponseMode::Mentions));
        assert_eq!(decision.decision, RouteOutcome::Handled);

        let decision = resolve_slack_event(&event_for_channel("C1"), &make_talks(ResponseMode::All));
        assert_eq!(decision.decision, RouteOutcome::Handled);
    }

    #[test]
    fn functional_trigger_policy_study_entries_only() {
        let mut talk = talk_with_bindings("t1", vec![write_binding("b1", "channel:C1")]);
        talk.platform_behaviors = vec![Behavior {
            id: "x1".to_string(),
            platform_binding_id: "b1".to_string(),
            response_mode: Some(ResponseMode::All),
            response_policy: Some(ResponsePolicy {
                trigger_policy: TriggerPolicy::StudyEntriesOnly,
                ..ResponsePolicy::default()
            }),
            ..Behavior::default()
        }];
        let talks = vec![talk];

        let mut event = event_for_channel("C1");
        event.text = "studied 45 minutes of chemistry".to_string();
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(decision.decision, RouteOutcome::Handled);

        event.text = "what's for dinner".to_string();
        let decision = resolve_slack_event(&event, &talks);
        assert_eq!(
            decision.reason.as_deref(),
            Some(PASS_TRIGGER_POLICY_REJECTED)
        );
    }

    #[test]
    fn regression_missing_behavior_passes_gate_untouched() {
        let talks = vec![talk_with_bindings(
            "t1",
            vec![write_binding("b1", "channel:C1")],
        )];
        let decision = resolve_slack_event(&event_for_channel("C1"), &talks);
        assert_eq!(decision.decision, RouteOutcome::Handled);
        assert!(decision.behavior.is_none());
    }

    #[test]
    fn regression_resolver_is_pure_over_repeat_calls() {
        let talks = vec![talk_with_bindings(
            "t1",
            vec![write_binding("b1", "channel:C1")],
        )];
        let event = event_for_channel("C1");
        let first = resolve_slack_event(&event, &talks);
        let second = resolve_slack_event(&event, &talks);
        assert_eq!(first, second);
    }
}

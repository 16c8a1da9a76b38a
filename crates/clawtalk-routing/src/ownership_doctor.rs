//! Detection of Talk bindings contested by host-owned agent bindings.
//!
//! Detection only: conflicts are reported, never remediated.

use clawtalk_store::{normalize_slack_scope, Talk};
use serde::Serialize;

use crate::host_config::HostConfig;

const DEFAULT_ACCOUNT_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// One (Talk binding, host binding) pair claiming the same scope.
pub struct OwnershipConflict {
    pub talk_id: String,
    pub talk_scope: String,
    pub talk_account_id: String,
    pub open_claw_agent_id: String,
    pub open_claw_scope: String,
    pub open_claw_account_id: String,
}

fn is_wildcard_scope(scope: &str) -> bool {
    matches!(scope, "*" | "all" | "slack:*")
}

/// Reports every host Slack binding (outside the managed set) that collides
/// with a Talk's write binding on the same normalized `(accountId, scope)`.
pub fn detect_ownership_conflicts(
    talks: &[Talk],
    config: &HostConfig,
    clawtalk_agent_ids: &[String],
) -> Vec<OwnershipConflict> {
    let mut conflicts = Vec::new();

    for row in &config.bindings {
        if !row.match_rule.channel.eq_ignore_ascii_case("slack") {
            continue;
        }
        let Some(peer) = row.match_rule.peer.as_ref() else {
            continue;
        };
        let peer_kind = peer.kind.trim().to_ascii_lowercase();
        let peer_id = peer.id.trim().to_ascii_lowercase();
        if peer_kind.is_empty() || peer_id.is_empty() {
            continue;
        }
        if clawtalk_agent_ids
            .iter()
            .any(|managed| managed.eq_ignore_ascii_case(&row.agent_id))
        {
            continue;
        }
        let row_account = row
            .match_rule
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ACCOUNT_ID)
            .to_ascii_lowercase();
        let row_scope = format!("{peer_kind}:{peer_id}");

        for talk in talks {
            for binding in &talk.platform_bindings {
                if !binding.platform.eq_ignore_ascii_case("slack") {
                    continue;
                }
                if !binding.permission.can_write() {
                    continue;
                }
                let talk_account = binding
                    .account_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(DEFAULT_ACCOUNT_ID)
                    .to_ascii_lowercase();
                if talk_account != row_account {
                    continue;
                }
                let talk_scope = normalize_slack_scope(&binding.scope);
                if talk_scope != row_scope && !is_wildcard_scope(&talk_scope) {
                    continue;
                }
                conflicts.push(OwnershipConflict {
                    talk_id: talk.id.clone(),
                    talk_scope: talk_scope.clone(),
                    talk_account_id: talk_account.clone(),
                    open_claw_agent_id: row.agent_id.clone(),
                    open_claw_scope: row_scope.clone(),
                    open_claw_account_id: row_account.clone(),
                });
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use clawtalk_store::{Binding, BindingPermission};

    use super::*;
    use crate::host_config::load_host_config;

    fn talk_with_binding(id: &str, scope: &str, account: Option<&str>) -> Talk {
        let mut talk: Talk =
            serde_json::from_value(serde_json::json!({"id": id})).expect("decode talk");
        talk.platform_bindings = vec![Binding {
            id: "b1".to_string(),
            platform: "slack".to_string(),
            scope: scope.to_string(),
            account_id: account.map(str::to_string),
            display_scope: None,
            permission: BindingPermission::Write,
            created_at: 0,
        }];
        talk
    }

    fn host_config_with_binding() -> HostConfig {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("openclaw.json");
        std::fs::write(
            &path,
            r#"{
  "bindings": [
    {"agentId": "silent", "match": {"channel": "slack", "accountId": "kimfamily", "peer": {"kind": "channel", "id": "C01CL1PU022"}}}
  ]
}"#,
        )
        .expect("write config");
        load_host_config(&path).expect("load config")
    }

    #[test]
    fn functional_conflict_reported_with_lowercased_fields() {
        let talks = vec![talk_with_binding(
            "fam-talk",
            "channel:C01CL1PU022",
            Some("kimfamily"),
        )];
        let conflicts = detect_ownership_conflicts(
            &talks,
            &host_config_with_binding(),
            &["mobileclaw".to_string(), "clawtalk".to_string()],
        );
        assert_eq!(
            conflicts,
            vec![OwnershipConflict {
                talk_id: "fam-talk".to_string(),
                talk_scope: "channel:c01cl1pu022".to_string(),
                talk_account_id: "kimfamily".to_string(),
                open_claw_agent_id: "silent".to_string(),
                open_claw_scope: "channel:c01cl1pu022".to_string(),
                open_claw_account_id: "kimfamily".to_string(),
            }]
        );
    }

    #[test]
    fn unit_managed_agents_are_exempt() {
        let talks = vec![talk_with_binding(
            "fam-talk",
            "channel:C01CL1PU022",
            Some("kimfamily"),
        )];
        let conflicts = detect_ownership_conflicts(
            &talks,
            &host_config_with_binding(),
            &["silent".to_string()],
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn unit_wildcard_talk_scope_matches_any_peer_in_account() {
        let talks = vec![talk_with_binding("wild", "slack:*", Some("kimfamily"))];
        let conflicts = detect_ownership_conflicts(&talks, &host_config_with_binding(), &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].talk_scope, "slack:*");
    }

    #[test]
    fn unit_account_mismatch_is_not_a_conflict() {
        let talks = vec![talk_with_binding(
            "other",
            "channel:C01CL1PU022",
            Some("different-account"),
        )];
        let conflicts = detect_ownership_conflicts(&talks, &host_config_with_binding(), &[]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn unit_read_only_talk_bindings_are_ignored() {
        let mut talk = talk_with_binding("ro", "channel:C01CL1PU022", Some("kimfamily"));
        talk.platform_bindings[0].permission = BindingPermission::Read;
        let conflicts = detect_ownership_conflicts(&[talk], &host_config_with_binding(), &[]);
        assert!(conflicts.is_empty());
    }
}

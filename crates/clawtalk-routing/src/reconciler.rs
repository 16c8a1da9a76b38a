//! Startup materialization of Talk bindings into the host configuration.
//!
//! Each Talk with a write-permitted Slack binding gets a managed agent
//! (`ct-<8>` id) and a prepended binding row; host-owned rows and agents are
//! retained untouched. The file write is atomic and skipped when nothing
//! changed.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use clawtalk_store::{ResponseMode, Talk};
use serde_json::{json, Map};

use crate::host_config::{
    load_host_config, parse_slack_peer, save_host_config, HostAgent, HostBinding,
    HostBindingMatch, HostConfig, HostPeer, HostSlackAccount,
};

const LEGACY_MANAGED_AGENT_ID: &str = "clawtalk";
const MANAGED_AGENT_PREFIX: &str = "ct-";
const DEFAULT_ACCOUNT_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Summary of one reconciliation run.
pub struct ReconcileReport {
    pub desired_bindings: usize,
    pub retained_bindings: usize,
    pub dropped_bindings: usize,
    pub managed_agents: usize,
    pub wrote_file: bool,
}

/// Stable managed-agent id for a talk: `ct-` plus the first eight id chars.
pub fn managed_agent_id(talk_id: &str) -> String {
    let prefix = talk_id.chars().take(8).collect::<String>();
    format!("{MANAGED_AGENT_PREFIX}{prefix}")
}

fn is_managed_agent_id(agent_id: &str) -> bool {
    agent_id.starts_with(MANAGED_AGENT_PREFIX) || agent_id == LEGACY_MANAGED_AGENT_ID
}

struct DesiredRow {
    talk_id: String,
    agent_id: String,
    account_id: Option<String>,
    peer: HostPeer,
    require_mention: bool,
    talk_title: String,
    talk_model: String,
}

fn desired_rows(talks: &[Talk]) -> Vec<DesiredRow> {
    let mut rows = Vec::new();
    let mut seen = BTreeSet::new();
    for talk in talks {
        for binding in &talk.platform_bindings {
            if !binding.platform.eq_ignore_ascii_case("slack") {
                continue;
            }
            if !binding.permission.can_write() {
                continue;
            }
            let Some(peer) = parse_slack_peer(&binding.scope) else {
                continue;
            };
            let account_id = binding
                .account_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            // Duplicate (platform, scope, account) bindings collapse to one
            // desired row.
            let dedup_key = (
                account_id
                    .as_deref()
                    .unwrap_or(DEFAULT_ACCOUNT_ID)
                    .to_ascii_lowercase(),
                peer.kind.clone(),
                peer.id.clone(),
            );
            if !seen.insert(dedup_key) {
                continue;
            }
            let require_mention = talk
                .behavior_for_binding(&binding.id)
                .and_then(|behavior| behavior.response_mode)
                .map(|mode| mode == ResponseMode::Mentions)
                .unwrap_or(false);
            rows.push(DesiredRow {
                talk_id: talk.id.clone(),
                agent_id: managed_agent_id(&talk.id),
                account_id,
                peer,
                require_mention,
                talk_title: talk.topic_title.clone(),
                talk_model: talk.model.clone(),
            });
        }
    }
    rows
}

/// Rewrites the host config so every bound Talk has a managed agent and
/// binding row, retaining host-owned rows.
pub fn reconcile_host_config(
    config_path: &Path,
    talks: &[Talk],
    env_signing_secret: Option<&str>,
) -> Result<ReconcileReport> {
    let mut config = load_host_config(config_path)?;
    let rows = desired_rows(talks);
    let report = apply_reconciliation(&mut config, &rows, env_signing_secret);

    let wrote_file = save_host_config(config_path, &config)?;
    Ok(ReconcileReport {
        wrote_file,
        ..report
    })
}

fn apply_reconciliation(
    config: &mut HostConfig,
    rows: &[DesiredRow],
    env_signing_secret: Option<&str>,
) -> ReconcileReport {
    let desired_keys = rows
        .iter()
        .map(|row| {
            (
                row.account_id
                    .as_deref()
                    .unwrap_or(DEFAULT_ACCOUNT_ID)
                    .to_ascii_lowercase(),
                row.peer.kind.clone(),
                row.peer.id.clone(),
            )
        })
        .collect::<BTreeSet<_>>();

    let existing = std::mem::take(&mut config.bindings);
    let total_existing = existing.len();
    let mut retained = Vec::new();
    for binding in existing {
        if !binding.match_rule.channel.eq_ignore_ascii_case("slack") {
            retained.push(binding);
            continue;
        }
        let key = binding.match_rule.peer.as_ref().map(|peer| {
            (
                binding
                    .match_rule
                    .account_id
                    .as_deref()
                    .unwrap_or(DEFAULT_ACCOUNT_ID)
                    .to_ascii_lowercase(),
                peer.kind.to_ascii_lowercase(),
                peer.id.to_ascii_uppercase(),
            )
        });
        let is_desired = key.map(|key| desired_keys.contains(&key)).unwrap_or(false);
        if !is_desired && !is_managed_agent_id(&binding.agent_id) {
            retained.push(binding);
        }
    }

    let mut bindings = rows
        .iter()
        .map(|row| HostBinding {
            agent_id: row.agent_id.clone(),
            match_rule: HostBindingMatch {
                channel: "slack".to_string(),
                account_id: row.account_id.clone(),
                peer: Some(row.peer.clone()),
            },
            extra: Map::new(),
        })
        .collect::<Vec<_>>();
    let retained_count = retained.len();
    bindings.extend(retained);
    let dropped = total_existing.saturating_sub(retained_count);
    config.bindings = bindings;

    let default_model = config.agents.default_model().map(str::to_string);
    let mut agents = std::mem::take(&mut config.agents.list);
    agents.retain(|agent| !is_managed_agent_id(&agent.id));
    let mut managed_count = 0_usize;
    let mut seen_agents = BTreeSet::new();
    for row in rows {
        if !seen_agents.insert(row.agent_id.clone()) {
            continue;
        }
        managed_count += 1;
        let name = if row.talk_title.trim().is_empty() {
            format!("ClawTalk {}", row.agent_id)
        } else {
            row.talk_title.trim().to_string()
        };
        let model = if row.talk_model.trim().is_empty() {
            default_model.clone().unwrap_or_default()
        } else {
            row.talk_model.trim().to_string()
        };
        agents.push(HostAgent {
            id: row.agent_id.clone(),
            name,
            model,
            sandbox: json!({"mode": "off"}),
            extra: Map::new(),
        });
    }
    config.agents.list = agents;

    for row in rows {
        if row.peer.kind != "channel" {
            continue;
        }
        let account_key = row
            .account_id
            .as_deref()
            .unwrap_or(DEFAULT_ACCOUNT_ID)
            .to_string();
        let account = config
            .channels
            .slack
            .accounts
            .entry(account_key)
            .or_insert_with(HostSlackAccount::default);
        account
            .channels
            .entry(row.peer.id.clone())
            .or_default()
            .require_mention = row.require_mention;
    }

    let base_secret = config.channels.slack.signing_secret.clone();
    for account in config.channels.slack.accounts.values_mut() {
        if account.is_socket_mode() || account.signing_secret.is_some() {
            continue;
        }
        let fallback = env_signing_secret
            .map(str::to_string)
            .or_else(|| base_secret.clone());
        if let Some(secret) = fallback {
            account.signing_secret = Some(secret);
        }
    }

    ReconcileReport {
        desired_bindings: rows.len(),
        retained_bindings: retained_count,
        dropped_bindings: dropped,
        managed_agents: managed_count,
        wrote_file: false,
    }
}

#[cfg(test)]
mod tests {
    use clawtalk_store::{Behavior, Binding, BindingPermission};
    use tempfile::tempdir;

    use super::*;

    fn talk_with_channel(id: &str, scope: &str, account: Option<&str>) -> Talk {
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

    #[test]
    fn unit_managed_agent_id_is_stable_prefix() {
        assert_eq!(managed_agent_id("abcdef123456"), "ct-abcdef12");
        assert_eq!(managed_agent_id("short"), "ct-short");
    }

    #[test]
    fn functional_reconcile_prepends_desired_rows_and_keeps_host_rows() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("openclaw.json");
        std::fs::write(
            &path,
            r#"{
  "bindings": [
    {"agentId": "host-bot", "match": {"channel": "slack", "accountId": "ops", "peer": {"kind": "channel", "id": "C900"}}},
    {"agentId": "irc-bot", "match": {"channel": "irc"}},
    {"agentId": "ct-stale99", "match": {"channel": "slack", "peer": {"kind": "channel", "id": "C800"}}}
  ],
  "agents": {"list": [{"id": "ct-stale99", "name": "old", "model": ""}, {"id": "human", "name": "kept", "model": ""}], "defaults": {"model": {"primary": "gpt-default"}}},
  "channels": {"slack": {"accounts": {}}}
}"#,
        )
        .expect("write");

        let mut talk = talk_with_channel("fam12345xyz", "channel:C123", Some("kimfamily"));
        talk.topic_title = "Homework".to_string();
        talk.platform_behaviors = vec![Behavior {
            id: "x1".to_string(),
            platform_binding_id: "b1".to_string(),
            response_mode: Some(ResponseMode::Mentions),
            ..Behavior::default()
        }];

        let report = reconcile_host_config(&path, &[talk], None).expect("reconcile");
        assert!(report.wrote_file);
        assert_eq!(report.desired_bindings, 1);
        assert_eq!(report.managed_agents, 1);

        let config = load_host_config(&path).expect("reload");
        // Desired row is first; host slack row and non-slack row survive; the
        // stale managed row is gone.
        assert_eq!(config.bindings[0].agent_id, "ct-fam12345");
        assert_eq!(
            config.bindings[0].match_rule.peer.as_ref().map(|peer| peer.id.as_str()),
            Some("C123")
        );
        let agent_ids = config
            .bindings
            .iter()
            .map(|binding| binding.agent_id.clone())
            .collect::<Vec<_>>();
        assert!(agent_ids.contains(&"host-bot".to_string()));
        assert!(agent_ids.contains(&"irc-bot".to_string()));
        assert!(!agent_ids.contains(&"ct-stale99".to_string()));

        let managed = config
            .agents
            .list
            .iter()
            .find(|agent| agent.id == "ct-fam12345")
            .expect("managed agent");
        assert_eq!(managed.name, "Homework");
        assert_eq!(managed.model, "gpt-default");
        assert_eq!(managed.sandbox, json!({"mode": "off"}));
        assert!(config.agents.list.iter().any(|agent| agent.id == "human"));
        assert!(!config.agents.list.iter().any(|agent| agent.id == "ct-stale99"));

        let account = config
            .channels
            .slack
            .accounts
            .get("kimfamily")
            .expect("account");
        assert!(account.channels.get("C123").expect("channel").require_mention);
    }

    #[test]
    fn functional_reconcile_skips_rewrite_when_identical() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("openclaw.json");
        let talk = talk_with_channel("fam12345xyz", "channel:C123", None);
        let first = reconcile_host_config(&path, std::slice::from_ref(&talk), None)
            .expect("first reconcile");
        assert!(first.wrote_file);
        let second = reconcile_host_config(&path, std::slice::from_ref(&talk), None)
            .expect("second reconcile");
        assert!(!second.wrote_file);
    }

    #[test]
    fn functional_signing_secret_propagates_to_http_accounts_only() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("openclaw.json");
        std::fs::write(
            &path,
            r#"{
  "channels": {"slack": {"signingSecret": "base-secret", "accounts": {
    "http-account": {"mode": "http"},
    "socket-account": {"mode": "socket"}
  }}}
}"#,
        )
        .expect("write");
        reconcile_host_config(&path, &[], None).expect("reconcile");
        let config = load_host_config(&path).expect("reload");
        assert_eq!(
            config.channels.slack.accounts["http-account"]
                .signing_secret
                .as_deref(),
            Some("base-secret")
        );
        assert!(config.channels.slack.accounts["socket-account"]
            .signing_secret
            .is_none());
    }

    #[test]
    fn regression_duplicate_scope_bindings_collapse_to_one_row() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("openclaw.json");
        let mut talk = talk_with_channel("fam12345xyz", "channel:C123", None);
        talk.platform_bindings.push(Binding {
            id: "b2".to_string(),
            platform: "slack".to_string(),
            scope: "C123".to_string(),
            account_id: None,
            display_scope: None,
            permission: BindingPermission::ReadWrite,
            created_at: 0,
        });
        let report = reconcile_host_config(&path, &[talk], None).expect("reconcile");
        assert_eq!(report.desired_bindings, 1);
    }
}

//! Typed, tolerant model of the host's configuration file.
//!
//! The host accepts loosely shaped JSON; everything read here goes through
//! serde with defaults plus explicit peer parsing, and unknown fields are
//! carried through `extra` maps so a rewrite never loses host-owned settings.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use clawtalk_core::commit_text;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// One peer selector inside a host binding row.
pub struct HostPeer {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `HostBindingMatch` used across ClawTalk components.
pub struct HostBindingMatch {
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<HostPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// One row of the host's `bindings` array.
pub struct HostBinding {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, rename = "match")]
    pub match_rule: HostBindingMatch,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// One entry of the host's managed agent list.
pub struct HostAgent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub sandbox: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `HostAgents` used across ClawTalk components.
pub struct HostAgents {
    #[serde(default)]
    pub list: Vec<HostAgent>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub defaults: Value,
}

impl HostAgents {
    /// The host-wide default primary model, when configured.
    pub fn default_model(&self) -> Option<&str> {
        self.defaults
            .get("model")
            .and_then(|model| model.get("primary"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Per-channel settings inside a Slack account.
pub struct HostSlackChannelSettings {
    #[serde(default)]
    pub require_mention: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// One configured Slack account on the host.
pub struct HostSlackAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, HostSlackChannelSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HostSlackAccount {
    pub fn is_socket_mode(&self) -> bool {
        self.mode
            .as_deref()
            .map(|mode| mode.eq_ignore_ascii_case("socket"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `HostSlackChannel` used across ClawTalk components.
pub struct HostSlackChannel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, HostSlackAccount>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `HostChannels` used across ClawTalk components.
pub struct HostChannels {
    #[serde(default)]
    pub slack: HostSlackChannel,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Root of the host configuration file.
pub struct HostConfig {
    #[serde(default)]
    pub bindings: Vec<HostBinding>,
    #[serde(default)]
    pub agents: HostAgents,
    #[serde(default)]
    pub channels: HostChannels,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Loads the host config; a missing file reads as the empty config.
pub fn load_host_config(path: &Path) -> Result<HostConfig> {
    if !path.exists() {
        return Ok(HostConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Writes the host config via temp-then-rename. Returns `false` without
/// touching the file when the serialized form is byte-identical.
pub fn save_host_config(path: &Path, config: &HostConfig) -> Result<bool> {
    let mut payload =
        serde_json::to_string_pretty(config).context("failed to serialize host config")?;
    payload.push('\n');
    if path.exists() {
        if let Ok(existing) = std::fs::read_to_string(path) {
            if existing == payload {
                return Ok(false);
            }
        }
    }
    commit_text(path, &payload)?;
    Ok(true)
}

/// Parses a Slack binding scope into a host peer `(kind, uppercased id)`.
///
/// Accepts `channel:<id>` / `user:<id>` forms and bare Slack ids (`C…`/`G…`/
/// `D…` channels, `U…`/`W…` users). Names and wildcards are not peers.
pub fn parse_slack_peer(scope: &str) -> Option<HostPeer> {
    let trimmed = scope.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(id) = lowered.strip_prefix("channel:") {
        return valid_peer_id(id).map(|id| HostPeer {
            kind: "channel".to_string(),
            id,
        });
    }
    if let Some(id) = lowered.strip_prefix("user:") {
        return valid_peer_id(id).map(|id| HostPeer {
            kind: "user".to_string(),
            id,
        });
    }
    let bare = valid_peer_id(&lowered)?;
    match bare.chars().next() {
        Some('C' | 'G' | 'D') => Some(HostPeer {
            kind: "channel".to_string(),
            id: bare,
        }),
        Some('U' | 'W') => Some(HostPeer {
            kind: "user".to_string(),
            id: bare,
        }),
        _ => None,
    }
}

fn valid_peer_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parse_slack_peer_accepts_prefixed_and_bare_ids() {
        let peer = parse_slack_peer("channel:c01cl1pu022").expect("peer");
        assert_eq!(peer.kind, "channel");
        assert_eq!(peer.id, "C01CL1PU022");

        let peer = parse_slack_peer("U123ABC").expect("peer");
        assert_eq!(peer.kind, "user");
        assert_eq!(peer.id, "U123ABC");

        assert!(parse_slack_peer("#ops").is_none());
        assert!(parse_slack_peer("*").is_none());
        assert!(parse_slack_peer("slack:*").is_none());
    }

    #[test]
    fn functional_host_config_round_trip_preserves_unknown_fields() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("openclaw.json");
        std::fs::write(
            &path,
            r#"{
  "bindings": [
    {"agentId": "silent", "match": {"channel": "slack", "accountId": "kimfamily", "peer": {"kind": "channel", "id": "C1"}}, "note": "host-owned"}
  ],
  "agents": {"list": [], "defaults": {"model": {"primary": "gpt-test"}}},
  "channels": {"slack": {"accounts": {"kimfamily": {"mode": "http"}}}},
  "customTopLevel": true
}"#,
        )
        .expect("write config");

        let config = load_host_config(&path).expect("load");
        assert_eq!(config.bindings.len(), 1);
        assert_eq!(config.bindings[0].extra.get("note"), Some(&Value::from("host-owned")));
        assert_eq!(config.agents.default_model(), Some("gpt-test"));
        assert_eq!(config.extra.get("customTopLevel"), Some(&Value::Bool(true)));

        let wrote = save_host_config(&path, &config).expect("save");
        assert!(wrote);
        let reloaded = load_host_config(&path).expect("reload");
        assert_eq!(reloaded, config);
        // Byte-identical content is skipped.
        assert!(!save_host_config(&path, &reloaded).expect("save again"));
    }

    #[test]
    fn unit_missing_config_loads_as_empty() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config = load_host_config(&tempdir.path().join("missing.json")).expect("load");
        assert!(config.bindings.is_empty());
        assert!(config.agents.list.is_empty());
    }
}

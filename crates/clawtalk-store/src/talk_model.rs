//! Talk data model plus the validating normalizers applied on load.
//!
//! Every policy enum deserializes through an explicit `parse` that migrates
//! legacy spellings and maps anything unrecognized to the documented default,
//! so old on-disk data never fails a talk load. List entries missing required
//! fields are dropped by `normalize_loaded_talk` rather than failing the
//! whole talk.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const TOOL_NAME_PATTERN: &str = "^[A-Za-z0-9_.-]+$";
pub(crate) const TALK_SCHEMA_VERSION: u32 = 1;

macro_rules! string_enum_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Ok(Self::parse(&raw).unwrap_or_default())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `ExecutionMode` values.
pub enum ExecutionMode {
    #[default]
    Openclaw,
    FullControl,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openclaw => "openclaw",
            Self::FullControl => "full_control",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openclaw" | "sandboxed" | "inherit" => Some(Self::Openclaw),
            "full_control" | "unsandboxed" => Some(Self::FullControl),
            _ => None,
        }
    }
}
string_enum_serde!(ExecutionMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `FilesystemAccess` values.
pub enum FilesystemAccess {
    #[default]
    WorkspaceSandbox,
    FullHostAccess,
}

impl FilesystemAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceSandbox => "workspace_sandbox",
            Self::FullHostAccess => "full_host_access",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "workspace_sandbox" => Some(Self::WorkspaceSandbox),
            "full_host_access" => Some(Self::FullHostAccess),
            _ => None,
        }
    }
}
string_enum_serde!(FilesystemAccess);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `NetworkAccess` values.
pub enum NetworkAccess {
    #[default]
    Restricted,
    FullOutbound,
}

impl NetworkAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::FullOutbound => "full_outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "restricted" => Some(Self::Restricted),
            "full_outbound" => Some(Self::FullOutbound),
            _ => None,
        }
    }
}
string_enum_serde!(NetworkAccess);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `ToolMode` values.
pub enum ToolMode {
    Off,
    #[default]
    Confirm,
    Auto,
}

impl ToolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Confirm => "confirm",
            Self::Auto => "auto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "confirm" => Some(Self::Confirm),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}
string_enum_serde!(ToolMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `BindingPermission` values.
pub enum BindingPermission {
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl BindingPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read+write",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "read+write" | "readwrite" | "read_write" => Some(Self::ReadWrite),
            _ => None,
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}
string_enum_serde!(BindingPermission);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `ResponseMode` values.
pub enum ResponseMode {
    Off,
    #[default]
    Mentions,
    All,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Mentions => "mentions",
            Self::All => "all",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "mentions" => Some(Self::Mentions),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}
string_enum_serde!(ResponseMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `MirrorMode` values.
pub enum MirrorMode {
    #[default]
    Off,
    Inbound,
    Full,
}

impl MirrorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Inbound => "inbound",
            Self::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "inbound" => Some(Self::Inbound),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn mirrors_inbound(&self) -> bool {
        matches!(self, Self::Inbound | Self::Full)
    }
}
string_enum_serde!(MirrorMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `DeliveryMode` values.
pub enum DeliveryMode {
    Thread,
    Channel,
    #[default]
    Adaptive,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Channel => "channel",
            Self::Adaptive => "adaptive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "thread" => Some(Self::Thread),
            "channel" => Some(Self::Channel),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }
}
string_enum_serde!(DeliveryMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `TriggerPolicy` values.
pub enum TriggerPolicy {
    #[default]
    Judgment,
    StudyEntriesOnly,
    AdviceOrStudy,
}

impl TriggerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Judgment => "judgment",
            Self::StudyEntriesOnly => "study_entries_only",
            Self::AdviceOrStudy => "advice_or_study",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "judgment" => Some(Self::Judgment),
            "study_entries_only" => Some(Self::StudyEntriesOnly),
            "advice_or_study" => Some(Self::AdviceOrStudy),
            _ => None,
        }
    }
}
string_enum_serde!(TriggerPolicy);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `JobType` values.
pub enum JobType {
    #[default]
    Once,
    Recurring,
    Event,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Recurring => "recurring",
            Self::Event => "event",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "once" => Some(Self::Once),
            "recurring" => Some(Self::Recurring),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}
string_enum_serde!(JobType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    #[default]
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}
string_enum_serde!(MessageRole);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `JobReportStatus` values.
pub enum JobReportStatus {
    Success,
    Failure,
    #[default]
    Skipped,
}

impl JobReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}
string_enum_serde!(JobReportStatus);

#[derive(Debug, Clone, PartialEq, Default)]
/// Destination for a job's output once a run completes.
pub enum JobOutput {
    #[default]
    ReportOnly,
    Talk,
    Slack {
        channel_id: String,
        account_id: Option<String>,
        thread_ts: Option<String>,
    },
}

impl Serialize for JobOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            Self::ReportOnly => serde_json::json!({"type": "report_only"}),
            Self::Talk => serde_json::json!({"type": "talk"}),
            Self::Slack {
                channel_id,
                account_id,
                thread_ts,
            } => {
                let mut value = serde_json::json!({"type": "slack", "channelId": channel_id});
                if let Some(account_id) = account_id {
                    value["accountId"] = Value::String(account_id.clone());
                }
                if let Some(thread_ts) = thread_ts {
                    value["threadTs"] = Value::String(thread_ts.clone());
                }
                value
            }
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        Ok(match kind.as_str() {
            "talk" => Self::Talk,
            "slack" => {
                let channel_id = value
                    .get("channelId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if channel_id.is_empty() {
                    // Slack destination without a channel cannot deliver.
                    Self::ReportOnly
                } else {
                    Self::Slack {
                        channel_id,
                        account_id: value
                            .get("accountId")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        thread_ts: value
                            .get("threadTs")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }
                }
            }
            _ => Self::ReportOnly,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `TalkAgent` used across ClawTalk components.
pub struct TalkAgent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `Directive` used across ClawTalk components.
pub struct Directive {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Declares that a Talk is attached to a (platform, scope, account) tuple.
pub struct Binding {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_scope: Option<String>,
    #[serde(default)]
    pub permission: BindingPermission,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `ResponsePolicy` used across ClawTalk components.
pub struct ResponsePolicy {
    #[serde(default)]
    pub trigger_policy: TriggerPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_senders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Per-binding policy: response mode, mirroring, trigger policy, delivery.
pub struct Behavior {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub platform_binding_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<ResponseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_to_talk: Option<MirrorMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_message_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_policy: Option<ResponsePolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Scheduled or event-triggered unit of work owned by a Talk.
pub struct Job {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub output: JobOutput,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobReportStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One line of a Talk's append-only message log.
pub struct TalkMessage {
    pub id: String,
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One line of a Talk's append-only job-report log.
pub struct JobReport {
    pub job_id: String,
    pub run_at: u64,
    pub status: JobReportStatus,
    #[serde(default)]
    pub full_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_schema_version() -> u32 {
    TALK_SCHEMA_VERSION
}

fn default_talk_version() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Unit of conversational state: metadata, policy, bindings, jobs.
pub struct Talk {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    #[serde(default = "default_talk_version")]
    pub talk_version: u64,
    #[serde(default)]
    pub change_id: String,
    #[serde(default)]
    pub last_modified_at: u64,
    #[serde(default)]
    pub last_modified_by: String,
    #[serde(default)]
    pub topic_title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_auth_profile: Option<String>,
    #[serde(default)]
    pub agents: Vec<TalkAgent>,
    #[serde(default)]
    pub pinned_message_ids: Vec<String>,
    #[serde(default)]
    pub directives: Vec<Directive>,
    #[serde(default)]
    pub platform_bindings: Vec<Binding>,
    #[serde(default)]
    pub platform_behaviors: Vec<Behavior>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub filesystem_access: FilesystemAccess,
    #[serde(default)]
    pub network_access: NetworkAccess,
    #[serde(default)]
    pub tool_mode: ToolMode,
    #[serde(default)]
    pub tools_allow: Vec<String>,
    #[serde(default)]
    pub tools_deny: Vec<String>,
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Talk {
    /// Behavior attached to the given binding id, if any.
    pub fn behavior_for_binding(&self, binding_id: &str) -> Option<&Behavior> {
        self.platform_behaviors
            .iter()
            .find(|behavior| behavior.platform_binding_id == binding_id)
    }
}

/// Whitelisted mutable fields for `TalkStore::update`.
#[derive(Debug, Clone, Default)]
pub struct TalkPatch {
    pub topic_title: Option<String>,
    pub objective: Option<String>,
    pub model: Option<String>,
    pub agents: Option<Vec<TalkAgent>>,
    pub directives: Option<Vec<Directive>>,
    pub platform_bindings: Option<Vec<Binding>>,
    pub platform_behaviors: Option<Vec<Behavior>>,
    pub tool_mode: Option<ToolMode>,
    pub execution_mode: Option<ExecutionMode>,
    pub filesystem_access: Option<FilesystemAccess>,
    pub network_access: Option<NetworkAccess>,
    pub tools_allow: Option<Vec<String>>,
    pub tools_deny: Option<Vec<String>>,
    pub google_auth_profile: Option<Option<String>>,
}

/// True when `raw` is a valid path-safe talk id.
pub fn is_valid_talk_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}

fn is_valid_tool_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
}

/// Normalizes a Slack binding scope to its canonical comparison form.
///
/// `channel:<ID>` and `user:<ID>` become lowercase `kind:lowercased-id`;
/// everything else (wildcards, channel names, raw ids) is lowercased and
/// trimmed.
pub fn normalize_slack_scope(scope: &str) -> String {
    let lowered = scope.trim().to_ascii_lowercase();
    for kind in ["channel", "user"] {
        let prefix = format!("{kind}:");
        if let Some(id) = lowered.strip_prefix(prefix.as_str()) {
            return format!("{kind}:{}", id.trim());
        }
    }
    lowered
}

/// Filters a tool-name list down to valid names, deduplicated
/// case-insensitively while preserving first-seen spelling and order.
pub fn normalize_tool_names(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tools = Vec::new();
    for name in raw {
        let trimmed = name.trim();
        if !is_valid_tool_name(trimmed) {
            continue;
        }
        if seen.insert(trimmed.to_ascii_lowercase()) {
            tools.push(trimmed.to_string());
        }
    }
    tools
}

/// Applies the load-time tolerance rules in place: drops incomplete list
/// entries, dangling behaviors, and invalid tool names. Returns the count of
/// dropped entries for logging.
pub(crate) fn normalize_loaded_talk(talk: &mut Talk) -> usize {
    let mut dropped = 0_usize;

    let before = talk.directives.len();
    talk.directives
        .retain(|directive| !directive.id.trim().is_empty() && !directive.text.trim().is_empty());
    dropped += before - talk.directives.len();

    let before = talk.platform_bindings.len();
    talk.platform_bindings.retain(|binding| {
        !binding.id.trim().is_empty()
            && !binding.platform.trim().is_empty()
            && !binding.scope.trim().is_empty()
    });
    dropped += before - talk.platform_bindings.len();

    let binding_ids = talk
        .platform_bindings
        .iter()
        .map(|binding| binding.id.clone())
        .collect::<HashSet<_>>();
    let before = talk.platform_behaviors.len();
    talk.platform_behaviors.retain(|behavior| {
        !behavior.id.trim().is_empty() && binding_ids.contains(&behavior.platform_binding_id)
    });
    dropped += before - talk.platform_behaviors.len();

    let before = talk.jobs.len();
    talk.jobs
        .retain(|job| !job.id.trim().is_empty() && !job.schedule.trim().is_empty());
    dropped += before - talk.jobs.len();

    talk.tools_allow = normalize_tool_names(&talk.tools_allow);
    talk.tools_deny = normalize_tool_names(&talk.tools_deny);
    talk.talk_version = talk.talk_version.max(1);

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_execution_mode_migrates_legacy_values() {
        let full: ExecutionMode = serde_json::from_str("\"unsandboxed\"").expect("decode");
        assert_eq!(full, ExecutionMode::FullControl);
        let open: ExecutionMode = serde_json::from_str("\"sandboxed\"").expect("decode");
        assert_eq!(open, ExecutionMode::Openclaw);
        let inherit: ExecutionMode = serde_json::from_str("\"inherit\"").expect("decode");
        assert_eq!(inherit, ExecutionMode::Openclaw);
    }

    #[test]
    fn regression_unknown_enum_values_fall_back_to_defaults() {
        let mode: ExecutionMode = serde_json::from_str("\"turbo\"").expect("decode");
        assert_eq!(mode, ExecutionMode::Openclaw);
        let tool_mode: ToolMode = serde_json::from_str("\"yolo\"").expect("decode");
        assert_eq!(tool_mode, ToolMode::Confirm);
        let response: ResponseMode = serde_json::from_str("\"sometimes\"").expect("decode");
        assert_eq!(response, ResponseMode::Mentions);
        let delivery: DeliveryMode = serde_json::from_str("\"carrier-pigeon\"").expect("decode");
        assert_eq!(delivery, DeliveryMode::Adaptive);
    }

    #[test]
    fn regression_enum_parse_is_idempotent_over_canonical_forms() {
        for raw in ["openclaw", "full_control"] {
            let parsed = ExecutionMode::parse(raw).expect("parse");
            assert_eq!(ExecutionMode::parse(parsed.as_str()), Some(parsed));
        }
        for raw in ["read", "write", "read+write"] {
            let parsed = BindingPermission::parse(raw).expect("parse");
            assert_eq!(BindingPermission::parse(parsed.as_str()), Some(parsed));
        }
        for raw in ["judgment", "study_entries_only", "advice_or_study"] {
            let parsed = TriggerPolicy::parse(raw).expect("parse");
            assert_eq!(TriggerPolicy::parse(parsed.as_str()), Some(parsed));
        }
    }

    #[test]
    fn unit_binding_permission_round_trips_plus_form() {
        let encoded = serde_json::to_string(&BindingPermission::ReadWrite).expect("encode");
        assert_eq!(encoded, "\"read+write\"");
        let decoded: BindingPermission = serde_json::from_str("\"read+write\"").expect("decode");
        assert!(decoded.can_write());
        assert!(!BindingPermission::Read.can_write());
    }

    #[test]
    fn unit_normalize_slack_scope_canonicalizes_kinds() {
        assert_eq!(normalize_slack_scope("Channel:C123ABC"), "channel:c123abc");
        assert_eq!(normalize_slack_scope("USER:U99"), "user:u99");
        assert_eq!(normalize_slack_scope("  Slack:*  "), "slack:*");
        assert_eq!(normalize_slack_scope("#General"), "#general");
    }

    #[test]
    fn regression_normalize_slack_scope_is_idempotent() {
        for raw in ["Channel:C123", "user:U1", "*", "ALL", "#ops", "slack:*"] {
            let once = normalize_slack_scope(raw);
            assert_eq!(normalize_slack_scope(&once), once);
        }
    }

    #[test]
    fn unit_tool_name_lists_filter_and_dedup_case_insensitively() {
        let tools = normalize_tool_names(&[
            "state_append_event".to_string(),
            "State_Append_Event".to_string(),
            "web search".to_string(),
            "google_docs.append".to_string(),
            "".to_string(),
        ]);
        assert_eq!(
            tools,
            vec![
                "state_append_event".to_string(),
                "google_docs.append".to_string()
            ]
        );
    }

    #[test]
    fn functional_normalize_loaded_talk_drops_dangling_behaviors() {
        let mut talk: Talk = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "platformBindings": [
                {"id": "b1", "platform": "slack", "scope": "channel:C1", "permission": "write"},
                {"id": "", "platform": "slack", "scope": "channel:C2"}
            ],
            "platformBehaviors": [
                {"id": "x1", "platformBindingId": "b1"},
                {"id": "x2", "platformBindingId": "gone"}
            ],
            "jobs": [
                {"id": "j1", "type": "recurring", "schedule": "0 0 9 * * *"},
                {"id": "", "type": "once", "schedule": ""}
            ]
        }))
        .expect("decode talk");
        let dropped = normalize_loaded_talk(&mut talk);
        assert_eq!(talk.platform_bindings.len(), 1);
        assert_eq!(talk.platform_behaviors.len(), 1);
        assert_eq!(talk.jobs.len(), 1);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn unit_talk_id_validation_is_path_safe() {
        assert!(is_valid_talk_id("talk-1_A"));
        assert!(!is_valid_talk_id("talk/1"));
        assert!(!is_valid_talk_id(""));
        assert!(!is_valid_talk_id("a b"));
    }

    #[test]
    fn unit_job_output_is_a_tagged_sum_type() {
        let slack: JobOutput = serde_json::from_value(serde_json::json!({
            "type": "slack",
            "channelId": "C9",
            "accountId": "kimfamily"
        }))
        .expect("decode");
        match slack {
            JobOutput::Slack {
                channel_id,
                account_id,
                thread_ts,
            } => {
                assert_eq!(channel_id, "C9");
                assert_eq!(account_id.as_deref(), Some("kimfamily"));
                assert!(thread_ts.is_none());
            }
            other => panic!("unexpected output {other:?}"),
        }
        let report: JobOutput =
            serde_json::from_value(serde_json::json!({"type": "report_only"})).expect("decode");
        assert_eq!(report, JobOutput::ReportOnly);
    }

    #[test]
    fn regression_slack_output_without_channel_degrades_to_report_only() {
        let output: JobOutput =
            serde_json::from_value(serde_json::json!({"type": "slack"})).expect("decode");
        assert_eq!(output, JobOutput::ReportOnly);
    }
}

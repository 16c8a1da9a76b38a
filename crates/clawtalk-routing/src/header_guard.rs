//! Execution-mode invariants enforced on outbound request headers.
//!
//! In `full_control` the request must reach the host as a transparent proxy
//! call: no managed-agent header and no `agent:`-prefixed session key. A
//! violation fails the originating operation; headers are never silently
//! stripped.

use std::collections::HashMap;

use clawtalk_store::ExecutionMode;
use thiserror::Error;

pub const AGENT_ID_HEADER: &str = "x-openclaw-agent-id";
pub const SESSION_KEY_HEADER: &str = "x-openclaw-session-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `RoutingFlow` values.
pub enum RoutingFlow {
    TalkChat,
    SlackIngress,
    JobScheduler,
}

impl RoutingFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TalkChat => "talk-chat",
            Self::SlackIngress => "slack-ingress",
            Self::JobScheduler => "job-scheduler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Typed guard violation carrying the flow and mode for diagnostics.
pub enum RoutingGuardError {
    #[error(
        "ROUTING_GUARD_FORBIDDEN_AGENT_HEADER: x-openclaw-agent-id must not be set (flow={flow_name}, mode={mode_name})",
        flow_name = .flow.as_str(),
        mode_name = .mode.as_str()
    )]
    ForbiddenAgentHeader {
        flow: RoutingFlow,
        mode: ExecutionMode,
    },
    #[error(
        "ROUTING_GUARD_FORBIDDEN_SESSION_KEY: x-openclaw-session-key must not start with 'agent:' (flow={flow_name}, mode={mode_name})",
        flow_name = .flow.as_str(),
        mode_name = .mode.as_str()
    )]
    ForbiddenSessionKey {
        flow: RoutingFlow,
        mode: ExecutionMode,
    },
}

impl RoutingGuardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ForbiddenAgentHeader { .. } => "ROUTING_GUARD_FORBIDDEN_AGENT_HEADER",
            Self::ForbiddenSessionKey { .. } => "ROUTING_GUARD_FORBIDDEN_SESSION_KEY",
        }
    }
}

/// Asserts the execution-mode header invariants on an outbound request.
pub fn assert_routing_headers(
    flow: RoutingFlow,
    mode: ExecutionMode,
    headers: &HashMap<String, String>,
) -> Result<(), RoutingGuardError> {
    if mode != ExecutionMode::FullControl {
        return Ok(());
    }

    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    };

    if lookup(AGENT_ID_HEADER).is_some() {
        return Err(RoutingGuardError::ForbiddenAgentHeader { flow, mode });
    }
    if let Some(session_key) = lookup(SESSION_KEY_HEADER) {
        if session_key.trim_start().starts_with("agent:") {
            return Err(RoutingGuardError::ForbiddenSessionKey { flow, mode });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn unit_full_control_rejects_agent_id_header() {
        let error = assert_routing_headers(
            RoutingFlow::TalkChat,
            ExecutionMode::FullControl,
            &headers(&[("x-openclaw-agent-id", "a1")]),
        )
        .expect_err("agent header forbidden");
        assert_eq!(error.code(), "ROUTING_GUARD_FORBIDDEN_AGENT_HEADER");
        assert!(error.to_string().contains("flow=talk-chat"));
        assert!(error.to_string().contains("mode=full_control"));
    }

    #[test]
    fn unit_full_control_rejects_agent_prefixed_session_key() {
        let error = assert_routing_headers(
            RoutingFlow::TalkChat,
            ExecutionMode::FullControl,
            &headers(&[("x-openclaw-session-key", "agent:main:foo")]),
        )
        .expect_err("agent session key forbidden");
        assert_eq!(error.code(), "ROUTING_GUARD_FORBIDDEN_SESSION_KEY");
    }

    #[test]
    fn unit_full_control_accepts_talk_and_job_session_keys() {
        for key in [
            "talk:clawtalk:talk:abc:slack:channel:C123",
            "job:clawtalk:job:daily",
        ] {
            assert_routing_headers(
                RoutingFlow::JobScheduler,
                ExecutionMode::FullControl,
                &headers(&[("x-openclaw-session-key", key)]),
            )
            .expect("permitted session key");
        }
    }

    #[test]
    fn unit_openclaw_mode_permits_agent_headers() {
        assert_routing_headers(
            RoutingFlow::SlackIngress,
            ExecutionMode::Openclaw,
            &headers(&[
                ("x-openclaw-agent-id", "ct-abc12345"),
                ("x-openclaw-session-key", "agent:ct-abc12345:slack"),
            ]),
        )
        .expect("openclaw mode is unrestricted");
    }

    #[test]
    fn regression_header_lookup_is_case_insensitive() {
        let error = assert_routing_headers(
            RoutingFlow::TalkChat,
            ExecutionMode::FullControl,
            &headers(&[("X-OpenClaw-Agent-Id", "a1")]),
        )
        .expect_err("case-insensitive match");
        assert_eq!(error.code(), "ROUTING_GUARD_FORBIDDEN_AGENT_HEADER");
    }
}

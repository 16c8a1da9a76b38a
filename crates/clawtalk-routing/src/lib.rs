//! Routing and ownership resolution for Slack-bound Talks.
//!
//! Resolves each inbound event to an owning Talk (or a documented pass
//! reason), deduplicates redeliveries, guards outbound request headers, and
//! reconciles Talk bindings into the host configuration at startup.

mod dedup_table;
mod header_guard;
mod host_config;
mod ownership_doctor;
mod reconciler;
mod routing_resolver;

pub use dedup_table::{compose_event_id, CachedDecision, DedupTable, DEFAULT_DEDUP_TTL_MS};
pub use header_guard::{assert_routing_headers, RoutingFlow, RoutingGuardError};
pub use host_config::{
    load_host_config, parse_slack_peer, save_host_config, HostAgent, HostBinding,
    HostBindingMatch, HostConfig, HostPeer, HostSlackAccount,
};
pub use ownership_doctor::{detect_ownership_conflicts, OwnershipConflict};
pub use reconciler::{reconcile_host_config, managed_agent_id, ReconcileReport};
pub use routing_resolver::{
    resolve_slack_event, RouteDecision, RouteOutcome, SlackIngressEvent, PASS_AMBIGUOUS_BINDING,
    PASS_DELEGATED_TO_AGENT, PASS_MENTION_REQUIRED, PASS_NO_BINDING, PASS_ON_MESSAGE_DISABLED,
    PASS_SENDER_NOT_ALLOWED, PASS_TRIGGER_POLICY_REJECTED,
};

//! Signature-verified front door for Slack events.
//!
//! The handler does synchronous verify + parse + route, then replies inside
//! Slack's 3-second ack budget; host forwarding and the in-process pipeline
//! are dispatched as detached tasks and never block the ack.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use clawtalk_core::current_unix_timestamp_ms;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::host_forwarder::{forward_to_host, resolve_host_webhook_url, ForwardHeaders};
use crate::signature::{verify_slack_signature, SignatureRejection};
use crate::GatewayState;
use clawtalk_routing::{RouteOutcome, SlackIngressEvent};

pub(crate) const SLACK_EVENTS_ENDPOINT: &str = "/slack/events";
pub(crate) const INGRESS_API_ENDPOINT: &str = "/api/events/slack";
pub(crate) const HEALTHZ_ENDPOINT: &str = "/healthz";
pub(crate) const MAX_EVENT_BODY_BYTES: usize = 512 * 1024;

#[derive(Debug, Deserialize, Default)]
struct SlackEventEnvelope {
    #[serde(rename = "type", default)]
    payload_type: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event: Option<SlackEventBody>,
}

#[derive(Debug, Deserialize, Default)]
struct SlackEventBody {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

impl SlackEventBody {
    fn is_bot_message(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Spawns the fire-and-forget host forward for the raw event.
fn spawn_host_forward(state: &Arc<GatewayState>, account_id: &str, body: Bytes, headers: &HeaderMap) {
    let forward_headers = ForwardHeaders {
        content_type: header_value(headers, "content-type"),
        slack_signature: header_value(headers, "x-slack-signature"),
        slack_request_timestamp: header_value(headers, "x-slack-request-timestamp"),
    };
    let account_webhook_path = state
        .host_config
        .channels
        .slack
        .accounts
        .get(account_id)
        .and_then(|account| account.webhook_path.clone());
    let url = resolve_host_webhook_url(
        state.env_webhook_override.as_deref(),
        state.forward_url_override.as_deref(),
        account_webhook_path.as_deref(),
        state.env_http_port.as_deref(),
    );
    let http = state.http.clone();
    tokio::spawn(async move {
        match forward_to_host(&http, &url, body.to_vec(), &forward_headers).await {
            Ok(status) => {
                if status >= 400 {
                    eprintln!("host forward answered {status}: url={url}");
                }
            }
            Err(error) => {
                eprintln!("host forward failed: url={url} error={error}");
            }
        }
    });
}

/// `POST /slack/events` — Slack's Events API webhook.
pub(crate) async fn handle_slack_events(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let timestamp = header_value(&headers, "x-slack-request-timestamp").unwrap_or_default();
    let signature = header_value(&headers, "x-slack-signature").unwrap_or_default();
    let now_unix_seconds = current_unix_timestamp_ms() / 1_000;
    let account_id = match verify_slack_signature(
        &state.secrets,
        &body,
        &timestamp,
        &signature,
        now_unix_seconds,
    ) {
        Ok(account_id) => account_id,
        Err(SignatureRejection::NoSecretsConfigured) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "no signing secret configured"})),
            );
        }
        Err(rejection) => {
            tracing::warn!(?rejection, "rejected slack event signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "signature verification failed"})),
            );
        }
    };

    let Ok(envelope) = serde_json::from_slice::<SlackEventEnvelope>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "malformed event payload"})),
        );
    };

    if envelope.payload_type == "url_verification" {
        return (
            StatusCode::OK,
            Json(json!({"challenge": envelope.challenge.unwrap_or_default()})),
        );
    }

    if envelope.payload_type != "event_callback" {
        spawn_host_forward(&state, &account_id, body, &headers);
        return (
            StatusCode::OK,
            Json(json!({"ok": true, "forwarded": true})),
        );
    }

    let event = envelope.event.unwrap_or_default();
    if event.is_bot_message() {
        spawn_host_forward(&state, &account_id, body, &headers);
        return (
            StatusCode::OK,
            Json(json!({"ok": true, "skipped": "bot_message"})),
        );
    }
    if !matches!(event.event_type.as_str(), "message" | "app_mention") {
        spawn_host_forward(&state, &account_id, body, &headers);
        return (
            StatusCode::OK,
            Json(json!({"ok": true, "forwarded": true})),
        );
    }

    let ingress_event = SlackIngressEvent {
        event_id: envelope.event_id,
        account_id: Some(account_id.clone()),
        channel_id: event.channel.unwrap_or_default(),
        channel_name: None,
        thread_ts: event.thread_ts,
        message_ts: event.ts,
        user_id: event.user,
        user_name: None,
        outbound_target: None,
        text: event.text.unwrap_or_default(),
    };
    let outcome = state.ingress.process(&ingress_event);

    let owned_by_talk = outcome.decision.reason.as_deref()
        == Some(clawtalk_routing::PASS_DELEGATED_TO_AGENT)
        || outcome.decision.decision == RouteOutcome::Handled;
    if owned_by_talk {
        (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "routed": "clawtalk",
                "talkId": outcome.decision.talk_id,
            })),
        )
    } else {
        spawn_host_forward(&state, &account_id, body, &headers);
        (
            StatusCode::OK,
            Json(json!({"ok": true, "routed": "openclaw"})),
        )
    }
}

/// `POST /api/events/slack` — internal re-enqueue and test surface.
pub(crate) async fn handle_ingress_api(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Ok(event) = serde_json::from_slice::<SlackIngressEvent>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "malformed ingress event"})),
        );
    };
    if event.channel_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "channelId is required"})),
        );
    }
    let outcome = state.ingress.process(&event);
    let mut payload = json!({
        "decision": outcome.decision.decision.as_str(),
        "duplicate": outcome.duplicate,
    });
    if let Some(reason) = outcome.decision.reason.as_deref() {
        payload["reason"] = Value::String(reason.to_string());
    }
    if let Some(talk_id) = outcome.decision.talk_id.as_deref() {
        payload["talkId"] = Value::String(talk_id.to_string());
    }
    (StatusCode::OK, Json(payload))
}

/// `GET /healthz` — minimal liveness surface.
pub(crate) async fn handle_healthz(
    State(state): State<Arc<GatewayState>>,
) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "talks": state.store.list().len(),
            "uptimeMs": current_unix_timestamp_ms().saturating_sub(state.started_unix_ms),
        })),
    )
}

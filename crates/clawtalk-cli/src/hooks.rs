//! HTTP bindings for the host's hook surface.
//!
//! `message_received` fans out to event jobs (fire-and-forget: the host
//! ignores the return value, so nothing here can cancel downstream
//! processing). `before_agent_start` hands back the talk context block for
//! managed `ct-*` agent ids.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use clawtalk_jobs::{EventDispatcher, HookContext, MessageReceivedEvent};
use clawtalk_routing::managed_agent_id;
use clawtalk_store::{build_talk_context_block, TalkStore};
use serde::Deserialize;
use serde_json::{json, Value};

pub const MESSAGE_RECEIVED_ENDPOINT: &str = "/api/hooks/message-received";
pub const BEFORE_AGENT_START_ENDPOINT: &str = "/api/hooks/before-agent-start";

pub struct HookState {
    pub store: Arc<TalkStore>,
    pub dispatcher: Arc<EventDispatcher>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MessageReceivedBody {
    #[serde(default)]
    event: HookEventBody,
    #[serde(default)]
    ctx: HookCtxBody,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HookEventBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    source_scope: Option<String>,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HookCtxBody {
    // Platform name by host contract, never a channel id.
    #[serde(default)]
    channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeforeAgentStartBody {
    agent_id: String,
}

async fn handle_message_received(
    State(state): State<Arc<HookState>>,
    Json(body): Json<MessageReceivedBody>,
) -> (StatusCode, Json<Value>) {
    let dispatcher = Arc::clone(&state.dispatcher);
    let event = MessageReceivedEvent {
        text: body.event.text,
        from: body.event.from,
        source_scope: body.event.source_scope,
        timestamp: body.event.timestamp,
    };
    let ctx = HookContext {
        channel_id: body.ctx.channel_id,
    };
    tokio::spawn(async move {
        dispatcher.handle_message_received(&event, &ctx).await;
    });
    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn handle_before_agent_start(
    State(state): State<Arc<HookState>>,
    Json(body): Json<BeforeAgentStartBody>,
) -> (StatusCode, Json<Value>) {
    let agent_id = body.agent_id.trim();
    if !agent_id.starts_with("ct-") {
        return (StatusCode::OK, Json(json!({"ok": true, "contextBlock": null})));
    }
    let talk = state
        .store
        .list()
        .into_iter()
        .find(|talk| managed_agent_id(&talk.id) == agent_id);
    let Some(talk) = talk else {
        return (StatusCode::OK, Json(json!({"ok": true, "contextBlock": null})));
    };

    let context_document = state.store.context(&talk.id).unwrap_or_default();
    let mut pinned = Vec::new();
    for pin in &talk.pinned_message_ids {
        match state.store.get_message(&talk.id, pin) {
            Ok(Some(message)) => pinned.push(message),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(talk_id = %talk.id, %error, "failed to load pinned message");
            }
        }
    }
    let block = build_talk_context_block(&talk, &context_document, &pinned);
    (
        StatusCode::OK,
        Json(json!({"ok": true, "contextBlock": block})),
    )
}

pub fn build_hooks_router(state: Arc<HookState>) -> Router {
    Router::new()
        .route(MESSAGE_RECEIVED_ENDPOINT, post(handle_message_received))
        .route(BEFORE_AGENT_START_ENDPOINT, post(handle_before_agent_start))
        .with_state(state)
}

//! Slack event proxy and in-process ingress pipeline.
//!
//! Terminates the Slack webhook, verifies signatures against the configured
//! account secrets, and classifies every event as talk-routed or forwarded
//! to the host. The ingress pipeline itself never calls the LLM.

mod host_forwarder;
mod signature;
mod slack_event_proxy;
mod slack_ingress;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clawtalk_core::current_unix_timestamp_ms;
use clawtalk_routing::{DedupTable, HostConfig};
use clawtalk_store::TalkStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub use host_forwarder::{
    forward_to_host, resolve_host_webhook_url, ForwardHeaders, ENV_OPENCLAW_HTTP_PORT,
    ENV_WEBHOOK_URL_OVERRIDE,
};
pub use signature::{
    assemble_signing_secrets, sign_slack_payload, verify_slack_signature, SignatureRejection,
    SigningSecret, ENV_GATEWAY_SIGNING_SECRET, ENV_SLACK_SIGNING_SECRET,
    SIGNATURE_MAX_SKEW_SECONDS,
};
pub use slack_ingress::{IngressOutcome, SlackIngress};

use slack_event_proxy::{
    handle_healthz, handle_ingress_api, handle_slack_events, HEALTHZ_ENDPOINT,
    INGRESS_API_ENDPOINT, MAX_EVENT_BODY_BYTES, SLACK_EVENTS_ENDPOINT,
};

#[derive(Clone)]
/// Runtime configuration for the gateway server.
pub struct GatewayConfig {
    pub store: Arc<TalkStore>,
    pub host_config: HostConfig,
    pub bind: String,
    pub forward_url_override: Option<String>,
    pub env_webhook_override: Option<String>,
    pub env_http_port: Option<String>,
    pub env_gateway_secret: Option<String>,
    pub env_slack_secret: Option<String>,
}

/// Shared state behind the gateway router.
pub struct GatewayState {
    pub(crate) ingress: SlackIngress,
    pub(crate) secrets: Vec<SigningSecret>,
    pub(crate) http: reqwest::Client,
    pub(crate) host_config: HostConfig,
    pub(crate) forward_url_override: Option<String>,
    pub(crate) env_webhook_override: Option<String>,
    pub(crate) env_http_port: Option<String>,
    pub(crate) store: Arc<TalkStore>,
    pub(crate) started_unix_ms: u64,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let secrets = assemble_signing_secrets(
            &config.host_config,
            config.env_gateway_secret.as_deref(),
            config.env_slack_secret.as_deref(),
        );
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create gateway http client")?;
        Ok(Self {
            ingress: SlackIngress::new(
                Arc::clone(&config.store),
                Arc::new(DedupTable::default()),
            ),
            secrets,
            http,
            host_config: config.host_config,
            forward_url_override: config.forward_url_override,
            env_webhook_override: config.env_webhook_override,
            env_http_port: config.env_http_port,
            store: config.store,
            started_unix_ms: current_unix_timestamp_ms(),
        })
    }

    pub fn ingress(&self) -> &SlackIngress {
        &self.ingress
    }
}

/// Builds the gateway router over shared state.
pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(SLACK_EVENTS_ENDPOINT, post(handle_slack_events))
        .route(INGRESS_API_ENDPOINT, post(handle_ingress_api))
        .route(HEALTHZ_ENDPOINT, get(handle_healthz))
        .layer(DefaultBodyLimit::max(MAX_EVENT_BODY_BYTES))
        .with_state(state)
}

/// Runs the gateway until the shutdown signal flips.
pub async fn run_gateway_server(
    config: GatewayConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", config.bind))?;
    let state = Arc::new(GatewayState::new(config)?);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    println!(
        "clawtalk gateway listening: endpoint={SLACK_EVENTS_ENDPOINT} addr={local_addr}"
    );

    let app = build_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await
        .context("gateway server exited unexpectedly")
}

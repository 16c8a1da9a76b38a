//! ClawTalk process entry: wires the store, routing, scheduler, dispatcher,
//! and gateway together and serves until shutdown.

mod cli_args;
mod hooks;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use clawtalk_affinity::affinity_store_for;
use clawtalk_gateway::{
    build_gateway_router, GatewayConfig, GatewayState, ENV_GATEWAY_SIGNING_SECRET,
    ENV_OPENCLAW_HTTP_PORT, ENV_SLACK_SIGNING_SECRET, ENV_WEBHOOK_URL_OVERRIDE,
};
use clawtalk_jobs::{
    run_job_scheduler, EventDispatcher, EventDispatcherConfig, HttpPromptClient, JobExecutor,
    JobSchedulerConfig, ReplyDelivery, SlackSender, TalkPromptClient, TalkRunSet,
};
use clawtalk_routing::{
    detect_ownership_conflicts, load_host_config, managed_agent_id, reconcile_host_config,
};
use clawtalk_store::TalkStore;
use serde_json::json;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use cli_args::CliArgs;
use hooks::{build_hooks_router, HookState};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn home_dir() -> Result<PathBuf> {
    env_nonempty("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set; pass --data-dir explicitly"))
}

fn default_prompt_endpoint(env_http_port: Option<&str>) -> String {
    let port = env_http_port
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(3000);
    format!("http://127.0.0.1:{port}/v1/talk-prompts")
}

fn default_slack_send_endpoint(env_http_port: Option<&str>) -> String {
    let port = env_http_port
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(3000);
    format!("http://127.0.0.1:{port}/api/slack/send-message")
}

/// Delivers Slack-bound output through the host, which owns the outbound
/// Slack path.
struct HostSlackSender {
    http: reqwest::Client,
    endpoint: String,
}

#[async_trait]
impl SlackSender for HostSlackSender {
    async fn send_message(
        &self,
        account_id: Option<&str>,
        channel_id: &str,
        thread_ts: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let payload = json!({
            "accountId": account_id,
            "channelId": channel_id,
            "threadTs": thread_ts,
            "message": message,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .context("slack send request failed")?;
        if !response.status().is_success() {
            bail!("slack send answered status {}", response.status().as_u16());
        }
        Ok(())
    }
}

/// Event-job replies go back to the triggering scope through the host.
struct ScopeReplyDelivery {
    sender: Arc<HostSlackSender>,
}

#[async_trait]
impl ReplyDelivery for ScopeReplyDelivery {
    async fn deliver(&self, _talk_id: &str, scope: &str, message: &str) -> Result<()> {
        let channel_id = scope
            .trim()
            .strip_prefix("channel:")
            .unwrap_or(scope.trim())
            .to_string();
        self.sender
            .send_message(None, &channel_id, None, message)
            .await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();

    let data_dir = match args.data_dir.clone() {
        Some(dir) => dir,
        None => home_dir()?.join(".clawtalk"),
    };
    // Startup fails hard when the data dir is unusable.
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    let store = Arc::new(TalkStore::open(&data_dir)?);
    println!(
        "clawtalk store loaded: talks={} data_dir={}",
        store.list().len(),
        data_dir.display()
    );

    let env_gateway_secret = env_nonempty(ENV_GATEWAY_SIGNING_SECRET);
    let env_slack_secret = env_nonempty(ENV_SLACK_SIGNING_SECRET);
    let env_webhook_override = env_nonempty(ENV_WEBHOOK_URL_OVERRIDE);
    let env_http_port = env_nonempty(ENV_OPENCLAW_HTTP_PORT);

    let host_config_path = match args.openclaw_config.clone() {
        Some(path) => path,
        None => home_dir()?.join(".openclaw").join("openclaw.json"),
    };
    if !args.skip_reconcile {
        let talks = store.list();
        let env_secret = env_gateway_secret
            .as_deref()
            .or(env_slack_secret.as_deref());
        match reconcile_host_config(&host_config_path, &talks, env_secret) {
            Ok(report) => {
                println!(
                    "routing reconciled: desired={} retained={} agents={} wrote={}",
                    report.desired_bindings,
                    report.retained_bindings,
                    report.managed_agents,
                    report.wrote_file
                );
            }
            Err(error) => {
                eprintln!("routing reconciliation failed: {error}");
            }
        }
    }

    let host_config = load_host_config(&host_config_path).unwrap_or_else(|error| {
        eprintln!("failed to load host config: {error}");
        Default::default()
    });

    let talks = store.list();
    let mut managed_ids = talks
        .iter()
        .map(|talk| managed_agent_id(&talk.id))
        .collect::<Vec<_>>();
    managed_ids.push("clawtalk".to_string());
    for conflict in detect_ownership_conflicts(&talks, &host_config, &managed_ids) {
        tracing::warn!(
            talk_id = %conflict.talk_id,
            scope = %conflict.talk_scope,
            agent_id = %conflict.open_claw_agent_id,
            "talk binding conflicts with a host-owned binding"
        );
    }

    let affinity = affinity_store_for(&data_dir);
    let prompt_endpoint = args
        .prompt_endpoint
        .clone()
        .unwrap_or_else(|| default_prompt_endpoint(env_http_port.as_deref()));
    let prompt_client: Arc<dyn TalkPromptClient> =
        Arc::new(HttpPromptClient::new(prompt_endpoint)?);
    let slack_sender = Arc::new(HostSlackSender {
        http: reqwest::Client::builder()
            .build()
            .context("failed to create slack sender client")?,
        endpoint: args
            .slack_send_endpoint
            .clone()
            .unwrap_or_else(|| default_slack_send_endpoint(env_http_port.as_deref())),
    });
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        affinity,
        prompt_client,
        Some(Arc::clone(&slack_sender) as Arc<dyn SlackSender>),
        args.base_timeout_ms,
        args.min_timeout_ms,
        Some(args.state_backend.clone()),
    ));
    let run_set = TalkRunSet::new();
    let dispatcher = Arc::new(EventDispatcher::new(EventDispatcherConfig {
        store: Arc::clone(&store),
        executor: Arc::clone(&executor),
        run_set: Arc::clone(&run_set),
        debounce_ms: EventDispatcher::debounce_ms_from_env(),
        reply: Some(Arc::new(ScopeReplyDelivery {
            sender: slack_sender,
        }) as Arc<dyn ReplyDelivery>),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(run_job_scheduler(JobSchedulerConfig {
        executor: Arc::clone(&executor),
        store: Arc::clone(&store),
        run_set,
        tick_interval: Duration::from_secs(args.tick_interval_seconds),
        shutdown: shutdown_rx.clone(),
    }));

    let gateway_state = Arc::new(GatewayState::new(GatewayConfig {
        store: Arc::clone(&store),
        host_config,
        bind: args.bind.clone(),
        forward_url_override: args.forward_url.clone(),
        env_webhook_override,
        env_http_port,
        env_gateway_secret,
        env_slack_secret,
    })?);
    let hooks_state = Arc::new(HookState {
        store: Arc::clone(&store),
        dispatcher,
    });
    let app = build_gateway_router(gateway_state).merge(build_hooks_router(hooks_state));

    let bind_addr = args
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{}'", args.bind))?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    println!(
        "clawtalk gateway listening: addr={}",
        listener
            .local_addr()
            .context("failed to resolve bound address")?
    );

    let mut serve_shutdown = shutdown_rx.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("clawtalk shutdown requested");
                }
                _ = serve_shutdown.changed() => {}
            }
        })
        .await;

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    serve_result.context("gateway server exited unexpectedly")
}

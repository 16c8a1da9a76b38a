//! Shared per-job execution routine used by the cron scheduler and the
//! event dispatcher.
//!
//! A run flips the talk's processing hint, classifies intent, prunes the
//! tool set through the affinity store, assembles guard-checked headers,
//! invokes the LLM with the adaptive timeout, and records exactly one
//! observation and one report before delivering output.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clawtalk_affinity::{
    compute_affinity_timeout, compute_cold_start_baseline, AffinityObservation, ToolAffinityStore,
};
use clawtalk_core::{classify_intent, current_unix_timestamp_ms, Intent};
use clawtalk_routing::{assert_routing_headers, managed_agent_id, RoutingFlow};
use clawtalk_store::{
    ExecutionMode, FilesystemAccess, Job, JobOutput, JobReport, JobReportStatus, MessageRole,
    NetworkAccess, Talk, TalkStore, ToolMode,
};
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_BASE_TIMEOUT_MS: u64 = 240_000;
const RETRY_MAX_ATTEMPTS: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Builtin tool catalog with the capability each entry depends on.
const TOOL_CATALOG: &[(&str, ToolCapability)] = &[
    ("state_append_event", ToolCapability::None),
    ("state_read_summary", ToolCapability::None),
    ("google_docs_append", ToolCapability::Network),
    ("web_search", ToolCapability::Network),
    ("code_exec", ToolCapability::HostFilesystem),
    ("file_read", ToolCapability::None),
    ("file_write", ToolCapability::None),
    ("schedule_job", ToolCapability::None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolCapability {
    None,
    Network,
    HostFilesystem,
}

#[derive(Debug, Clone, PartialEq)]
/// Outbound prompt request handed to the host client.
pub struct PromptRequest {
    pub prompt: String,
    pub model: String,
    pub tools: Vec<String>,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Host reply: the generated text plus which tools were actually used.
pub struct PromptResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub used_tools: Vec<String>,
}

#[async_trait]
/// Trait contract for the LLM invocation boundary.
pub trait TalkPromptClient: Send + Sync {
    async fn run_prompt(&self, request: PromptRequest) -> Result<PromptResponse>;
}

#[async_trait]
/// Trait contract for delivering job output to Slack.
pub trait SlackSender: Send + Sync {
    async fn send_message(
        &self,
        account_id: Option<&str>,
        channel_id: &str,
        thread_ts: Option<&str>,
        message: &str,
    ) -> Result<()>;
}

/// HTTP client against the host's prompt endpoint, with bounded retry on
/// retryable statuses and transport errors.
pub struct HttpPromptClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPromptClient {
    pub fn new(endpoint: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create prompt http client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TalkPromptClient for HttpPromptClient {
    async fn run_prompt(&self, request: PromptRequest) -> Result<PromptResponse> {
        let payload = json!({
            "prompt": request.prompt,
            "model": request.model,
            "tools": request.tools,
        });
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let mut builder = self
                .http
                .post(&self.endpoint)
                .timeout(Duration::from_millis(request.timeout_ms.max(1)))
                .json(&payload);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<PromptResponse>()
                            .await
                            .context("failed to decode prompt response");
                    }
                    if attempt <= RETRY_MAX_ATTEMPTS
                        && (status.is_server_error() || status.as_u16() == 429)
                    {
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BASE_DELAY_MS.saturating_mul(attempt as u64),
                        ))
                        .await;
                        continue;
                    }
                    bail!("prompt request failed with status {}", status.as_u16());
                }
                Err(error) => {
                    if attempt <= RETRY_MAX_ATTEMPTS && (error.is_connect() || error.is_timeout()) {
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BASE_DELAY_MS.saturating_mul(attempt as u64),
                        ))
                        .await;
                        continue;
                    }
                    return Err(error).context("prompt request failed");
                }
            }
        }
    }
}

/// Tool names permitted by the talk's policy: the allow list (or the builtin
/// catalog) minus denied names and tools whose capability the talk lacks.
pub fn compute_policy_allowed_tools(talk: &Talk) -> Vec<String> {
    if talk.tool_mode == ToolMode::Off {
        return Vec::new();
    }
    let catalog: Vec<String> = if talk.tools_allow.is_empty() {
        TOOL_CATALOG
            .iter()
            .map(|(name, _capability)| name.to_string())
            .collect()
    } else {
        talk.tools_allow.clone()
    };
    catalog
        .into_iter()
        .filter(|tool| {
            !talk
                .tools_deny
                .iter()
                .any(|denied| denied.eq_ignore_ascii_case(tool))
        })
        .filter(|tool| {
            let capability = TOOL_CATALOG
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(tool))
                .map(|(_, capability)| *capability)
                .unwrap_or(ToolCapability::None);
            match capability {
                ToolCapability::None => true,
                ToolCapability::Network => talk.network_access == NetworkAccess::FullOutbound,
                ToolCapability::HostFilesystem => {
                    talk.filesystem_access == FilesystemAccess::FullHostAccess
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
/// Result of one job run, as recorded in the report log.
pub struct JobRunOutcome {
    pub status: JobReportStatus,
    pub full_output: String,
    pub error: Option<String>,
    pub intent: Intent,
    pub offered_tools: Vec<String>,
}

/// Everything a job run needs, wired once at startup.
pub struct JobExecutor {
    store: Arc<TalkStore>,
    affinity: Arc<ToolAffinityStore>,
    client: Arc<dyn TalkPromptClient>,
    slack_sender: Option<Arc<dyn SlackSender>>,
    base_timeout_ms: u64,
    min_timeout_ms: Option<u64>,
    state_backend: Option<String>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<TalkStore>,
        affinity: Arc<ToolAffinityStore>,
        client: Arc<dyn TalkPromptClient>,
        slack_sender: Option<Arc<dyn SlackSender>>,
        base_timeout_ms: u64,
        min_timeout_ms: Option<u64>,
        state_backend: Option<String>,
    ) -> Self {
        Self {
            store,
            affinity,
            client,
            slack_sender,
            base_timeout_ms,
            min_timeout_ms,
            state_backend,
        }
    }

    pub fn store(&self) -> &Arc<TalkStore> {
        &self.store
    }

    /// Runs one job to completion, recording an observation and a report.
    /// The processing hint is always unset, whatever the outcome.
    pub async fn execute_job(
        &self,
        talk_id: &str,
        job: &Job,
        trigger_text: Option<&str>,
        source: &str,
    ) -> Result<JobRunOutcome> {
        let talk = self
            .store
            .get(talk_id)
            .ok_or_else(|| anyhow!("talk '{talk_id}' not found"))?;
        if let Err(error) = self.store.set_processing(talk_id, true) {
            tracing::warn!(talk_id, %error, "failed to set processing flag");
        }
        let outcome = self.run_job_inner(&talk, job, trigger_text, source).await;
        if let Err(error) = self.store.set_processing(talk_id, false) {
            tracing::warn!(talk_id, %error, "failed to clear processing flag");
        }
        outcome
    }

    async fn run_job_inner(
        &self,
        talk: &Talk,
        job: &Job,
        trigger_text: Option<&str>,
        source: &str,
    ) -> Result<JobRunOutcome> {
        let run_at = current_unix_timestamp_ms();
        let intent_text = trigger_text.unwrap_or(job.prompt.as_str());
        let intent = classify_intent(intent_text);
        let policy_allowed = compute_policy_allowed_tools(talk);
        let baseline =
            compute_cold_start_baseline(self.state_backend.as_deref(), &policy_allowed);
        let baseline_ref = (!baseline.is_empty()).then_some(baseline.as_slice());
        let selection = self
            .affinity
            .select_tools(&talk.id, intent, &policy_allowed, baseline_ref);
        let timeout_ms = compute_affinity_timeout(
            selection.phase,
            selection.selected_tools.len(),
            self.base_timeout_ms,
            self.min_timeout_ms,
        );

        let headers = build_job_headers(talk, &job.id)?;
        let prompt = match trigger_text {
            Some(trigger) => format!("{}\n\n{trigger}", job.prompt),
            None => job.prompt.clone(),
        };
        let request = PromptRequest {
            prompt,
            model: talk.model.clone(),
            tools: selection.selected_tools.clone(),
            headers,
            timeout_ms,
        };

        let run_result = tokio::time::timeout(
            Duration::from_millis(timeout_ms.max(1)),
            self.client.run_prompt(request),
        )
        .await
        .map_err(|_elapsed| anyhow!("prompt timed out after {timeout_ms}ms"))
        .and_then(|inner| inner);

        let (status, full_output, error, used_tools) = match run_result {
            Ok(response) => (
                JobReportStatus::Success,
                response.text,
                None,
                response.used_tools,
            ),
            Err(error) => (
                JobReportStatus::Failure,
                String::new(),
                Some(error.to_string()),
                Vec::new(),
            ),
        };

        let observation = AffinityObservation {
            timestamp: run_at,
            intent,
            available_tools: policy_allowed.clone(),
            used_tools,
            tools_offered: selection.selected_tools.len(),
            model: talk.model.clone(),
            source: source.to_string(),
        };
        if let Err(record_error) = self.affinity.record_observation(&talk.id, &observation) {
            tracing::warn!(talk_id = %talk.id, %record_error, "failed to record affinity observation");
        }

        let report = JobReport {
            job_id: job.id.clone(),
            run_at,
            status,
            full_output: full_output.clone(),
            error: error.clone(),
        };
        if let Err(report_error) = self.store.append_report(&talk.id, &report) {
            tracing::warn!(talk_id = %talk.id, %report_error, "failed to append job report");
        }
        if let Err(stamp_error) = self.store.record_job_run(&talk.id, &job.id, run_at, status) {
            tracing::warn!(talk_id = %talk.id, %stamp_error, "failed to stamp job run");
        }

        if status == JobReportStatus::Success {
            self.deliver_output(talk, job, &full_output).await;
        }

        Ok(JobRunOutcome {
            status,
            full_output,
            error,
            intent,
            offered_tools: selection.selected_tools,
        })
    }

    async fn deliver_output(&self, talk: &Talk, job: &Job, full_output: &str) {
        match &job.output {
            JobOutput::ReportOnly => {}
            JobOutput::Talk => {
                if let Err(error) =
                    self.store
                        .append_message(&talk.id, MessageRole::Assistant, full_output)
                {
                    tracing::warn!(talk_id = %talk.id, %error, "failed to deliver job output to talk");
                }
            }
            JobOutput::Slack {
                channel_id,
                account_id,
                thread_ts,
            } => {
                let Some(sender) = self.slack_sender.as_ref() else {
                    tracing::warn!(
                        talk_id = %talk.id,
                        job_id = %job.id,
                        "slack output configured but no sender wired"
                    );
                    return;
                };
                if let Err(error) = sender
                    .send_message(
                        account_id.as_deref(),
                        channel_id,
                        thread_ts.as_deref(),
                        full_output,
                    )
                    .await
                {
                    tracing::warn!(talk_id = %talk.id, %error, "failed to deliver job output to slack");
                }
            }
        }
    }
}

/// Headers for a job-run request: `job:`-prefixed session key always; the
/// managed-agent header only in openclaw mode. The guard rejects anything
/// else before the request leaves.
fn build_job_headers(talk: &Talk, job_id: &str) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    headers.insert(
        "x-openclaw-session-key".to_string(),
        format!("job:clawtalk:{}:{job_id}", talk.id),
    );
    if talk.execution_mode == ExecutionMode::Openclaw {
        headers.insert(
            "x-openclaw-agent-id".to_string(),
            managed_agent_id(&talk.id),
        );
    }
    assert_routing_headers(RoutingFlow::JobScheduler, talk.execution_mode, &headers)?;
    Ok(headers)
}

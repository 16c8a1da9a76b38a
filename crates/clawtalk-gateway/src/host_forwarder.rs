//! Verbatim event forwarding to the host webhook with bounded retry.

use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const ENV_WEBHOOK_URL_OVERRIDE: &str = "GATEWAY_SLACK_OPENCLAW_WEBHOOK_URL";
pub const ENV_OPENCLAW_HTTP_PORT: &str = "OPENCLAW_HTTP_PORT";
const DEFAULT_OPENCLAW_HTTP_PORT: u16 = 3000;
const FORWARD_MAX_RETRIES: usize = 2;
const FORWARD_RETRY_BASE_DELAY_MS: u64 = 500;

/// Resolves the host webhook URL in precedence order: environment override,
/// config override, the account's webhook path, else the local default.
pub fn resolve_host_webhook_url(
    env_override: Option<&str>,
    config_override: Option<&str>,
    account_webhook_path: Option<&str>,
    env_http_port: Option<&str>,
) -> String {
    let trimmed = |raw: Option<&str>| {
        raw.map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    if let Some(url) = trimmed(env_override) {
        return url;
    }
    if let Some(url) = trimmed(config_override) {
        return url;
    }
    let port = trimmed(env_http_port)
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(DEFAULT_OPENCLAW_HTTP_PORT);
    if let Some(path) = trimmed(account_webhook_path) {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path;
        }
        let path = path.trim_start_matches('/');
        return format!("http://127.0.0.1:{port}/{path}");
    }
    format!("http://127.0.0.1:{port}/slack/events")
}

/// Headers preserved verbatim on the forwarded request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardHeaders {
    pub content_type: Option<String>,
    pub slack_signature: Option<String>,
    pub slack_request_timestamp: Option<String>,
}

/// POSTs the raw body to the host, retrying twice on transport failure or
/// 5xx with base-500 ms linear backoff. Returns the final status.
pub async fn forward_to_host(
    http: &reqwest::Client,
    url: &str,
    body: Vec<u8>,
    headers: &ForwardHeaders,
) -> Result<u16> {
    let mut attempt = 0_usize;
    loop {
        let mut builder = http.post(url).body(body.clone());
        if let Some(content_type) = headers.content_type.as_deref() {
            builder = builder.header("content-type", content_type);
        }
        if let Some(signature) = headers.slack_signature.as_deref() {
            builder = builder.header("x-slack-signature", signature);
        }
        if let Some(timestamp) = headers.slack_request_timestamp.as_deref() {
            builder = builder.header("x-slack-request-timestamp", timestamp);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                if !status.is_server_error() {
                    return Ok(status.as_u16());
                }
                if attempt >= FORWARD_MAX_RETRIES {
                    bail!("host forward exhausted retries with status {}", status.as_u16());
                }
            }
            Err(error) => {
                if attempt >= FORWARD_MAX_RETRIES {
                    return Err(error).context("host forward exhausted retries");
                }
            }
        }
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(
            FORWARD_RETRY_BASE_DELAY_MS.saturating_mul(attempt as u64),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_webhook_url_resolution_precedence() {
        assert_eq!(
            resolve_host_webhook_url(Some("https://env.example/hook"), Some("https://cfg"), Some("/p"), None),
            "https://env.example/hook"
        );
        assert_eq!(
            resolve_host_webhook_url(None, Some("https://cfg.example/hook"), Some("/p"), None),
            "https://cfg.example/hook"
        );
        assert_eq!(
            resolve_host_webhook_url(None, None, Some("/account/hook"), Some("4100")),
            "http://127.0.0.1:4100/account/hook"
        );
        assert_eq!(
            resolve_host_webhook_url(None, None, None, None),
            "http://127.0.0.1:3000/slack/events"
        );
        assert_eq!(
            resolve_host_webhook_url(None, None, None, Some("not-a-port")),
            "http://127.0.0.1:3000/slack/events"
        );
    }
}

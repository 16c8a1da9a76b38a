//! Slack `v0=` signature verification across a set of candidate secrets.
//!
//! Secrets are assembled most-specific first (per-account, then the base
//! config secret, then environment fallbacks) and deduplicated on value; the
//! first secret that verifies decides the event's account id.

use anyhow::{bail, Context, Result};
use clawtalk_routing::HostConfig;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_MAX_SKEW_SECONDS: u64 = 300;
pub const ENV_GATEWAY_SIGNING_SECRET: &str = "GATEWAY_SLACK_SIGNING_SECRET";
pub const ENV_SLACK_SIGNING_SECRET: &str = "SLACK_SIGNING_SECRET";
pub const DEFAULT_ACCOUNT_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
/// One candidate signing secret bound to the account it authenticates.
pub struct SigningSecret {
    pub account_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why verification failed, mapped to distinct HTTP statuses upstream.
pub enum SignatureRejection {
    NoSecretsConfigured,
    MissingHeaders,
    StaleTimestamp,
    NoMatch,
}

/// Candidate secrets in precedence order, deduplicated on secret value.
pub fn assemble_signing_secrets(
    config: &HostConfig,
    env_gateway_secret: Option<&str>,
    env_slack_secret: Option<&str>,
) -> Vec<SigningSecret> {
    let mut secrets: Vec<SigningSecret> = Vec::new();
    let mut push = |account_id: &str, secret: Option<&str>| {
        let Some(secret) = secret.map(str::trim).filter(|value| !value.is_empty()) else {
            return;
        };
        if secrets.iter().any(|existing| existing.secret == secret) {
            return;
        }
        secrets.push(SigningSecret {
            account_id: account_id.to_string(),
            secret: secret.to_string(),
        });
    };

    for (account_id, account) in &config.channels.slack.accounts {
        push(account_id, account.signing_secret.as_deref());
    }
    push(
        DEFAULT_ACCOUNT_ID,
        config.channels.slack.signing_secret.as_deref(),
    );
    push(DEFAULT_ACCOUNT_ID, env_gateway_secret);
    push(DEFAULT_ACCOUNT_ID, env_slack_secret);
    secrets
}

/// Verifies `v0=<hmac_sha256(secret, "v0:<ts>:<body>")>` against each
/// candidate. Returns the matching account id.
pub fn verify_slack_signature(
    secrets: &[SigningSecret],
    body: &[u8],
    timestamp: &str,
    signature: &str,
    now_unix_seconds: u64,
) -> Result<String, SignatureRejection> {
    if secrets.is_empty() {
        return Err(SignatureRejection::NoSecretsConfigured);
    }
    let timestamp = timestamp.trim();
    let signature = signature.trim();
    if timestamp.is_empty() || signature.is_empty() {
        return Err(SignatureRejection::MissingHeaders);
    }
    let Ok(timestamp_seconds) = timestamp.parse::<u64>() else {
        return Err(SignatureRejection::MissingHeaders);
    };
    if now_unix_seconds.abs_diff(timestamp_seconds) > SIGNATURE_MAX_SKEW_SECONDS {
        return Err(SignatureRejection::StaleTimestamp);
    }
    let Some(digest_hex) = signature.strip_prefix("v0=") else {
        return Err(SignatureRejection::NoMatch);
    };
    let Ok(signature_bytes) = decode_hex(digest_hex) else {
        return Err(SignatureRejection::NoMatch);
    };

    for candidate in secrets {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(candidate.secret.as_bytes()) else {
            continue;
        };
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        if mac.verify_slice(&signature_bytes).is_ok() {
            return Ok(candidate.account_id.clone());
        }
    }
    Err(SignatureRejection::NoMatch)
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("signature digest cannot be empty");
    }
    if trimmed.len() % 2 != 0 {
        bail!("signature digest must have an even number of hex characters");
    }
    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let raw = trimmed.as_bytes();
    let mut index = 0_usize;
    while index < raw.len() {
        let hex = std::str::from_utf8(&raw[index..index + 2]).context("invalid utf-8 in digest")?;
        let byte = u8::from_str_radix(hex, 16)
            .with_context(|| format!("invalid hex byte '{}' in signature digest", hex))?;
        bytes.push(byte);
        index = index.saturating_add(2);
    }
    Ok(bytes)
}

/// Renders the `v0=` signature for a body; test helper and forward re-sign.
pub fn sign_slack_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!(
        "v0={}",
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()
    )
}

//! Per-Talk, per-intent tool-affinity learning.
//!
//! Observations of which tools the model actually used accumulate in a
//! sliding window per intent. Selection runs a warmup/learned/exploration
//! phase machine: warmup broadcasts every policy-allowed tool, learned keeps
//! only tools above the affinity threshold (or a cold-start baseline before
//! enough data exists), and a 1-in-E exploration roll re-broadcasts
//! everything so pruning can recover from drift.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::Result;
use clawtalk_core::{
    commit_json_pretty, current_unix_timestamp_ms, read_jsonl_tolerant, Intent, JsonlLog,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_WARMUP_THRESHOLD: usize = 3;
pub const DEFAULT_SLIDING_WINDOW: usize = 50;
pub const DEFAULT_EXPLORATION_RATE: u32 = 20;
pub const DEFAULT_MIN_AFFINITY_THRESHOLD: f64 = 0.1;
const SNAPSHOT_CACHE_TTL_MS: u64 = 60_000;

pub const ENV_WARMUP: &str = "CLAWTALK_AFFINITY_WARMUP";
pub const ENV_WINDOW: &str = "CLAWTALK_AFFINITY_WINDOW";
pub const ENV_EXPLORATION_RATE: &str = "CLAWTALK_AFFINITY_EXPLORATION_RATE";
pub const ENV_MIN_THRESHOLD: &str = "CLAWTALK_AFFINITY_MIN_THRESHOLD";
pub const ENV_ENABLED: &str = "CLAWTALK_AFFINITY_ENABLED";

#[derive(Debug, Clone, PartialEq)]
/// Tunables for the phase machine, overridable per environment.
pub struct AffinityConfig {
    pub enabled: bool,
    pub warmup_threshold: usize,
    pub sliding_window: usize,
    pub exploration_rate: u32,
    pub min_affinity_threshold: f64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_threshold: DEFAULT_WARMUP_THRESHOLD,
            sliding_window: DEFAULT_SLIDING_WINDOW,
            exploration_rate: DEFAULT_EXPLORATION_RATE,
            min_affinity_threshold: DEFAULT_MIN_AFFINITY_THRESHOLD,
        }
    }
}

impl AffinityConfig {
    /// Defaults overlaid with any recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_WARMUP) {
            if let Ok(value) = raw.trim().parse::<usize>() {
                config.warmup_threshold = value;
            }
        }
        if let Ok(raw) = std::env::var(ENV_WINDOW) {
            if let Ok(value) = raw.trim().parse::<usize>() {
                config.sliding_window = value.max(1);
            }
        }
        if let Ok(raw) = std::env::var(ENV_EXPLORATION_RATE) {
            if let Ok(value) = raw.trim().parse::<u32>() {
                config.exploration_rate = value.max(1);
            }
        }
        if let Ok(raw) = std::env::var(ENV_MIN_THRESHOLD) {
            if let Ok(value) = raw.trim().parse::<f64>() {
                if value.is_finite() && (0.0..=1.0).contains(&value) {
                    config.min_affinity_threshold = value;
                }
            }
        }
        if let Ok(raw) = std::env::var(ENV_ENABLED) {
            config.enabled = !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One observed (offered tools, used tools) pair for a run.
pub struct AffinityObservation {
    pub timestamp: u64,
    pub intent: Intent,
    pub available_tools: Vec<String>,
    pub used_tools: Vec<String>,
    pub tools_offered: usize,
    pub model: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AffinityPhase` values.
pub enum AffinityPhase {
    Warmup,
    Learned,
    Exploration,
}

impl AffinityPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Learned => "learned",
            Self::Exploration => "exploration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
/// Sliding-window statistics for one intent.
pub struct IntentStats {
    pub total_observations: usize,
    pub no_tool_count: usize,
    pub tool_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
/// Per-intent statistics for one talk, cached and persisted for debugging.
pub struct AffinitySnapshot {
    pub computed_unix_ms: u64,
    pub intents: BTreeMap<String, IntentStats>,
}

impl AffinitySnapshot {
    pub fn stats_for(&self, intent: Intent) -> Option<&IntentStats> {
        self.intents.get(intent.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Result of one selection: the phase taken and the pruning outcome.
pub struct AffinitySelection {
    pub phase: AffinityPhase,
    pub selected_tools: Vec<String>,
    pub pruned_tools: Vec<String>,
    pub reason: String,
}

struct CachedSnapshot {
    snapshot: AffinitySnapshot,
    fetched_unix_ms: u64,
}

/// Per-data-dir affinity store: observation log, snapshot cache, selection.
pub struct ToolAffinityStore {
    talks_dir: PathBuf,
    config: AffinityConfig,
    cache: Mutex<HashMap<String, CachedSnapshot>>,
}

impl ToolAffinityStore {
    pub fn new(data_dir: &Path, config: AffinityConfig) -> Self {
        Self {
            talks_dir: data_dir.join("talks"),
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AffinityConfig {
        &self.config
    }

    fn observations_path(&self, talk_id: &str) -> PathBuf {
        self.talks_dir
            .join(talk_id)
            .join("affinity")
            .join("observations.jsonl")
    }

    fn snapshot_path(&self, talk_id: &str) -> PathBuf {
        self.talks_dir
            .join(talk_id)
            .join("affinity")
            .join("snapshot.json")
    }

    /// Appends one observation and invalidates the talk's snapshot cache.
    pub fn record_observation(
        &self,
        talk_id: &str,
        observation: &AffinityObservation,
    ) -> Result<()> {
        JsonlLog::open(self.observations_path(talk_id))?.append(observation)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(talk_id);
        }
        Ok(())
    }

    /// Sliding-window statistics per intent, cached for 60 seconds. A fresh
    /// computation is also persisted to `affinity/snapshot.json`.
    pub fn snapshot(&self, talk_id: &str) -> AffinitySnapshot {
        let now = current_unix_timestamp_ms();
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(talk_id) {
                if now.saturating_sub(entry.fetched_unix_ms) < SNAPSHOT_CACHE_TTL_MS {
                    return entry.snapshot.clone();
                }
            }
        }

        let snapshot = self.compute_snapshot(talk_id, now);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                talk_id.to_string(),
                CachedSnapshot {
                    snapshot: snapshot.clone(),
                    fetched_unix_ms: now,
                },
            );
        }
        if let Err(error) = commit_json_pretty(&self.snapshot_path(talk_id), &snapshot) {
            tracing::warn!(talk_id, %error, "failed to persist affinity snapshot");
        }
        snapshot
    }

    fn compute_snapshot(&self, talk_id: &str, now: u64) -> AffinitySnapshot {
        let (observations, skipped) = read_jsonl_tolerant::<AffinityObservation>(
            &self.observations_path(talk_id),
        )
        .unwrap_or_else(|error| {
            tracing::warn!(talk_id, %error, "failed to read affinity observations");
            (Vec::new(), 0)
        });
        if skipped > 0 {
            tracing::warn!(talk_id, skipped, "skipped corrupt affinity observations");
        }

        let mut grouped: BTreeMap<String, Vec<&AffinityObservation>> = BTreeMap::new();
        for observation in &observations {
            grouped
                .entry(observation.intent.as_str().to_string())
                .or_default()
                .push(observation);
        }

        let mut intents = BTreeMap::new();
        for (intent, mut entries) in grouped {
            if entries.len() > self.config.sliding_window {
                entries.drain(..entries.len() - self.config.sliding_window);
            }
            let mut stats = IntentStats {
                total_observations: entries.len(),
                ..IntentStats::default()
            };
            for observation in entries {
                if observation.used_tools.is_empty() {
                    stats.no_tool_count += 1;
                }
                for tool in &observation.used_tools {
                    *stats
                        .tool_counts
                        .entry(tool.trim().to_ascii_lowercase())
                        .or_insert(0) += 1;
                }
            }
            intents.insert(intent, stats);
        }

        AffinitySnapshot {
            computed_unix_ms: now,
            intents,
        }
    }

    /// Selects the tool subset to offer, rolling the exploration die.
    pub fn select_tools(
        &self,
        talk_id: &str,
        intent: Intent,
        policy_allowed: &[String],
        cold_start_baseline: Option<&[String]>,
    ) -> AffinitySelection {
        let exploration_roll = self.config.exploration_rate > 0
            && rand::rng().random_range(0..self.config.exploration_rate) == 0;
        self.select_tools_with_roll(
            talk_id,
            intent,
            policy_allowed,
            cold_start_baseline,
            exploration_roll,
        )
    }

    /// Deterministic selection core; `exploration_roll` is the 1-in-E die.
    pub fn select_tools_with_roll(
        &self,
        talk_id: &str,
        intent: Intent,
        policy_allowed: &[String],
        cold_start_baseline: Option<&[String]>,
        exploration_roll: bool,
    ) -> AffinitySelection {
        let all = |phase: AffinityPhase, reason: String| AffinitySelection {
            phase,
            selected_tools: policy_allowed.to_vec(),
            pruned_tools: Vec::new(),
            reason,
        };

        if !self.config.enabled {
            return all(AffinityPhase::Warmup, "affinity disabled".to_string());
        }

        let snapshot = self.snapshot(talk_id);
        let total = snapshot
            .stats_for(intent)
            .map(|stats| stats.total_observations)
            .unwrap_or(0);
        let warmup = self.config.warmup_threshold;
        let baseline_provided = cold_start_baseline
            .map(|baseline| !baseline.is_empty())
            .unwrap_or(false);

        if total < warmup && !intent.is_cold_start() && !baseline_provided {
            return all(
                AffinityPhase::Warmup,
                format!("warmup: observations={total} < threshold={warmup}"),
            );
        }

        if exploration_roll {
            return all(
                AffinityPhase::Exploration,
                format!("exploration roll 1/{}", self.config.exploration_rate),
            );
        }

        // Learned phase. Window data only decides once warmup is crossed;
        // before that a provided baseline wins even over empty observations.
        if total >= warmup {
            let stats = snapshot.stats_for(intent).cloned().unwrap_or_default();
            let threshold = self.config.min_affinity_threshold;
            let (selected, pruned) = split_by_threshold(policy_allowed, &stats, threshold);
            return AffinitySelection {
                phase: AffinityPhase::Learned,
                selected_tools: selected,
                pruned_tools: pruned,
                reason: format!("learned: observations={total} threshold={threshold}"),
            };
        }

        if let Some(baseline) = cold_start_baseline.filter(|baseline| !baseline.is_empty()) {
            let (selected, pruned) = intersect_baseline(policy_allowed, baseline);
            let baseline_len = selected.len();
            return AffinitySelection {
                phase: AffinityPhase::Learned,
                selected_tools: selected,
                pruned_tools: pruned,
                reason: format!("cold-start baseline={baseline_len} observations={total}"),
            };
        }

        if intent.is_cold_start() {
            return AffinitySelection {
                phase: AffinityPhase::Learned,
                selected_tools: Vec::new(),
                pruned_tools: policy_allowed.to_vec(),
                reason: format!("cold intent without baseline: observations={total}"),
            };
        }

        all(
            AffinityPhase::Warmup,
            format!("warmup fallback: observations={total}"),
        )
    }
}

fn split_by_threshold(
    policy_allowed: &[String],
    stats: &IntentStats,
    threshold: f64,
) -> (Vec<String>, Vec<String>) {
    let total = stats.total_observations.max(1) as f64;
    let mut selected = Vec::new();
    let mut pruned = Vec::new();
    for tool in policy_allowed {
        let count = stats
            .tool_counts
            .get(&tool.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(0) as f64;
        if count / total >= threshold {
            selected.push(tool.clone());
        } else {
            pruned.push(tool.clone());
        }
    }
    (selected, pruned)
}

fn intersect_baseline(
    policy_allowed: &[String],
    baseline: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut selected = Vec::new();
    let mut pruned = Vec::new();
    for tool in policy_allowed {
        let in_baseline = baseline
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(tool));
        if in_baseline {
            selected.push(tool.clone());
        } else {
            pruned.push(tool.clone());
        }
    }
    (selected, pruned)
}

/// Baseline tool set for an intent before any data exists: the `state_*`
/// tools when the state backend streams (or is unset), nothing for
/// workspace-file backends.
pub fn compute_cold_start_baseline(
    state_backend: Option<&str>,
    policy_allowed_tools: &[String],
) -> Vec<String> {
    match state_backend.map(str::trim) {
        None | Some("") | Some("stream_store") => policy_allowed_tools
            .iter()
            .filter(|tool| tool.to_ascii_lowercase().starts_with("state_"))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// Adaptive request timeout: warmup and exploration use the base timeout;
/// learned scales with the surviving tool count, bounded both ways.
pub fn compute_affinity_timeout(
    phase: AffinityPhase,
    tool_count: usize,
    base_timeout_ms: u64,
    min_timeout_ms: Option<u64>,
) -> u64 {
    match phase {
        AffinityPhase::Warmup | AffinityPhase::Exploration => base_timeout_ms,
        AffinityPhase::Learned => {
            let scaled = 60_000_u64.saturating_add(20_000_u64.saturating_mul(tool_count as u64));
            base_timeout_ms.min(scaled.max(min_timeout_ms.unwrap_or(0)))
        }
    }
}

static STORE_REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<ToolAffinityStore>>>> = OnceLock::new();

/// Process-wide registry of affinity stores keyed by data dir, so every lane
/// shares one snapshot cache per deployment.
pub fn affinity_store_for(data_dir: &Path) -> Arc<ToolAffinityStore> {
    let registry = STORE_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .entry(data_dir.to_path_buf())
        .or_insert_with(|| {
            Arc::new(ToolAffinityStore::new(data_dir, AffinityConfig::from_env()))
        })
        .clone()
}

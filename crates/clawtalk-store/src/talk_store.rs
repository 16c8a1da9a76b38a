//! Single-writer store over the per-Talk directory layout.
//!
//! Layout per talk: `talks/<id>/talk.json` (atomic rewrite), `history.jsonl`
//! and `reports.jsonl` (append-only), `context.md` (whole rewrite). The
//! in-memory map is a cache of the directory tree; temp-then-rename is the
//! commit point for every metadata write.

use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Context, Result};
use clawtalk_core::{
    commit_json_pretty, commit_text, current_unix_timestamp_ms, read_jsonl_tail,
    read_jsonl_tolerant, short_hash, JsonlLog,
};

use crate::talk_model::{
    is_valid_talk_id, normalize_loaded_talk, Job, JobReport, JobReportStatus, MessageRole, Talk,
    TalkMessage, TalkPatch,
};

const CONTEXT_CACHE_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
/// Published after every semantic mutation; the version is strictly
/// monotonic per talk.
pub struct ChangeEvent {
    pub event_type: &'static str,
    pub talk_id: String,
    pub talk_version: u64,
    pub change_id: String,
    pub timestamp: u64,
    pub last_modified_by: Option<String>,
}

type ChangeListener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

struct ContextCacheEntry {
    content: String,
    fetched_unix_ms: u64,
}

struct StoreState {
    talks: HashMap<String, Talk>,
    deleted: HashSet<String>,
    list_cache: Option<Vec<Talk>>,
    context_cache: HashMap<String, ContextCacheEntry>,
    id_seq: u64,
}

/// Durable, process-local store for all Talk state. All mutations flow
/// through it; listeners observe them as [`ChangeEvent`]s.
pub struct TalkStore {
    talks_dir: PathBuf,
    inner: Mutex<StoreState>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl TalkStore {
    /// Loads every talk under `<data_dir>/talks`, applying the on-disk
    /// tolerance rules and clearing any stale `processing` flags left behind
    /// by a previous process.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let talks_dir = data_dir.join("talks");
        std::fs::create_dir_all(&talks_dir)
            .with_context(|| format!("failed to create {}", talks_dir.display()))?;

        let mut talks = HashMap::new();
        let mut stale_processing = 0_usize;
        for entry in std::fs::read_dir(&talks_dir)
            .with_context(|| format!("failed to read {}", talks_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed to read entry in {}", talks_dir.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if !is_valid_talk_id(&dir_name) {
                tracing::warn!(dir = %dir_name, "skipping talk directory with unsafe name");
                continue;
            }
            let metadata_path = entry.path().join("talk.json");
            let raw = match std::fs::read_to_string(&metadata_path) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(
                        path = %metadata_path.display(),
                        %error,
                        "skipping talk with unreadable metadata"
                    );
                    continue;
                }
            };
            let mut talk = match serde_json::from_str::<Talk>(&raw) {
                Ok(talk) => talk,
                Err(error) => {
                    tracing::warn!(
                        path = %metadata_path.display(),
                        %error,
                        "skipping talk with corrupt metadata"
                    );
                    continue;
                }
            };
            talk.id = dir_name.clone();
            let dropped = normalize_loaded_talk(&mut talk);
            if dropped > 0 {
                tracing::warn!(talk_id = %talk.id, dropped, "dropped incomplete entries on load");
            }
            if talk.processing {
                talk.processing = false;
                stale_processing = stale_processing.saturating_add(1);
                let _ = persist_talk(&talks_dir, &talk);
            }
            talks.insert(dir_name, talk);
        }

        if stale_processing > 0 {
            tracing::warn!(
                count = stale_processing,
                "cleared stale processing flags on startup"
            );
        }

        Ok(Self {
            talks_dir,
            inner: Mutex::new(StoreState {
                talks,
                deleted: HashSet::new(),
                list_cache: None,
                context_cache: HashMap::new(),
                id_seq: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Registers a change listener. Listener panics are isolated and never
    /// affect the mutation or other listeners.
    pub fn subscribe(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn talk_dir(&self, talk_id: &str) -> PathBuf {
        self.talks_dir.join(talk_id)
    }

    fn history_path(&self, talk_id: &str) -> PathBuf {
        self.talk_dir(talk_id).join("history.jsonl")
    }

    fn reports_path(&self, talk_id: &str) -> PathBuf {
        self.talk_dir(talk_id).join("reports.jsonl")
    }

    fn context_path(&self, talk_id: &str) -> PathBuf {
        self.talk_dir(talk_id).join("context.md")
    }

    pub fn create(&self, model: Option<&str>) -> Result<Talk> {
        let now = current_unix_timestamp_ms();
        let mut state = self.lock_state()?;
        state.id_seq = state.id_seq.saturating_add(1);
        let id = format!(
            "talk-{now}-{}",
            short_hash(format!("{}:{}", std::process::id(), state.id_seq).as_bytes())
        );
        let talk = Talk {
            schema_version: crate::talk_model::TALK_SCHEMA_VERSION,
            id: id.clone(),
            talk_version: 1,
            change_id: short_hash(format!("{id}:1:{now}").as_bytes()),
            last_modified_at: now,
            last_modified_by: "create".to_string(),
            topic_title: String::new(),
            objective: String::new(),
            model: model.unwrap_or_default().to_string(),
            google_auth_profile: None,
            agents: Vec::new(),
            pinned_message_ids: Vec::new(),
            directives: Vec::new(),
            platform_bindings: Vec::new(),
            platform_behaviors: Vec::new(),
            jobs: Vec::new(),
            execution_mode: Default::default(),
            filesystem_access: Default::default(),
            network_access: Default::default(),
            tool_mode: Default::default(),
            tools_allow: Vec::new(),
            tools_deny: Vec::new(),
            processing: false,
            created_at: now,
            updated_at: now,
        };
        persist_talk(&self.talks_dir, &talk)?;
        state.talks.insert(id.clone(), talk.clone());
        state.list_cache = None;
        drop(state);

        self.publish(ChangeEvent {
            event_type: "created",
            talk_id: talk.id.clone(),
            talk_version: talk.talk_version,
            change_id: talk.change_id.clone(),
            timestamp: now,
            last_modified_by: Some("create".to_string()),
        });
        Ok(talk)
    }

    pub fn get(&self, talk_id: &str) -> Option<Talk> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.talks.get(talk_id).cloned())
    }

    /// All talks sorted by `updatedAt` descending. Memoized until the next
    /// mutation.
    pub fn list(&self) -> Vec<Talk> {
        let Ok(mut state) = self.inner.lock() else {
            return Vec::new();
        };
        if let Some(cached) = &state.list_cache {
            return cached.clone();
        }
        let mut talks = state.talks.values().cloned().collect::<Vec<_>>();
        talks.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        state.list_cache = Some(talks.clone());
        talks
    }

    pub fn update(&self, talk_id: &str, patch: TalkPatch, modified_by: &str) -> Result<Talk> {
        self.mutate(talk_id, modified_by, "updated", |talk| {
            if let Some(value) = patch.topic_title {
                talk.topic_title = value;
            }
            if let Some(value) = patch.objective {
                talk.objective = value;
            }
            if let Some(value) = patch.model {
                talk.model = value;
            }
            if let Some(value) = patch.agents {
                talk.agents = value;
            }
            if let Some(value) = patch.directives {
                talk.directives = value;
            }
            if let Some(value) = patch.platform_bindings {
                talk.platform_bindings = value;
            }
            if let Some(value) = patch.platform_behaviors {
                talk.platform_behaviors = value;
            }
            if let Some(value) = patch.tool_mode {
                talk.tool_mode = value;
            }
            if let Some(value) = patch.execution_mode {
                talk.execution_mode = value;
            }
            if let Some(value) = patch.filesystem_access {
                talk.filesystem_access = value;
            }
            if let Some(value) = patch.network_access {
                talk.network_access = value;
            }
            if let Some(value) = patch.tools_allow {
                talk.tools_allow = crate::talk_model::normalize_tool_names(&value);
            }
            if let Some(value) = patch.tools_deny {
                talk.tools_deny = crate::talk_model::normalize_tool_names(&value);
            }
            if let Some(value) = patch.google_auth_profile {
                talk.google_auth_profile = value;
            }
            // Behaviors must keep pointing at live bindings after a patch.
            let _ = normalize_loaded_talk(talk);
            Ok(())
        })
    }

    /// Deletes the talk directory and tombstones the id so it never
    /// re-emerges, in this process or after restart.
    pub fn delete(&self, talk_id: &str) -> Result<()> {
        let mut state = self.lock_state()?;
        let Some(mut talk) = state.talks.remove(talk_id) else {
            bail!("talk '{talk_id}' not found");
        };
        state.deleted.insert(talk_id.to_string());
        state.list_cache = None;
        state.context_cache.remove(talk_id);
        let talk_dir = self.talk_dir(talk_id);
        // Remove talk.json first so a partially failed removal still cannot
        // be re-loaded as a live talk after restart.
        let _ = std::fs::remove_file(talk_dir.join("talk.json"));
        if let Err(error) = std::fs::remove_dir_all(&talk_dir) {
            tracing::warn!(path = %talk_dir.display(), %error, "failed to remove talk directory");
        }
        drop(state);

        talk.talk_version = talk.talk_version.saturating_add(1);
        self.publish(ChangeEvent {
            event_type: "deleted",
            talk_id: talk_id.to_string(),
            talk_version: talk.talk_version,
            change_id: short_hash(
                format!("{talk_id}:{}:deleted", talk.talk_version).as_bytes(),
            ),
            timestamp: current_unix_timestamp_ms(),
            last_modified_by: None,
        });
        Ok(())
    }

    /// Flips the transient processing flag. Persisted as a hint but never
    /// bumps the version triple and publishes no change event.
    pub fn set_processing(&self, talk_id: &str, processing: bool) -> Result<()> {
        let mut state = self.lock_state()?;
        let talk = state
            .talks
            .get_mut(talk_id)
            .ok_or_else(|| anyhow!("talk '{talk_id}' not found"))?;
        if talk.processing == processing {
            return Ok(());
        }
        talk.processing = processing;
        let snapshot = talk.clone();
        if let Err(error) = persist_talk(&self.talks_dir, &snapshot) {
            tracing::warn!(talk_id, %error, "failed to persist processing flag");
        }
        Ok(())
    }

    pub fn append_message(
        &self,
        talk_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<TalkMessage> {
        let now = current_unix_timestamp_ms();
        let message = {
            let mut state = self.lock_state()?;
            if !state.talks.contains_key(talk_id) {
                bail!("talk '{talk_id}' not found");
            }
            state.id_seq = state.id_seq.saturating_add(1);
            TalkMessage {
                id: format!(
                    "msg-{now}-{}",
                    short_hash(format!("{talk_id}:{}", state.id_seq).as_bytes())
                ),
                role,
                content: content.to_string(),
                timestamp: now,
            }
        };
        JsonlLog::open(self.history_path(talk_id))?.append(&message)?;
        self.mutate(talk_id, "message", "message-appended", |_talk| Ok(()))?;
        Ok(message)
    }

    pub fn get_messages(&self, talk_id: &str) -> Result<Vec<TalkMessage>> {
        let (messages, _skipped) = read_jsonl_tolerant(&self.history_path(talk_id))?;
        Ok(messages)
    }

    pub fn get_recent_messages(&self, talk_id: &str, limit: usize) -> Result<Vec<TalkMessage>> {
        read_jsonl_tail(&self.history_path(talk_id), limit)
    }

    pub fn get_message(&self, talk_id: &str, message_id: &str) -> Result<Option<TalkMessage>> {
        Ok(self
            .get_messages(talk_id)?
            .into_iter()
            .find(|message| message.id == message_id))
    }

    /// Bulk-deletes messages by id, rewriting the log. Any pin left dangling
    /// is removed in the same mutation.
    pub fn delete_messages(&self, talk_id: &str, message_ids: &[String]) -> Result<usize> {
        let remove = message_ids.iter().cloned().collect::<HashSet<_>>();
        let messages = self.get_messages(talk_id)?;
        let kept = messages
            .iter()
            .filter(|message| !remove.contains(&message.id))
            .collect::<Vec<_>>();
        let removed = messages.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut body = String::new();
        for message in &kept {
            body.push_str(&serde_json::to_string(message).context("failed to encode message")?);
            body.push('\n');
        }
        commit_text(&self.history_path(talk_id), &body)?;

        let surviving = kept
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        self.mutate(talk_id, "message", "messages-deleted", |talk| {
            talk.pinned_message_ids.retain(|pin| surviving.contains(pin));
            Ok(())
        })?;
        Ok(removed)
    }

    /// Pins a message. The id must refer to a message in this talk's log.
    pub fn pin_message(&self, talk_id: &str, message_id: &str) -> Result<()> {
        if self.get_message(talk_id, message_id)?.is_none() {
            bail!("message '{message_id}' not found in talk '{talk_id}'");
        }
        self.mutate(talk_id, "pin", "pin-added", |talk| {
            if !talk.pinned_message_ids.iter().any(|pin| pin == message_id) {
                talk.pinned_message_ids.push(message_id.to_string());
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn unpin_message(&self, talk_id: &str, message_id: &str) -> Result<()> {
        self.mutate(talk_id, "pin", "pin-removed", |talk| {
            talk.pinned_message_ids.retain(|pin| pin != message_id);
            Ok(())
        })?;
        Ok(())
    }

    pub fn add_job(&self, talk_id: &str, job: Job) -> Result<Talk> {
        self.mutate(talk_id, "jobs", "job-added", |talk| {
            if talk.jobs.iter().any(|existing| existing.id == job.id) {
                bail!("job '{}' already exists", job.id);
            }
            talk.jobs.push(job);
            Ok(())
        })
    }

    pub fn update_job(&self, talk_id: &str, job: Job) -> Result<Talk> {
        self.mutate(talk_id, "jobs", "job-updated", |talk| {
            let slot = talk
                .jobs
                .iter_mut()
                .find(|existing| existing.id == job.id)
                .ok_or_else(|| anyhow!("job '{}' not found", job.id))?;
            *slot = job;
            Ok(())
        })
    }

    pub fn delete_job(&self, talk_id: &str, job_id: &str) -> Result<Talk> {
        self.mutate(talk_id, "jobs", "job-deleted", |talk| {
            let before = talk.jobs.len();
            talk.jobs.retain(|job| job.id != job_id);
            if talk.jobs.len() == before {
                bail!("job '{job_id}' not found");
            }
            Ok(())
        })
    }

    pub fn jobs(&self, talk_id: &str) -> Vec<Job> {
        self.get(talk_id)
            .map(|talk| talk.jobs)
            .unwrap_or_default()
    }

    /// Every active job across all talks, paired with its owner talk id.
    pub fn all_active_jobs(&self) -> Vec<(String, Job)> {
        let Ok(state) = self.inner.lock() else {
            return Vec::new();
        };
        let mut jobs = Vec::new();
        for talk in state.talks.values() {
            for job in &talk.jobs {
                if job.active {
                    jobs.push((talk.id.clone(), job.clone()));
                }
            }
        }
        jobs.sort_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.id.cmp(&right.1.id)));
        jobs
    }

    /// Stamps a finished run onto the job record.
    pub fn record_job_run(
        &self,
        talk_id: &str,
        job_id: &str,
        run_at: u64,
        status: JobReportStatus,
    ) -> Result<()> {
        self.mutate(talk_id, "jobs", "job-run-recorded", |talk| {
            let job = talk
                .jobs
                .iter_mut()
                .find(|job| job.id == job_id)
                .ok_or_else(|| anyhow!("job '{job_id}' not found"))?;
            job.last_run_at = Some(run_at);
            job.last_status = Some(status);
            Ok(())
        })?;
        Ok(())
    }

    /// The context document, cached for 30 seconds.
    pub fn context(&self, talk_id: &str) -> Result<String> {
        let now = current_unix_timestamp_ms();
        {
            let state = self.lock_state()?;
            if let Some(entry) = state.context_cache.get(talk_id) {
                if now.saturating_sub(entry.fetched_unix_ms) < CONTEXT_CACHE_TTL_MS {
                    return Ok(entry.content.clone());
                }
            }
        }
        let path = self.context_path(talk_id);
        let content = if path.exists() {
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
        } else {
            String::new()
        };
        let mut state = self.lock_state()?;
        state.context_cache.insert(
            talk_id.to_string(),
            ContextCacheEntry {
                content: content.clone(),
                fetched_unix_ms: now,
            },
        );
        Ok(content)
    }

    pub fn set_context(&self, talk_id: &str, content: &str) -> Result<()> {
        commit_text(&self.context_path(talk_id), content)?;
        {
            let mut state = self.lock_state()?;
            state.context_cache.insert(
                talk_id.to_string(),
                ContextCacheEntry {
                    content: content.to_string(),
                    fetched_unix_ms: current_unix_timestamp_ms(),
                },
            );
        }
        self.mutate(talk_id, "context", "context-updated", |_talk| Ok(()))?;
        Ok(())
    }

    pub fn append_report(&self, talk_id: &str, report: &JobReport) -> Result<()> {
        JsonlLog::open(self.reports_path(talk_id))?.append(report)
    }

    pub fn reports(&self, talk_id: &str) -> Result<Vec<JobReport>> {
        let (reports, _skipped) = read_jsonl_tolerant(&self.reports_path(talk_id))?;
        Ok(reports)
    }

    pub fn recent_reports(
        &self,
        talk_id: &str,
        since_unix_ms: Option<u64>,
        job_id: Option<&str>,
    ) -> Result<Vec<JobReport>> {
        let mut reports = self.reports(talk_id)?;
        if let Some(since) = since_unix_ms {
            reports.retain(|report| report.run_at >= since);
        }
        if let Some(job_id) = job_id {
            reports.retain(|report| report.job_id == job_id);
        }
        Ok(reports)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, StoreState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("talk store mutex is poisoned"))
    }

    fn mutate<F>(
        &self,
        talk_id: &str,
        modified_by: &str,
        event_type: &'static str,
        apply: F,
    ) -> Result<Talk>
    where
        F: FnOnce(&mut Talk) -> Result<()>,
    {
        let now = current_unix_timestamp_ms();
        let snapshot = {
            let mut state = self.lock_state()?;
            if state.deleted.contains(talk_id) {
                bail!("talk '{talk_id}' was deleted");
            }
            let talk = state
                .talks
                .get_mut(talk_id)
                .ok_or_else(|| anyhow!("talk '{talk_id}' not found"))?;
            apply(talk)?;
            talk.talk_version = talk.talk_version.saturating_add(1);
            talk.change_id =
                short_hash(format!("{talk_id}:{}:{now}", talk.talk_version).as_bytes());
            talk.last_modified_at = now;
            talk.last_modified_by = modified_by.to_string();
            talk.updated_at = now;
            let snapshot = talk.clone();
            persist_talk(&self.talks_dir, &snapshot)?;
            state.list_cache = None;
            snapshot
        };

        self.publish(ChangeEvent {
            event_type,
            talk_id: snapshot.id.clone(),
            talk_version: snapshot.talk_version,
            change_id: snapshot.change_id.clone(),
            timestamp: now,
            last_modified_by: Some(modified_by.to_string()),
        });
        Ok(snapshot)
    }

    fn publish(&self, event: ChangeEvent) {
        let Ok(listeners) = self.listeners.lock() else {
            return;
        };
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(
                    talk_id = %event.talk_id,
                    event_type = event.event_type,
                    "change listener panicked"
                );
            }
        }
    }
}

fn persist_talk(talks_dir: &Path, talk: &Talk) -> Result<()> {
    commit_json_pretty(&talks_dir.join(&talk.id).join("talk.json"), talk)
}

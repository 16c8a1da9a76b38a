//! Periodic tick that runs due cron and one-shot jobs.
//!
//! Recurring jobs fire when their cron expression lands inside the
//! half-open window `(last_tick, now]`, so a boundary never fires twice.
//! One-shot jobs fire once their target time passes and are never re-run.
//! Event jobs are dispatched elsewhere.

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clawtalk_core::current_unix_timestamp_ms;
use clawtalk_store::{Job, JobType, TalkStore};
use cron::Schedule;
use tokio::sync::watch;

use crate::job_executor::JobExecutor;
use crate::talk_run_set::TalkRunSet;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
/// Public struct `JobSchedulerConfig` used across ClawTalk components.
pub struct JobSchedulerConfig {
    pub executor: Arc<JobExecutor>,
    pub store: Arc<TalkStore>,
    pub run_set: Arc<TalkRunSet>,
    pub tick_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, PartialEq)]
/// One job selected for execution this tick.
pub struct DueJob {
    pub talk_id: String,
    pub job: Job,
}

fn parse_cron_schedule(raw: &str) -> Result<Schedule> {
    let trimmed = raw.trim();
    // Accept the classic 5-field form by pinning seconds to zero.
    let candidate = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&candidate)
        .with_context(|| format!("invalid cron expression '{trimmed}'"))
}

fn to_datetime(unix_ms: u64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(i64::try_from(unix_ms).unwrap_or(i64::MAX))
        .single()
        .ok_or_else(|| anyhow!("timestamp {unix_ms} out of range"))
}

/// True when the cron expression fires within `(last_tick, now]`.
fn cron_fires_in_window(schedule: &Schedule, last_tick_ms: u64, now_ms: u64) -> Result<bool> {
    let after = to_datetime(last_tick_ms)?;
    let Some(next) = schedule.after(&after).next() else {
        return Ok(false);
    };
    let next_ms = u64::try_from(next.timestamp_millis()).unwrap_or(u64::MAX);
    Ok(next_ms > last_tick_ms && next_ms <= now_ms)
}

fn once_target_unix_ms(schedule_raw: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(schedule_raw.trim())
        .ok()
        .and_then(|parsed| u64::try_from(parsed.timestamp_millis()).ok())
}

/// Due-set computation over every active job across all talks.
pub fn due_jobs(jobs: &[(String, Job)], last_tick_ms: u64, now_ms: u64) -> Vec<DueJob> {
    let mut due = Vec::new();
    for (talk_id, job) in jobs {
        if !job.active {
            continue;
        }
        let is_due = match job.job_type {
            JobType::Event => false,
            JobType::Once => {
                if job.last_run_at.is_some() {
                    false
                } else if let Some(target_ms) = once_target_unix_ms(&job.schedule) {
                    target_ms <= now_ms
                } else {
                    match parse_cron_schedule(&job.schedule) {
                        Ok(schedule) => cron_fires_in_window(&schedule, last_tick_ms, now_ms)
                            .unwrap_or(false),
                        Err(error) => {
                            tracing::warn!(%talk_id, job_id = %job.id, %error, "skipping job with bad schedule");
                            false
                        }
                    }
                }
            }
            JobType::Recurring => match parse_cron_schedule(&job.schedule) {
                Ok(schedule) => {
                    cron_fires_in_window(&schedule, last_tick_ms, now_ms).unwrap_or(false)
                }
                Err(error) => {
                    tracing::warn!(%talk_id, job_id = %job.id, %error, "skipping job with bad schedule");
                    false
                }
            },
        };
        if is_due {
            due.push(DueJob {
                talk_id: talk_id.clone(),
                job: job.clone(),
            });
        }
    }
    due
}

/// Runs the scheduler loop until the shutdown signal flips.
pub async fn run_job_scheduler(config: JobSchedulerConfig) -> Result<()> {
    let mut shutdown = config.shutdown.clone();
    let mut last_tick_ms = current_unix_timestamp_ms();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    println!("job scheduler shutdown requested");
                    return Ok(());
                }
                continue;
            }
            _ = tokio::time::sleep(config.tick_interval) => {}
        }

        let now_ms = current_unix_timestamp_ms();
        let jobs = config.store.all_active_jobs();
        let due = due_jobs(&jobs, last_tick_ms, now_ms);
        last_tick_ms = now_ms;
        if due.is_empty() {
            continue;
        }
        println!("job scheduler tick: due={}", due.len());

        let mut handles = Vec::new();
        for item in due {
            let Some(guard) = config.run_set.try_acquire(&item.talk_id) else {
                tracing::warn!(
                    talk_id = %item.talk_id,
                    job_id = %item.job.id,
                    "talk already running a job; deferring to next tick"
                );
                continue;
            };
            let executor = Arc::clone(&config.executor);
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                match executor
                    .execute_job(&item.talk_id, &item.job, None, "scheduler")
                    .await
                {
                    Ok(outcome) => {
                        println!(
                            "job run complete: talk={} job={} status={}",
                            item.talk_id,
                            item.job.id,
                            outcome.status.as_str()
                        );
                    }
                    Err(error) => {
                        eprintln!(
                            "job run failed: talk={} job={} error={error}",
                            item.talk_id, item.job.id
                        );
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use clawtalk_store::{JobOutput, JobReportStatus};

    use super::*;

    fn job(id: &str, job_type: JobType, schedule: &str) -> (String, Job) {
        (
            "t1".to_string(),
            Job {
                id: id.to_string(),
                job_type,
                schedule: schedule.to_string(),
                prompt: "run".to_string(),
                output: JobOutput::ReportOnly,
                active: true,
                created_at: 0,
                last_run_at: None,
                last_status: None,
            },
        )
    }

    // 2021-01-01T00:00:00Z
    const T0_MS: u64 = 1_609_459_200_000;

    #[test]
    fn unit_recurring_job_fires_inside_window_only() {
        // Hourly at minute zero.
        let jobs = vec![job("hourly", JobType::Recurring, "0 0 * * * *")];
        // Window covering 01:00:00 exactly.
        let last_tick = T0_MS + 59 * 60 * 1_000;
        let now = T0_MS + 60 * 60 * 1_000;
        assert_eq!(due_jobs(&jobs, last_tick, now).len(), 1);
        // The next window starts at the boundary; no double fire.
        let later = now + 60 * 1_000;
        assert!(due_jobs(&jobs, now, later).is_empty());
    }

    #[test]
    fn unit_recurring_accepts_five_field_cron() {
        let jobs = vec![job("daily", JobType::Recurring, "0 9 * * *")];
        // 08:59:30 -> 09:00:30 window on day one.
        let last_tick = T0_MS + (8 * 3600 + 59 * 60 + 30) * 1_000;
        let now = T0_MS + (9 * 3600 + 30) * 1_000;
        assert_eq!(due_jobs(&jobs, last_tick, now).len(), 1);
    }

    #[test]
    fn unit_once_job_fires_when_target_passes_and_never_again() {
        let jobs = vec![job("launch", JobType::Once, "2021-01-01T00:10:00Z")];
        let before = due_jobs(&jobs, T0_MS, T0_MS + 5 * 60 * 1_000);
        assert!(before.is_empty());
        let after = due_jobs(&jobs, T0_MS, T0_MS + 15 * 60 * 1_000);
        assert_eq!(after.len(), 1);

        let mut ran = jobs.clone();
        ran[0].1.last_run_at = Some(T0_MS + 10 * 60 * 1_000);
        ran[0].1.last_status = Some(JobReportStatus::Success);
        assert!(due_jobs(&ran, T0_MS, T0_MS + 30 * 60 * 1_000).is_empty());
    }

    #[test]
    fn unit_event_jobs_are_never_due_on_tick() {
        let jobs = vec![job("on-msg", JobType::Event, "on channel:C1")];
        assert!(due_jobs(&jobs, T0_MS, T0_MS + 3_600_000).is_empty());
    }

    #[test]
    fn regression_inactive_and_malformed_jobs_are_skipped() {
        let mut inactive = job("paused", JobType::Recurring, "0 * * * * *");
        inactive.1.active = false;
        let malformed = job("broken", JobType::Recurring, "not a cron");
        assert!(due_jobs(&[inactive, malformed], T0_MS, T0_MS + 3_600_000).is_empty());
    }
}

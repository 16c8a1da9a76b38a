//! Store behavior tests: versioning, pins, recovery, and log discipline.

use std::sync::{Arc, Mutex};

use tempfile::tempdir;

use super::*;

fn write_binding(store: &TalkStore, talk_id: &str, scope: &str) {
    store
        .update(
            talk_id,
            TalkPatch {
                platform_bindings: Some(vec![Binding {
                    id: "b1".to_string(),
                    platform: "slack".to_string(),
                    scope: scope.to_string(),
                    account_id: None,
                    display_scope: None,
                    permission: BindingPermission::Write,
                    created_at: 0,
                }]),
                ..TalkPatch::default()
            },
            "test",
        )
        .expect("bind talk");
}

#[test]
fn functional_change_events_have_strictly_increasing_versions() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let observed: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    store.subscribe({
        let observed = observed.clone();
        move |event| {
            observed
                .lock()
                .expect("observed lock")
                .push((event.talk_id.clone(), event.talk_version));
        }
    });

    let talk = store.create(Some("gpt-test")).expect("create");
    store
        .update(
            &talk.id,
            TalkPatch {
                topic_title: Some("study".to_string()),
                ..TalkPatch::default()
            },
            "tester",
        )
        .expect("update");
    store
        .append_message(&talk.id, MessageRole::User, "hello")
        .expect("append");

    let events = observed.lock().expect("observed lock").clone();
    assert!(events.len() >= 3);
    for pair in events.windows(2) {
        assert_eq!(pair[0].0, talk.id);
        assert!(pair[1].1 > pair[0].1, "versions must strictly increase");
    }
}

#[test]
fn functional_listener_panic_is_isolated_from_other_listeners() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let calls = Arc::new(Mutex::new(0_usize));
    store.subscribe(|_event| panic!("listener bug"));
    store.subscribe({
        let calls = calls.clone();
        move |_event| {
            *calls.lock().expect("calls lock") += 1;
        }
    });
    store.create(None).expect("create");
    assert_eq!(*calls.lock().expect("calls lock"), 1);
}

#[test]
fn functional_delete_messages_removes_dangling_pins_atomically() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    let first = store
        .append_message(&talk.id, MessageRole::User, "one")
        .expect("append");
    let second = store
        .append_message(&talk.id, MessageRole::User, "two")
        .expect("append");
    store.pin_message(&talk.id, &first.id).expect("pin first");
    store.pin_message(&talk.id, &second.id).expect("pin second");

    let removed = store
        .delete_messages(&talk.id, &[first.id.clone()])
        .expect("delete");
    assert_eq!(removed, 1);

    let talk = store.get(&talk.id).expect("talk");
    assert_eq!(talk.pinned_message_ids, vec![second.id.clone()]);
    let messages = store.get_messages(&talk.id).expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, second.id);
}

#[test]
fn regression_pinning_unknown_message_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    let error = store
        .pin_message(&talk.id, "msg-missing")
        .expect_err("pin should fail");
    assert!(error.to_string().contains("not found"));
}

#[test]
fn integration_deleted_talk_does_not_reappear_after_reload() {
    let temp = tempdir().expect("tempdir");
    let talk_id = {
        let store = TalkStore::open(temp.path()).expect("open store");
        let talk = store.create(None).expect("create");
        store.delete(&talk.id).expect("delete");
        assert!(store.get(&talk.id).is_none());
        talk.id
    };
    let reloaded = TalkStore::open(temp.path()).expect("reopen store");
    assert!(reloaded.get(&talk_id).is_none());
    assert!(reloaded.list().is_empty());
}

#[test]
fn integration_startup_clears_stale_processing_flags() {
    let temp = tempdir().expect("tempdir");
    let talk_id = {
        let store = TalkStore::open(temp.path()).expect("open store");
        let talk = store.create(None).expect("create");
        store.set_processing(&talk.id, true).expect("processing");
        talk.id
    };
    let reloaded = TalkStore::open(temp.path()).expect("reopen store");
    let talk = reloaded.get(&talk_id).expect("talk survives restart");
    assert!(!talk.processing);
}

#[test]
fn unit_set_processing_does_not_bump_version() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    let version = talk.talk_version;
    store.set_processing(&talk.id, true).expect("processing on");
    store.set_processing(&talk.id, false).expect("processing off");
    assert_eq!(store.get(&talk.id).expect("talk").talk_version, version);
}

#[test]
fn functional_list_is_sorted_by_updated_at_descending() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let first = store.create(None).expect("create");
    let second = store.create(None).expect("create");
    // Touch the first talk so it becomes the most recently updated.
    std::thread::sleep(std::time::Duration::from_millis(5));
    store
        .update(
            &first.id,
            TalkPatch {
                topic_title: Some("fresh".to_string()),
                ..TalkPatch::default()
            },
            "test",
        )
        .expect("update");
    let listed = store.list();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].id, second.id);
}

#[test]
fn integration_corrupt_talk_metadata_is_skipped_on_load() {
    let temp = tempdir().expect("tempdir");
    {
        let store = TalkStore::open(temp.path()).expect("open store");
        store.create(None).expect("create");
    }
    let broken_dir = temp.path().join("talks/broken-talk");
    std::fs::create_dir_all(&broken_dir).expect("mkdir");
    std::fs::write(broken_dir.join("talk.json"), "{not json").expect("write");

    let reloaded = TalkStore::open(temp.path()).expect("reopen store");
    assert_eq!(reloaded.list().len(), 1);
}

#[test]
fn functional_recent_reports_filters_by_since_and_job() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    for (job_id, run_at) in [("j1", 100_u64), ("j2", 200), ("j1", 300)] {
        store
            .append_report(
                &talk.id,
                &JobReport {
                    job_id: job_id.to_string(),
                    run_at,
                    status: JobReportStatus::Success,
                    full_output: "ok".to_string(),
                    error: None,
                },
            )
            .expect("append report");
    }
    let recent = store
        .recent_reports(&talk.id, Some(150), None)
        .expect("recent");
    assert_eq!(recent.len(), 2);
    let for_job = store
        .recent_reports(&talk.id, None, Some("j1"))
        .expect("recent for job");
    assert_eq!(for_job.len(), 2);
    assert!(for_job.iter().all(|report| report.job_id == "j1"));
}

#[test]
fn functional_job_lifecycle_and_active_listing() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    write_binding(&store, &talk.id, "channel:C1");
    store
        .add_job(
            &talk.id,
            Job {
                id: "daily".to_string(),
                job_type: JobType::Recurring,
                schedule: "0 0 9 * * *".to_string(),
                prompt: "summarize yesterday".to_string(),
                output: JobOutput::Talk,
                active: true,
                created_at: 0,
                last_run_at: None,
                last_status: None,
            },
        )
        .expect("add job");
    store
        .add_job(
            &talk.id,
            Job {
                id: "paused".to_string(),
                job_type: JobType::Once,
                schedule: "2099-01-01T00:00:00Z".to_string(),
                prompt: "never".to_string(),
                output: JobOutput::ReportOnly,
                active: false,
                created_at: 0,
                last_run_at: None,
                last_status: None,
            },
        )
        .expect("add job");

    let active = store.all_active_jobs();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].1.id, "daily");

    store
        .record_job_run(&talk.id, "daily", 12_345, JobReportStatus::Success)
        .expect("record run");
    let job = store
        .jobs(&talk.id)
        .into_iter()
        .find(|job| job.id == "daily")
        .expect("job");
    assert_eq!(job.last_run_at, Some(12_345));
    assert_eq!(job.last_status, Some(JobReportStatus::Success));
}

#[test]
fn functional_context_round_trip_with_cache() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    assert_eq!(store.context(&talk.id).expect("empty context"), "");
    store
        .set_context(&talk.id, "Weekly target: 5 hours.")
        .expect("set context");
    assert_eq!(
        store.context(&talk.id).expect("context"),
        "Weekly target: 5 hours."
    );
}

#[test]
fn regression_update_drops_behaviors_left_dangling_by_patch() {
    let temp = tempdir().expect("tempdir");
    let store = TalkStore::open(temp.path()).expect("open store");
    let talk = store.create(None).expect("create");
    write_binding(&store, &talk.id, "channel:C1");
    store
        .update(
            &talk.id,
            TalkPatch {
                platform_behaviors: Some(vec![Behavior {
                    id: "x1".to_string(),
                    platform_binding_id: "b1".to_string(),
                    ..Behavior::default()
                }]),
                ..TalkPatch::default()
            },
            "test",
        )
        .expect("add behavior");
    // Replacing the bindings orphans the behavior; it must be dropped.
    let updated = store
        .update(
            &talk.id,
            TalkPatch {
                platform_bindings: Some(Vec::new()),
                ..TalkPatch::default()
            },
            "test",
        )
        .expect("clear bindings");
    assert!(updated.platform_behaviors.is_empty());
}

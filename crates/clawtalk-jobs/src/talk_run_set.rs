//! Per-Talk at-most-one execution guard shared by the scheduler and the
//! event dispatcher.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

/// Tracks which talks currently have a job running. Guards release on drop,
/// so a panicking run still frees its talk.
#[derive(Default)]
pub struct TalkRunSet {
    running: Mutex<HashSet<String>>,
}

impl TalkRunSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims the talk for one run, or `None` when a run is already active.
    pub fn try_acquire(self: &Arc<Self>, talk_id: &str) -> Option<TalkRunGuard> {
        let mut running = self.running.lock().unwrap_or_else(|poisoned| {
            poisoned.into_inner()
        });
        if !running.insert(talk_id.to_string()) {
            return None;
        }
        Some(TalkRunGuard {
            set: Arc::clone(self),
            talk_id: talk_id.to_string(),
        })
    }

    pub fn is_running(&self, talk_id: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(talk_id))
            .unwrap_or(false)
    }
}

/// Releases the claimed talk when dropped.
pub struct TalkRunGuard {
    set: Arc<TalkRunSet>,
    talk_id: String,
}

impl Drop for TalkRunGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.set.running.lock() {
            running.remove(&self.talk_id);
        }
    }
}

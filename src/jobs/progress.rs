//! Refresh progress reporting
//!
//! A full refresh across several portals can take minutes; the status
//! endpoint polls this tracker instead of guessing from log output.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RefreshProgress {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub current_portal: Option<String>,
    pub step: String,
    pub portals_completed: usize,
    pub portals_total: usize,
    pub finished: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ProgressTracker {
    current: Mutex<Option<RefreshProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, portals_total: usize) -> Uuid {
        let run_id = Uuid::new_v4();
        *self.current.lock().expect("progress lock poisoned") = Some(RefreshProgress {
            run_id,
            started_at: Utc::now(),
            current_portal: None,
            step: "starting".to_string(),
            portals_completed: 0,
            portals_total,
            finished: false,
            finished_at: None,
        });
        run_id
    }

    pub fn set_step(&self, portal: Option<&str>, step: &str) {
        if let Some(progress) = self
            .current
            .lock()
            .expect("progress lock poisoned")
            .as_mut()
        {
            progress.current_portal = portal.map(str::to_string);
            progress.step = step.to_string();
        }
    }

    pub fn portal_done(&self) {
        if let Some(progress) = self
            .current
            .lock()
            .expect("progress lock poisoned")
            .as_mut()
        {
            progress.portals_completed += 1;
        }
    }

    pub fn finish(&self) {
        if let Some(progress) = self
            .current
            .lock()
            .expect("progress lock poisoned")
            .as_mut()
        {
            progress.current_portal = None;
            progress.step = "done".to_string();
            progress.finished = true;
            progress.finished_at = Some(Utc::now());
        }
    }

    /// Last known progress; `None` until the first refresh starts.
    pub fn snapshot(&self) -> Option<RefreshProgress> {
        self.current
            .lock()
            .expect("progress lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_a_run_from_start_to_finish() {
        let tracker = ProgressTracker::new();
        assert!(tracker.snapshot().is_none());

        let run_id = tracker.begin(2);
        tracker.set_step(Some("hotbird"), "channels");
        let mid = tracker.snapshot().unwrap();
        assert_eq!(mid.run_id, run_id);
        assert_eq!(mid.current_portal.as_deref(), Some("hotbird"));
        assert!(!mid.finished);

        tracker.portal_done();
        tracker.portal_done();
        tracker.finish();
        let end = tracker.snapshot().unwrap();
        assert_eq!(end.portals_completed, 2);
        assert!(end.finished);
        assert!(end.finished_at.is_some());
    }

    #[test]
    fn a_new_run_replaces_the_old_one() {
        let tracker = ProgressTracker::new();
        let first = tracker.begin(1);
        tracker.finish();
        let second = tracker.begin(3);
        let current = tracker.snapshot().unwrap();
        assert_ne!(first, second);
        assert_eq!(current.run_id, second);
        assert_eq!(current.portals_total, 3);
        assert!(!current.finished);
    }
}

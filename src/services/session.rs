use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::storage::store::{parse_iso, Session, Store};

/// Outcome of startup recovery.
#[derive(Debug)]
pub enum Recovery {
    /// The open session was adopted unchanged.
    Resumed(i64),
    /// A stale open session was closed (and possibly deleted for being too
    /// short); a fresh session was opened.
    Restarted {
        closed: Option<Session>,
        new_id: i64,
    },
    /// No open session existed; a fresh one was opened.
    Fresh(i64),
}

impl Recovery {
    pub fn current_id(&self) -> i64 {
        match self {
            Recovery::Resumed(id) => *id,
            Recovery::Restarted { new_id, .. } => *new_id,
            Recovery::Fresh(id) => *id,
        }
    }
}

/// Opens and closes contiguous activity sessions.
///
/// Holds the id of the single open session (I1) and the set of window titles
/// seen during it. Sessions shorter than the configured minimum are deleted
/// together with their dependent rows when they close.
pub struct SessionManager {
    store: Arc<Store>,
    min_session_minutes: u64,
    current: Mutex<Option<i64>>,
    seen_titles: Mutex<(i64, HashSet<String>)>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, min_session_minutes: u64) -> Arc<Self> {
        Arc::new(Self {
            store,
            min_session_minutes,
            current: Mutex::new(None),
            seen_titles: Mutex::new((0, HashSet::new())),
        })
    }

    pub fn current_session_id(&self) -> Option<i64> {
        *self.current.lock().unwrap()
    }

    pub fn start_session(&self) -> Result<i64> {
        self.start_session_at(Local::now().naive_local())
    }

    pub fn start_session_at(&self, start: NaiveDateTime) -> Result<i64> {
        let id = self.store.create_session(start)?;
        *self.current.lock().unwrap() = Some(id);
        *self.seen_titles.lock().unwrap() = (id, HashSet::new());
        log::info!("Started session {id}");
        Ok(id)
    }

    /// Close a session at `now`. Returns the closed session, or `None` when
    /// it was below the minimum duration and got deleted with its dependents.
    pub fn end_session(&self, id: i64) -> Result<Option<Session>> {
        self.end_session_at(id, Local::now().naive_local())
    }

    pub fn end_session_at(&self, id: i64, end: NaiveDateTime) -> Result<Option<Session>> {
        {
            let mut current = self.current.lock().unwrap();
            if *current == Some(id) {
                *current = None;
            }
        }

        let Some(session) = self.store.get_session(id)? else {
            return Ok(None);
        };
        let start = parse_iso(&session.start_time).unwrap_or(end);
        let duration_seconds = (end - start).num_seconds().max(0);

        if duration_seconds < (self.min_session_minutes * 60) as i64 {
            log::info!(
                "Session {id} lasted {duration_seconds}s (< {}m minimum), deleting",
                self.min_session_minutes
            );
            self.store.delete_session(id)?;
            return Ok(None);
        }

        self.store.end_session(id, end, duration_seconds)?;
        log::info!("Ended session {id}, duration {}m", duration_seconds / 60);
        self.store.get_session(id)
    }

    /// Resume-or-restart on daemon startup.
    ///
    /// An open session whose last linked screenshot is younger than the AFK
    /// timeout is adopted as-is; otherwise the previous daemon died during an
    /// AFK interval, so the stale session is closed at its last screenshot
    /// time (or `now` when it never captured anything) and a fresh session
    /// opens. This keeps restarts from fragmenting one activity period.
    pub fn recover_on_startup(&self, now: NaiveDateTime, afk_timeout_seconds: u64) -> Result<Recovery> {
        let Some(active) = self.store.get_active_session()? else {
            return Ok(Recovery::Fresh(self.start_session_at(now)?));
        };

        let last_ts = self.store.get_last_screenshot_timestamp_for_session(active.id)?;
        if let Some(last_ts) = last_ts {
            let now_ts = crate::storage::store::local_timestamp(now);
            let since_last = now_ts - last_ts;
            if since_last < afk_timeout_seconds as i64 {
                *self.current.lock().unwrap() = Some(active.id);
                *self.seen_titles.lock().unwrap() = (active.id, HashSet::new());
                log::info!(
                    "Resumed active session {} (last activity {since_last}s ago)",
                    active.id
                );
                return Ok(Recovery::Resumed(active.id));
            }

            log::info!(
                "Previous session {} stale ({since_last}s since last activity)",
                active.id
            );
            let end = chrono::DateTime::from_timestamp(last_ts, 0)
                .map(|utc| utc.with_timezone(&Local).naive_local())
                .unwrap_or(now);
            let closed = self.end_session_at(active.id, end)?;
            let new_id = self.start_session_at(now)?;
            return Ok(Recovery::Restarted { closed, new_id });
        }

        // Open session with no screenshots yet: nothing to judge staleness
        // by, just adopt it.
        *self.current.lock().unwrap() = Some(active.id);
        *self.seen_titles.lock().unwrap() = (active.id, HashSet::new());
        log::info!("Resumed empty session {}", active.id);
        Ok(Recovery::Resumed(active.id))
    }

    pub fn add_screenshot_to_session(&self, session_id: i64, screenshot_id: i64) -> Result<()> {
        self.store.link_screenshot_to_session(session_id, screenshot_id)
    }

    /// Track a window title within a session. Returns true the first time a
    /// title appears in this session.
    pub fn track_window_title(&self, session_id: i64, title: &str) -> bool {
        let mut seen = self.seen_titles.lock().unwrap();
        if seen.0 != session_id {
            *seen = (session_id, HashSet::new());
        }
        seen.1.insert(title.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::{local_timestamp, NewScreenshot};
    use chrono::Duration;

    fn dt(s: &str) -> NaiveDateTime {
        parse_iso(s).unwrap()
    }

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    fn link_screenshot(store: &Store, session_id: i64, ts: i64) -> i64 {
        let id = store
            .insert_screenshot(&NewScreenshot {
                timestamp: ts,
                filepath: format!("{ts}.webp"),
                dhash: "0000000000000000".to_string(),
                window_title: None,
                app_name: None,
                window_geometry: None,
                monitor: None,
            })
            .unwrap();
        store.link_screenshot_to_session(session_id, id).unwrap();
        id
    }

    #[test]
    fn short_session_leaves_no_rows() {
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let start = dt("2026-01-05T10:00:00");
        let sid = manager.start_session_at(start).unwrap();
        link_screenshot(&store, sid, local_timestamp(start) + 30);
        store.cache_ocr(sid, "title", "text", 1).unwrap();

        // 2 minutes < 5 minute minimum
        let closed = manager.end_session_at(sid, start + Duration::minutes(2)).unwrap();
        assert!(closed.is_none());
        assert!(store.get_session(sid).unwrap().is_none());
        assert!(store.get_session_screenshots(sid).unwrap().is_empty());
        assert!(store.get_cached_ocr(sid, "title").unwrap().is_none());
        assert_eq!(manager.current_session_id(), None);
    }

    #[test]
    fn long_session_closes_with_counts() {
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let start = dt("2026-01-05T10:00:00");
        let sid = manager.start_session_at(start).unwrap();
        link_screenshot(&store, sid, local_timestamp(start) + 30);

        let closed = manager
            .end_session_at(sid, start + Duration::minutes(30))
            .unwrap()
            .unwrap();
        assert_eq!(closed.duration_seconds, Some(1800));
        assert_eq!(closed.screenshot_count, 1);
        assert_eq!(closed.end_time.as_deref(), Some("2026-01-05T10:30:00"));
    }

    #[test]
    fn recovery_resumes_recent_session() {
        // S3: last linked screenshot 60s ago, afk_timeout 180s
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let now = dt("2026-01-05T12:31:00");
        let sid = store.create_session(dt("2026-01-05T12:00:00")).unwrap();
        link_screenshot(&store, sid, local_timestamp(now) - 60);

        let recovery = manager.recover_on_startup(now, 180).unwrap();
        assert!(matches!(recovery, Recovery::Resumed(id) if id == sid));
        assert_eq!(manager.current_session_id(), Some(sid));
        // Same session, still open
        let session = store.get_session(sid).unwrap().unwrap();
        assert!(session.end_time.is_none());
    }

    #[test]
    fn recovery_restarts_after_afk() {
        // S4: last linked screenshot 10 minutes ago
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let now = dt("2026-01-05T12:10:00");
        let sid = store.create_session(dt("2026-01-05T11:00:00")).unwrap();
        let last_ts = local_timestamp(dt("2026-01-05T12:00:00"));
        link_screenshot(&store, sid, last_ts);

        let recovery = manager.recover_on_startup(now, 180).unwrap();
        let Recovery::Restarted { closed, new_id } = recovery else {
            panic!("expected restart");
        };
        let closed = closed.expect("hour-long session is kept");
        assert_eq!(closed.id, sid);
        // Closed at the last screenshot, not at `now`
        assert_eq!(closed.end_time.as_deref(), Some("2026-01-05T12:00:00"));
        assert_ne!(new_id, sid);
        assert_eq!(manager.current_session_id(), Some(new_id));

        // I1 holds: only the fresh session is open
        let active = store.get_active_session().unwrap().unwrap();
        assert_eq!(active.id, new_id);
    }

    #[test]
    fn recovery_adopts_empty_open_session() {
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let sid = store.create_session(dt("2026-01-05T12:00:00")).unwrap();

        let recovery = manager.recover_on_startup(dt("2026-01-05T12:30:00"), 180).unwrap();
        assert!(matches!(recovery, Recovery::Resumed(id) if id == sid));
    }

    #[test]
    fn recovery_starts_fresh_without_open_session() {
        let store = store();
        let manager = SessionManager::new(Arc::clone(&store), 5);
        let recovery = manager.recover_on_startup(dt("2026-01-05T09:00:00"), 180).unwrap();
        assert!(matches!(recovery, Recovery::Fresh(_)));
        assert!(manager.current_session_id().is_some());
    }

    #[test]
    fn title_tracking_is_per_session() {
        let store = store();
        let manager = SessionManager::new(store, 5);
        let a = manager.start_session_at(dt("2026-01-05T10:00:00")).unwrap();
        assert!(manager.track_window_title(a, "docs"));
        assert!(!manager.track_window_title(a, "docs"));
        assert!(manager.track_window_title(a, "bash"));

        let b = manager.start_session_at(dt("2026-01-05T11:00:00")).unwrap();
        assert!(manager.track_window_title(b, "docs"));
    }
}

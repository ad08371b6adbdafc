use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::services::window_info::{self, ActiveWindow};
use crate::storage::config::{PrivacyConfig, TrackingConfig};

/// Returns the id of the session active right now, if any.
pub type SessionIdProvider = Arc<dyn Fn() -> Option<i64> + Send + Sync>;

/// A completed window focus period, ready to persist.
#[derive(Debug, Clone)]
pub struct CompletedFocus {
    pub window_title: String,
    pub app_name: String,
    pub window_class: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    /// Captured when focus began, not when the row is written.
    pub session_id: Option<i64>,
}

impl CompletedFocus {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
struct InProgressFocus {
    window_id: String,
    window_title: String,
    app_name: String,
    window_class: String,
    start_time: NaiveDateTime,
    session_id: Option<i64>,
}

pub type FocusCallback = Arc<dyn Fn(CompletedFocus) + Send + Sync>;

/// Polls the active window and emits completed focus events.
///
/// The session id is stamped the moment focus starts; an AFK boundary is
/// handled by `flush_current_event`, which closes the current focus at `now`
/// without opening a new one, so durations never absorb AFK time.
pub struct FocusWatcher {
    poll_interval: Duration,
    min_duration: f64,
    tracking: TrackingConfig,
    privacy: PrivacyConfig,
    session_id_provider: SessionIdProvider,
    on_focus_change: FocusCallback,
    current: Mutex<Option<InProgressFocus>>,
}

impl FocusWatcher {
    pub fn new(
        poll_seconds: f64,
        tracking: TrackingConfig,
        privacy: PrivacyConfig,
        session_id_provider: SessionIdProvider,
        on_focus_change: FocusCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            poll_interval: Duration::from_secs_f64(poll_seconds.max(0.1)),
            min_duration: tracking.min_focus_duration,
            tracking,
            privacy,
            session_id_provider,
            on_focus_change,
            current: Mutex::new(None),
        })
    }

    fn is_transient(&self, window: &ActiveWindow) -> bool {
        self.tracking
            .transient_window_classes
            .iter()
            .any(|class| {
                window.window_class.eq_ignore_ascii_case(class)
                    || window.app_name.eq_ignore_ascii_case(class)
            })
    }

    fn is_excluded(&self, window: &ActiveWindow) -> bool {
        let app_match = self.privacy.excluded_apps.iter().any(|app| {
            window.app_name.eq_ignore_ascii_case(app)
                || window.window_class.eq_ignore_ascii_case(app)
        });
        let title_match = self
            .privacy
            .excluded_titles
            .iter()
            .any(|needle| window.title.contains(needle.as_str()));
        app_match || title_match
    }

    /// Handle one observed active window. Exposed for tests; the spawned
    /// loop calls this every tick.
    fn observe(&self, window: &ActiveWindow, now: NaiveDateTime) {
        // Transient windows never close out the current focus
        if self.is_transient(window) {
            return;
        }
        if self.is_excluded(window) {
            log::debug!("Excluded window focused, flushing current focus");
            self.flush_at(now);
            return;
        }

        {
            let current = self.current.lock().unwrap();
            if let Some(existing) = current.as_ref() {
                if existing.window_id == window.window_id {
                    return;
                }
            }
        }

        // Stamp the session id NOW, at focus start. The provider is a
        // callback, so it runs outside the focus lock.
        let session_id = (self.session_id_provider)();

        let completed = {
            let mut current = self.current.lock().unwrap();
            let previous = current.take();
            *current = Some(InProgressFocus {
                window_id: window.window_id.clone(),
                window_title: window.title.clone(),
                app_name: window.app_name.clone(),
                window_class: window.window_class.clone(),
                start_time: now,
                session_id,
            });
            previous.and_then(|p| self.complete(p, now))
        };

        // Callback runs outside the lock
        if let Some(event) = completed {
            (self.on_focus_change)(event);
        }
    }

    fn complete(&self, focus: InProgressFocus, end: NaiveDateTime) -> Option<CompletedFocus> {
        let event = CompletedFocus {
            window_title: focus.window_title,
            app_name: focus.app_name,
            window_class: focus.window_class,
            start_time: focus.start_time,
            end_time: end,
            session_id: focus.session_id,
        };
        if event.duration_seconds() >= self.min_duration {
            Some(event)
        } else {
            None
        }
    }

    /// Close out the current focus at `now` without opening a new one.
    /// Called by the orchestrator on `active -> afk` and on shutdown.
    pub fn flush_current_event(&self) -> Option<CompletedFocus> {
        self.flush_at(Local::now().naive_local())
    }

    fn flush_at(&self, now: NaiveDateTime) -> Option<CompletedFocus> {
        let completed = {
            let mut current = self.current.lock().unwrap();
            current.take().and_then(|focus| self.complete(focus, now))
        };
        if let Some(event) = completed.clone() {
            (self.on_focus_change)(event);
        }
        completed
    }

    pub fn start(self: &Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            log::info!(
                "Focus watcher started (poll={:.1}s, min_duration={:.1}s)",
                watcher.poll_interval.as_secs_f64(),
                watcher.min_duration
            );
            let mut ticker = tokio::time::interval(watcher.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(window) = window_info::active_window().await {
                            watcher.observe(&window, Local::now().naive_local());
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            log::info!("Focus watcher stopped");
                            break;
                        }
                    }
                }
            }
        });
    }
}

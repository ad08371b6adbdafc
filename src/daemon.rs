use anyhow::Result;
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::afk::{AfkWatcher, XInputSource};
use crate::services::focus::{CompletedFocus, FocusWatcher};
use crate::services::monitors::Monitors;
use crate::services::screenshot::{DHash, ScreenCapture};
use crate::services::session::{Recovery, SessionManager};
use crate::services::summarizer::SummarizerWorker;
use crate::services::window_info::{self, ActiveWindow};
use crate::storage::config::Config;
use crate::storage::store::{MonitorMeta, NewScreenshot, Store, WindowGeometry};
use crate::TrackerError;

/// Capture-loop duplicate discard threshold, in dhash bits.
const DUPLICATE_DISTANCE: u32 = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct CaptureContext {
    window: Option<ActiveWindow>,
    region: Option<WindowGeometry>,
    monitor: Option<MonitorMeta>,
}

/// Wires the components together and runs until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let data_dir = config.data_dir();
    log::info!("Activity daemon starting (data dir {})", data_dir.display());

    // Startup failures here are fatal: a store we cannot open or a
    // screenshots directory we cannot create means nothing can be tracked.
    let store = Arc::new(Store::open(&config.db_path())?);
    let capture = Arc::new(ScreenCapture::new(config.screenshots_dir())?);
    let monitors = Arc::new(Monitors::new());
    let session_manager = SessionManager::new(Arc::clone(&store), config.afk.min_session_minutes);
    let worker = SummarizerWorker::new(
        Arc::clone(&store),
        config.summarization.clone(),
        Arc::clone(&capture),
        data_dir.clone(),
    );

    let (stop_tx, stop_rx) = watch::channel(false);

    // Resume-or-restart before anything else observes the session state
    let recovery = session_manager.recover_on_startup(
        Local::now().naive_local(),
        config.afk.timeout_seconds,
    )?;
    if let Recovery::Restarted { closed: Some(stale), .. } = &recovery {
        if config.summarization.enabled {
            let worker = Arc::clone(&worker);
            let stale = stale.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.summarize_closed_session(&stale).await {
                    log::error!("Stale session summarization failed: {e}");
                }
            });
        }
    }

    // AFK transitions drive the session lifecycle. Both callbacks run
    // outside the detector's state lock.
    let afk = AfkWatcher::new(config.afk.timeout_seconds, config.afk.poll_seconds);

    let focus_watcher = {
        let provider_manager = Arc::clone(&session_manager);
        let sink_store = Arc::clone(&store);
        FocusWatcher::new(
            1.0,
            config.tracking.clone(),
            config.privacy.clone(),
            Arc::new(move || provider_manager.current_session_id()),
            Arc::new(move |event: CompletedFocus| {
                if let Err(e) = sink_store.save_focus_event(
                    &event.window_title,
                    &event.app_name,
                    Some(&event.window_class),
                    event.start_time,
                    event.end_time,
                    event.session_id,
                    None,
                ) {
                    log::error!("Failed to save focus event: {e}");
                }
            }),
        )
    };

    {
        let on_afk_manager = Arc::clone(&session_manager);
        let on_afk_focus = Arc::clone(&focus_watcher);
        let on_afk_worker = Arc::clone(&worker);
        let summarize_on_close = config.summarization.enabled;
        let on_active_manager = Arc::clone(&session_manager);
        afk.set_callbacks(
            Arc::new(move || {
                // Flush the in-flight focus first so its duration never
                // absorbs AFK time, then close the session.
                on_afk_focus.flush_current_event();
                if let Some(session_id) = on_afk_manager.current_session_id() {
                    match on_afk_manager.end_session(session_id) {
                        Ok(Some(closed)) if summarize_on_close => {
                            let worker = Arc::clone(&on_afk_worker);
                            tokio::spawn(async move {
                                if let Err(e) = worker.summarize_closed_session(&closed).await {
                                    log::error!("Session summarization failed: {e}");
                                }
                            });
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("Failed to end session {session_id}: {e}"),
                    }
                }
            }),
            Arc::new(move || {
                if on_active_manager.current_session_id().is_none() {
                    if let Err(e) = on_active_manager.start_session() {
                        log::error!("Failed to start session: {e}");
                    }
                }
            }),
        );
    }

    afk.start(stop_rx.clone());
    XInputSource::start(Arc::clone(&afk), stop_rx.clone());
    focus_watcher.start(stop_rx.clone());
    worker.start(stop_rx.clone());
    spawn_capture_loop(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&capture),
        Arc::clone(&monitors),
        Arc::clone(&session_manager),
        Arc::clone(&afk),
        stop_rx.clone(),
    );

    wait_for_shutdown_signal().await;
    log::info!("Shutdown signal received, stopping tasks");
    let _ = stop_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    // Close out state: flush the in-flight focus, then the session
    focus_watcher.flush_current_event();
    if let Some(session_id) = session_manager.current_session_id() {
        match session_manager.end_session(session_id) {
            Ok(Some(_)) => log::info!("Ended session {session_id} on shutdown"),
            Ok(None) => {}
            Err(e) => log::error!("Failed to end session {session_id} on shutdown: {e}"),
        }
    }

    log::info!("Activity daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    log::warn!("Cannot install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_capture_loop(
    config: Config,
    store: Arc<Store>,
    capture: Arc<ScreenCapture>,
    monitors: Arc<Monitors>,
    session_manager: Arc<SessionManager>,
    afk: Arc<AfkWatcher>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.capture.interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);
        let mut last_hash: Option<DHash> = None;
        let mut permission_denied_logged = false;
        log::info!("Capture loop started ({}s interval)", interval.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = capture_tick(
                        &config, &store, &capture, &monitors, &session_manager, &afk, &mut last_hash,
                    ).await {
                        match e.downcast_ref::<TrackerError>() {
                            Some(TrackerError::DisplayUnavailable | TrackerError::NoMonitors) => {
                                log::warn!("Capture skipped: {e}");
                            }
                            // Logged once at runtime, then suppressed
                            Some(TrackerError::PermissionDenied(_)) => {
                                if !permission_denied_logged {
                                    log::error!("Capture tick failed: {e}");
                                    permission_denied_logged = true;
                                } else {
                                    log::debug!("Capture tick failed: {e}");
                                }
                            }
                            _ => log::error!("Capture tick failed: {e}"),
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        log::info!("Capture loop stopped");
                        break;
                    }
                }
            }
        }
    });
}

/// Decide what to capture this tick from the focused window: the capture
/// region (active monitor), the window context to stamp on the row, and the
/// monitor metadata.
async fn capture_context(config: &Config, monitors: &Monitors) -> Option<CaptureContext> {
    let window = window_info::active_window().await;

    // Privacy: an excluded focused app suppresses the capture entirely
    if let Some(w) = &window {
        let excluded_app = config.privacy.excluded_apps.iter().any(|app| {
            w.app_name.eq_ignore_ascii_case(app) || w.window_class.eq_ignore_ascii_case(app)
        });
        let excluded_title = config
            .privacy
            .excluded_titles
            .iter()
            .any(|needle| w.title.contains(needle.as_str()));
        if excluded_app || excluded_title {
            log::debug!("Excluded window focused, skipping capture");
            return None;
        }
    }

    // Transient windows contribute no context
    let window = window.filter(|w| {
        !(config.capture.skip_transient_windows
            && config
                .tracking
                .transient_window_classes
                .iter()
                .any(|class| {
                    w.window_class.eq_ignore_ascii_case(class)
                        || w.app_name.eq_ignore_ascii_case(class)
                }))
    });

    let (region, monitor) = if config.capture.capture_active_monitor_only {
        match window.as_ref().and_then(|w| w.geometry.clone()) {
            Some(geometry) => {
                let m = monitors.monitor_for_window(&geometry).await;
                (
                    Some(WindowGeometry { x: m.x, y: m.y, width: m.width, height: m.height }),
                    Some(MonitorMeta { name: m.name, width: m.width, height: m.height }),
                )
            }
            None => {
                let m = monitors.primary_monitor().await;
                (None, Some(MonitorMeta { name: m.name, width: m.width, height: m.height }))
            }
        }
    } else {
        (None, None)
    };

    Some(CaptureContext { window, region, monitor })
}

#[allow(clippy::too_many_arguments)]
async fn capture_tick(
    config: &Config,
    store: &Arc<Store>,
    capture: &Arc<ScreenCapture>,
    monitors: &Arc<Monitors>,
    session_manager: &Arc<SessionManager>,
    afk: &Arc<AfkWatcher>,
    last_hash: &mut Option<DHash>,
) -> Result<()> {
    let Some(context) = capture_context(config, monitors).await else {
        return Ok(());
    };

    let (filepath, hash_hex) = capture.capture_screen(context.region.as_ref())?;
    let hash = DHash::from_hex(&hash_hex)
        .ok_or_else(|| anyhow::anyhow!("invalid dhash {hash_hex}"))?;

    if let Some(previous) = last_hash.as_ref() {
        let distance = previous.distance(&hash);
        if distance < DUPLICATE_DISTANCE {
            log::debug!("Screenshot too similar to previous (distance {distance}), discarding");
            if let Err(e) = std::fs::remove_file(&filepath) {
                log::warn!("Could not delete duplicate screenshot {}: {e}", filepath.display());
            }
            return Ok(());
        }
    }
    *last_hash = Some(hash);

    // Store paths relative to the screenshots root
    let relative = filepath
        .strip_prefix(config.screenshots_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| filepath.clone());

    let screenshot_id = store.insert_screenshot(&NewScreenshot {
        timestamp: Local::now().timestamp(),
        filepath: relative.to_string_lossy().to_string(),
        dhash: hash_hex,
        window_title: context.window.as_ref().map(|w| w.title.clone()),
        app_name: context.window.as_ref().map(|w| w.app_name.clone()),
        window_geometry: context.window.as_ref().and_then(|w| w.geometry.clone()),
        monitor: context.monitor,
    })?;

    // Link into the session unless the user is AFK; an unlinked row records
    // that the frame fell outside any session
    if !afk.is_afk() {
        if let Some(session_id) = session_manager.current_session_id() {
            session_manager.add_screenshot_to_session(session_id, screenshot_id)?;
            if let Some(title) = context.window.as_ref().map(|w| w.title.as_str()) {
                if !title.is_empty() && session_manager.track_window_title(session_id, title) {
                    let preview: String = title.chars().take(50).collect();
                    log::info!("New window in session: {preview}");
                }
            }
        }
    }

    log::debug!(
        "Saved screenshot {screenshot_id}: {}",
        filepath.file_name().and_then(|n| n.to_str()).unwrap_or("?")
    );
    Ok(())
}

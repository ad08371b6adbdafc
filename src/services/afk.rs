use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Callback fired on AFK state transitions. Always invoked outside the
/// detector's state lock.
pub type TransitionCallback = Arc<dyn Fn() + Send + Sync>;

struct AfkState {
    last_input: Instant,
    is_afk: bool,
}

/// Idle timer driven by input events.
///
/// Input events flip `afk -> active` immediately; the poll task is the only
/// path for `active -> afk`. In degraded mode (no input source running)
/// `is_afk` stays false forever and the daemon behaves as if the user were
/// always active.
pub struct AfkWatcher {
    timeout: Duration,
    poll_interval: Duration,
    state: Mutex<AfkState>,
    on_afk: Mutex<Option<TransitionCallback>>,
    on_active: Mutex<Option<TransitionCallback>>,
}

impl AfkWatcher {
    pub fn new(timeout_seconds: u64, poll_seconds: f64) -> Arc<Self> {
        Arc::new(Self {
            timeout: Duration::from_secs(timeout_seconds),
            poll_interval: Duration::from_secs_f64(poll_seconds.max(0.1)),
            state: Mutex::new(AfkState {
                last_input: Instant::now(),
                is_afk: false,
            }),
            on_afk: Mutex::new(None),
            on_active: Mutex::new(None),
        })
    }

    pub fn set_callbacks(&self, on_afk: TransitionCallback, on_active: TransitionCallback) {
        *self.on_afk.lock().unwrap() = Some(on_afk);
        *self.on_active.lock().unwrap() = Some(on_active);
    }

    pub fn is_afk(&self) -> bool {
        self.state.lock().unwrap().is_afk
    }

    pub fn seconds_since_last_input(&self) -> f64 {
        self.state.lock().unwrap().last_input.elapsed().as_secs_f64()
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Record an input event. If the user was AFK this immediately
    /// transitions to active and fires `on_active`, so a new session exists
    /// before the focus watcher can stamp events with a stale session id.
    pub fn notify_input(&self) {
        let fire_active = {
            let mut state = self.state.lock().unwrap();
            state.last_input = Instant::now();
            if state.is_afk {
                state.is_afk = false;
                true
            } else {
                false
            }
        };

        if fire_active {
            log::info!("User became active (immediate detection)");
            let callback = self.on_active.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// One poll step. Decides the transition under the lock, fires the
    /// callback after releasing it. Returns the fired transition for tests.
    fn poll_once(&self) -> Option<bool> {
        let (fire_afk, fire_active) = {
            let mut state = self.state.lock().unwrap();
            let idle = state.last_input.elapsed();
            if idle >= self.timeout && !state.is_afk {
                state.is_afk = true;
                (true, false)
            } else if idle < self.timeout && state.is_afk {
                state.is_afk = false;
                (false, true)
            } else {
                (false, false)
            }
        };

        if fire_afk {
            log::info!(
                "User went AFK after {:.0}s of inactivity",
                self.timeout.as_secs_f64()
            );
            let callback = self.on_afk.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
            return Some(true);
        }
        if fire_active {
            log::info!("User became active");
            let callback = self.on_active.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
            return Some(false);
        }
        None
    }

    /// Spawn the poll task. It exits when the stop channel flips to true.
    pub fn start(self: &Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            log::info!(
                "AFK poll loop started (timeout={}s, poll={:.1}s)",
                watcher.timeout.as_secs(),
                watcher.poll_interval.as_secs_f64()
            );
            let mut ticker = tokio::time::interval(watcher.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        watcher.poll_once();
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            log::info!("AFK poll loop stopped");
                            break;
                        }
                    }
                }
            }
        });
    }
}

/// Input event source feeding the AFK detector.
///
/// Streams `xinput test-xi2 --root`, treating every emitted line as an input
/// event. If the subprocess cannot be spawned the detector runs degraded
/// (always active).
pub struct XInputSource;

impl XInputSource {
    pub fn start(watcher: Arc<AfkWatcher>, mut stop_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let child = tokio::process::Command::new("xinput")
                .args(["test-xi2", "--root"])
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    log::warn!(
                        "Input listener unavailable ({e}); AFK detection disabled, always reporting active"
                    );
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                log::warn!("Input listener has no stdout; AFK detection disabled");
                return;
            };
            log::info!("Input listener started (xinput test-xi2)");

            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(_)) => watcher.notify_input(),
                            Ok(None) => {
                                log::warn!("Input listener stream ended; AFK detection degraded");
                                break;
                            }
                            Err(e) => {
                                log::warn!("Input listener read error: {e}");
                                break;
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            let _ = child.kill().await;
            log::info!("Input listener stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_callbacks(
        watcher: &AfkWatcher,
    ) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let afk_count = Arc::new(AtomicUsize::new(0));
        let active_count = Arc::new(AtomicUsize::new(0));
        let afk = Arc::clone(&afk_count);
        let active = Arc::clone(&active_count);
        watcher.set_callbacks(
            Arc::new(move || {
                afk.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                active.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (afk_count, active_count)
    }

    #[test]
    fn idle_past_timeout_fires_afk_once() {
        let watcher = AfkWatcher::new(0, 5.0);
        let (afk_count, active_count) = counted_callbacks(&watcher);

        // timeout 0: any poll sees idle >= timeout
        assert_eq!(watcher.poll_once(), Some(true));
        assert!(watcher.is_afk());
        // Second poll does not re-fire
        assert_eq!(watcher.poll_once(), None);
        assert_eq!(afk_count.load(Ordering::SeqCst), 1);
        assert_eq!(active_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn input_event_fires_active_immediately() {
        let watcher = AfkWatcher::new(0, 5.0);
        let (afk_count, active_count) = counted_callbacks(&watcher);

        watcher.poll_once();
        assert!(watcher.is_afk());

        watcher.notify_input();
        assert!(!watcher.is_afk());
        assert_eq!(active_count.load(Ordering::SeqCst), 1);
        assert_eq!(afk_count.load(Ordering::SeqCst), 1);

        // While active, input events do not fire callbacks
        watcher.notify_input();
        assert_eq!(active_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn input_never_drives_afk_transition() {
        let watcher = AfkWatcher::new(3600, 5.0);
        let (afk_count, _) = counted_callbacks(&watcher);
        for _ in 0..10 {
            watcher.notify_input();
        }
        assert!(!watcher.is_afk());
        assert_eq!(afk_count.load(Ordering::SeqCst), 0);
        assert!(watcher.seconds_since_last_input() < 3600.0);
    }

    #[test]
    fn callbacks_can_reenter_public_api() {
        // A transition callback that reads the detector's state must not
        // deadlock: callbacks run outside the state lock.
        let watcher = AfkWatcher::new(0, 5.0);
        let probe = Arc::clone(&watcher);
        let observed = Arc::new(Mutex::new(None));
        let observed_clone = Arc::clone(&observed);
        watcher.set_callbacks(
            Arc::new(move || {
                *observed_clone.lock().unwrap() = Some(probe.is_afk());
            }),
            Arc::new(|| {}),
        );
        watcher.poll_once();
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }
}

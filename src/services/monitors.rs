use regex::Regex;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::store::WindowGeometry;

const CACHE_TTL: Duration = Duration::from_secs(60);
const XRANDR_TIMEOUT: Duration = Duration::from_secs(5);

/// A physical monitor in the virtual screen layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub name: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub primary: bool,
}

impl MonitorInfo {
    pub fn contains_point(&self, x: i64, y: i64) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Overlap area with a rectangle, in square pixels.
    pub fn overlap_area(&self, geo: &WindowGeometry) -> i64 {
        let left = self.x.max(geo.x);
        let top = self.y.max(geo.y);
        let right = (self.x + self.width).min(geo.x + geo.width);
        let bottom = (self.y + self.height).min(geo.y + geo.height);
        if left < right && top < bottom {
            (right - left) * (bottom - top)
        } else {
            0
        }
    }
}

fn fallback_monitor() -> MonitorInfo {
    MonitorInfo {
        name: "primary".to_string(),
        x: 0,
        y: 0,
        width: 1920,
        height: 1080,
        primary: true,
    }
}

/// Parse `xrandr --query` output. Matches lines like
/// `DP-1 connected primary 3840x2160+0+0` and
/// `HDMI-0 connected 2560x1440+3840+0`.
fn parse_xrandr(output: &str) -> Vec<MonitorInfo> {
    let pattern = Regex::new(r"(\S+) connected (primary )?(\d+)x(\d+)\+(\d+)\+(\d+)")
        .expect("static regex");
    let mut monitors: Vec<MonitorInfo> = pattern
        .captures_iter(output)
        .filter_map(|caps| {
            Some(MonitorInfo {
                name: caps.get(1)?.as_str().to_string(),
                primary: caps.get(2).is_some(),
                width: caps.get(3)?.as_str().parse().ok()?,
                height: caps.get(4)?.as_str().parse().ok()?,
                x: caps.get(5)?.as_str().parse().ok()?,
                y: caps.get(6)?.as_str().parse().ok()?,
            })
        })
        .collect();
    // Primary first, then by name, so selection fallbacks are deterministic
    monitors.sort_by(|a, b| (!a.primary, &a.name).cmp(&(!b.primary, &b.name)));
    monitors
}

/// Monitor discovery with a short cache and a synthetic primary fallback.
/// Discovery failures never propagate; callers always get at least one
/// monitor.
pub struct Monitors {
    cache: Mutex<Option<(Vec<MonitorInfo>, Instant)>>,
}

impl Default for Monitors {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitors {
    pub fn new() -> Self {
        Self { cache: Mutex::new(None) }
    }

    pub async fn list_monitors(&self) -> Vec<MonitorInfo> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((monitors, at)) = cache.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return monitors.clone();
                }
            }
        }

        let monitors = match self.query_xrandr().await {
            Some(parsed) if !parsed.is_empty() => parsed,
            _ => {
                log::debug!("Monitor discovery failed, using synthetic primary");
                vec![fallback_monitor()]
            }
        };

        *self.cache.lock().unwrap() = Some((monitors.clone(), Instant::now()));
        monitors
    }

    async fn query_xrandr(&self) -> Option<Vec<MonitorInfo>> {
        let output = tokio::time::timeout(
            XRANDR_TIMEOUT,
            tokio::process::Command::new("xrandr").arg("--query").output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(parse_xrandr(&String::from_utf8_lossy(&output.stdout)))
    }

    /// The monitor hosting a window: center containment wins when the center
    /// monitor holds more than half the window, otherwise largest overlap.
    /// Ties and misses fall back to the primary (then first) monitor.
    pub async fn monitor_for_window(&self, geo: &WindowGeometry) -> MonitorInfo {
        let monitors = self.list_monitors().await;
        monitor_for_window_in(&monitors, geo)
    }

    pub async fn primary_monitor(&self) -> MonitorInfo {
        let monitors = self.list_monitors().await;
        monitors
            .iter()
            .find(|m| m.primary)
            .or_else(|| monitors.first())
            .cloned()
            .unwrap_or_else(fallback_monitor)
    }
}

/// Pure selection over a known monitor list; `Monitors::monitor_for_window`
/// adds discovery and caching on top.
pub fn monitor_for_window_in(monitors: &[MonitorInfo], geo: &WindowGeometry) -> MonitorInfo {
    let first = monitors.first().cloned().unwrap_or_else(fallback_monitor);
    let primary = monitors.iter().find(|m| m.primary).cloned().unwrap_or_else(|| first.clone());

    let center_x = geo.x + geo.width / 2;
    let center_y = geo.y + geo.height / 2;
    if let Some(center_monitor) = monitors.iter().find(|m| m.contains_point(center_x, center_y)) {
        let window_area = geo.width * geo.height;
        if center_monitor.overlap_area(geo) * 2 > window_area {
            return center_monitor.clone();
        }
    }

    // Spanning window: largest overlap wins; monitors are sorted
    // (primary, name) so equal overlaps resolve deterministically
    let mut best: Option<(&MonitorInfo, i64)> = None;
    for m in monitors {
        let area = m.overlap_area(geo);
        if area > 0 && best.map_or(true, |(_, best_area)| area > best_area) {
            best = Some((m, area));
        }
    }

    best.map(|(m, _)| m.clone()).unwrap_or(primary)
}

use regex::Regex;
use std::time::Duration;
use tokio::process::Command;

use crate::storage::store::WindowGeometry;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of the currently focused window.
#[derive(Debug, Clone)]
pub struct ActiveWindow {
    pub window_id: String,
    pub title: String,
    pub app_name: String,
    pub window_class: String,
    pub pid: Option<i64>,
    pub geometry: Option<WindowGeometry>,
}

async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(QUERY_TIMEOUT, Command::new(program).args(args).output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Parse `WM_CLASS(STRING) = "instance", "Class"`. Returns
/// `(window_class, app_name)`: instance first, class as the app name.
fn parse_wm_class(output: &str) -> (String, String) {
    let Some((_, value)) = output.split_once('=') else {
        return (String::new(), "Unknown".to_string());
    };
    let quoted = Regex::new(r#""([^"]*)""#).expect("static regex");
    let values: Vec<String> = quoted
        .captures_iter(value)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    match values.as_slice() {
        [instance, class, ..] => (instance.clone(), class.clone()),
        [only] => (String::new(), only.clone()),
        [] => (String::new(), "Unknown".to_string()),
    }
}

/// Parse `xdotool getwindowgeometry --shell` output
/// (`WINDOW=…\nX=…\nY=…\nWIDTH=…\nHEIGHT=…\nSCREEN=…`).
fn parse_geometry(output: &str) -> Option<WindowGeometry> {
    let mut x = None;
    let mut y = None;
    let mut width = None;
    let mut height = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let Ok(value) = value.trim().parse::<i64>() else { continue };
        match key.trim() {
            "X" => x = Some(value),
            "Y" => y = Some(value),
            "WIDTH" => width = Some(value),
            "HEIGHT" => height = Some(value),
            _ => {}
        }
    }
    Some(WindowGeometry {
        x: x?,
        y: y?,
        width: width?,
        height: height?,
    })
}

/// Query the focused window through xdotool/xprop. Any sub-call timing out
/// or failing degrades to `None` (or to a partial snapshot for the optional
/// fields); errors never propagate.
pub async fn active_window() -> Option<ActiveWindow> {
    let window_id = run_tool("xdotool", &["getactivewindow"]).await?;

    let title = run_tool("xdotool", &["getwindowname", &window_id])
        .await
        .unwrap_or_default();

    let pid = match run_tool("xdotool", &["getwindowpid", &window_id]).await {
        Some(out) => out.parse().ok(),
        None => None,
    };

    let (window_class, app_name) = match run_tool("xprop", &["-id", &window_id, "WM_CLASS"]).await {
        Some(out) => parse_wm_class(&out),
        None => (String::new(), "Unknown".to_string()),
    };

    let geometry = run_tool("xdotool", &["getwindowgeometry", "--shell", &window_id])
        .await
        .and_then(|out| parse_geometry(&out));

    Some(ActiveWindow {
        window_id,
        title,
        app_name,
        window_class,
        pid,
        geometry,
    })
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Return `~/.config/activity-tracker/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("activity-tracker")
        .join("config.yaml")
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_seconds: u64,
    pub capture_active_monitor_only: bool,
    pub skip_transient_windows: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            capture_active_monitor_only: true,
            skip_transient_windows: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AfkConfig {
    pub timeout_seconds: u64,
    pub poll_seconds: f64,
    pub min_session_minutes: u64,
}

impl Default for AfkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 180,
            poll_seconds: 5.0,
            min_session_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub model: String,
    pub ollama_host: String,
    /// Slot length in minutes. Values dividing 60 keep slots hour-aligned;
    /// other values are tolerated.
    pub frequency_minutes: u32,
    pub include_focus_context: bool,
    pub include_screenshots: bool,
    pub include_ocr: bool,
    pub include_previous_summary: bool,
    pub max_samples: usize,
    pub sample_interval_minutes: u32,
    pub crop_to_window: bool,
    pub focus_weighted_sampling: bool,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gemma3:12b-it-qat".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            frequency_minutes: 15,
            include_focus_context: true,
            include_screenshots: true,
            include_ocr: true,
            include_previous_summary: true,
            max_samples: 10,
            sample_interval_minutes: 10,
            crop_to_window: true,
            focus_weighted_sampling: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/activity-tracker-data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// App class names excluded from focus tracking and capture context.
    pub excluded_apps: Vec<String>,
    /// Window title substrings excluded from focus tracking and capture context.
    pub excluded_titles: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            excluded_apps: vec![
                "1password".to_string(),
                "keepass".to_string(),
                "bitwarden".to_string(),
                "gnome-keyring".to_string(),
            ],
            excluded_titles: vec![
                "Private Browsing".to_string(),
                "Incognito".to_string(),
                "InPrivate".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub min_focus_duration: f64,
    /// Window classes whose appearance never closes out the current focus.
    pub transient_window_classes: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_focus_duration: 1.0,
            transient_window_classes: vec![
                "notification".to_string(),
                "popup".to_string(),
                "tooltip".to_string(),
                "dropdown".to_string(),
                "menu".to_string(),
                "Dunst".to_string(),
                "notify-osd".to_string(),
                "xfce4-notifyd".to_string(),
                "plank".to_string(),
                "cairo-dock".to_string(),
                "gnome-shell".to_string(),
                "Gjs".to_string(),
                "Desktop Icons".to_string(),
            ],
        }
    }
}

/// Process-lifetime configuration snapshot. Loaded once at startup;
/// components take clones of the sections they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub afk: AfkConfig,
    pub summarization: SummarizationConfig,
    pub storage: StorageConfig,
    pub privacy: PrivacyConfig,
    pub tracking: TrackingConfig,
}

impl Config {
    /// Load from the given path, falling back to defaults when the file is
    /// missing or unreadable. Unknown keys are tolerated.
    pub fn load(path: &PathBuf) -> Self {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                log::warn!("Failed to parse config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                log::warn!("Failed to read config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.data_dir().join("screenshots")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("activity.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.capture.interval_seconds, 30);
        assert_eq!(config.afk.timeout_seconds, 180);
        assert_eq!(config.afk.min_session_minutes, 5);
        assert_eq!(config.summarization.frequency_minutes, 15);
        assert_eq!(config.summarization.max_samples, 10);
        assert!(config.summarization.enabled);
        assert_eq!(config.storage.data_dir, "~/activity-tracker-data");
    }

    #[test]
    fn partial_yaml_merges_with_defaults() {
        let config = Config::parse(
            "summarization:\n  frequency_minutes: 30\n  model: llava:13b\nafk:\n  timeout_seconds: 60\n",
        )
        .unwrap();
        assert_eq!(config.summarization.frequency_minutes, 30);
        assert_eq!(config.summarization.model, "llava:13b");
        assert_eq!(config.afk.timeout_seconds, 60);
        // Untouched sections keep defaults
        assert_eq!(config.capture.interval_seconds, 30);
        assert!(config.summarization.include_ocr);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let config = Config::parse(
            "capture:\n  interval_seconds: 10\n  some_future_option: true\nnew_section:\n  x: 1\n",
        )
        .unwrap();
        assert_eq!(config.capture.interval_seconds, 10);
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde("~/activity-tracker-data");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("activity-tracker-data"));
    }
}

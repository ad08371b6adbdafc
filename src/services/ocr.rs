use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const OCR_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;

/// Check whether a binary is reachable through `PATH`.
pub fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

/// Text extraction from a screenshot via the system `tesseract` binary.
///
/// The image is downscaled to at most 1920x1080 and handed over as a
/// temporary PNG. Every failure degrades to an empty string.
pub struct OcrEngine;

impl OcrEngine {
    pub fn is_available() -> bool {
        binary_on_path("tesseract")
    }

    pub async fn extract_text(image_path: &Path) -> String {
        match Self::try_extract(image_path).await {
            Ok(text) => text,
            Err(e) => {
                log::warn!("OCR failed for {}: {e}", image_path.display());
                String::new()
            }
        }
    }

    async fn try_extract(image_path: &Path) -> Result<String> {
        let img = image::open(image_path)?;
        let img = if img.width() > MAX_WIDTH || img.height() > MAX_HEIGHT {
            img.resize(MAX_WIDTH, MAX_HEIGHT, FilterType::Lanczos3)
        } else {
            img
        };

        let tmp_path = std::env::temp_dir().join(format!(
            "activity-tracker-ocr-{}-{}.png",
            std::process::id(),
            image_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("frame")
        ));
        img.save(&tmp_path)?;

        let result = tokio::time::timeout(
            OCR_TIMEOUT,
            Command::new("tesseract")
                .arg(&tmp_path)
                .arg("stdout")
                .args(["--psm", "3"])
                .output(),
        )
        .await;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let output = result
            .map_err(|_| anyhow!("tesseract timed out after {}s", OCR_TIMEOUT.as_secs()))?
            .map_err(|e| anyhow!("spawning tesseract: {e}"))?;

        if !output.status.success() {
            return Err(anyhow!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

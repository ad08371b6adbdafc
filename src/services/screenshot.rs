use anyhow::{anyhow, Result};
use chrono::Local;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use xcap::Monitor;

use crate::error::TrackerError;
use crate::storage::store::WindowGeometry;

const HASH_SIZE: u32 = 8;
const WEBP_QUALITY: f32 = 80.0;
const CROP_WEBP_QUALITY: f32 = 85.0;

/// 64-bit perceptual difference hash.
///
/// The image is shrunk to a 9x8 grayscale grid; each of the 64 horizontal
/// neighbor pairs contributes one bit, set when brightness drops from left
/// to right. Bit i corresponds to pair i in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DHash {
    pub bits: u64,
}

impl DHash {
    pub fn compute(img: &DynamicImage) -> Self {
        let grid = img
            .resize_exact(HASH_SIZE + 1, HASH_SIZE, FilterType::Lanczos3)
            .to_luma8();

        // One row of the grid is HASH_SIZE + 1 luma bytes and yields
        // HASH_SIZE gradient bits
        let row_len = (HASH_SIZE + 1) as usize;
        let mut bits = 0u64;
        for (row_idx, row) in grid.as_raw().chunks_exact(row_len).enumerate() {
            for (pair_idx, pair) in row.windows(2).enumerate() {
                if pair[0] > pair[1] {
                    bits |= 1u64 << (row_idx * HASH_SIZE as usize + pair_idx);
                }
            }
        }
        DHash { bits }
    }

    /// Number of differing bits (0 = identical, 64 = opposite).
    pub fn distance(&self, other: &DHash) -> u32 {
        (self.bits ^ other.bits).count_ones()
    }

    /// Render as 16 lowercase hex digits, zero-padded.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.bits)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        u64::from_str_radix(hex, 16).ok().map(|bits| DHash { bits })
    }

    /// Loose public similarity comparison. The capture loop's duplicate
    /// discard uses its own tighter threshold.
    pub fn are_similar(&self, other: &DHash, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }
}

/// Clamp a window rectangle to the frame. Returns `None` when the crop would
/// be degenerate (empty after clamping, or covering the whole frame).
pub fn crop_rect(
    geometry: &WindowGeometry,
    frame_width: u32,
    frame_height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let fw = frame_width as i64;
    let fh = frame_height as i64;
    let x0 = geometry.x.clamp(0, fw);
    let y0 = geometry.y.clamp(0, fh);
    let x1 = (geometry.x + geometry.width).clamp(0, fw);
    let y1 = (geometry.y + geometry.height).clamp(0, fh);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    if x0 == 0 && y0 == 0 && x1 == fw && y1 == fh {
        // Fullscreen window, the crop would equal the original
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Sibling path for the cached cropped variant: `{name}_crop.webp`.
pub fn crop_cache_path(filepath: &Path) -> PathBuf {
    let stem = filepath.file_stem().and_then(|s| s.to_str()).unwrap_or("screenshot");
    filepath.with_file_name(format!("{stem}_crop.webp"))
}

fn encode_webp(img: &DynamicImage, quality: f32) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let encoder = webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height());
    Ok(encoder.encode(quality).to_vec())
}

/// Screenshot capture and on-disk organization.
///
/// Files land under `output_dir/YYYY/MM/DD/{HHMMSS}_{hash8}.webp`; the dhash
/// is computed before the file is written so callers can discard duplicates
/// without touching the database.
pub struct ScreenCapture {
    output_dir: PathBuf,
}

impl ScreenCapture {
    pub fn new(output_dir: PathBuf) -> Result<Self, TrackerError> {
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| TrackerError::from_io(&e, "creating screenshots directory"))?;
        Ok(Self { output_dir })
    }

    /// Capture the primary monitor, or an explicit region of the virtual
    /// screen, and save it. Returns the absolute path and the hex dhash.
    pub fn capture_screen(&self, region: Option<&WindowGeometry>) -> Result<(PathBuf, String), TrackerError> {
        let monitors = Monitor::all().map_err(|e| {
            log::warn!("Monitor enumeration failed: {e}");
            TrackerError::DisplayUnavailable
        })?;
        if monitors.is_empty() {
            return Err(TrackerError::NoMonitors);
        }

        let image = match region {
            Some(geo) => Self::capture_region(&monitors, geo)?,
            None => {
                let monitor = monitors
                    .iter()
                    .find(|m| m.is_primary().unwrap_or(false))
                    .or_else(|| monitors.first())
                    .ok_or(TrackerError::NoMonitors)?;
                let raw = monitor
                    .capture_image()
                    .map_err(|e| TrackerError::TransientIo(format!("capture failed: {e}")))?;
                DynamicImage::ImageRgba8(raw)
            }
        };

        let hash = DHash::compute(&image);

        let now = Local::now();
        let date_dir = self
            .output_dir
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        std::fs::create_dir_all(&date_dir)
            .map_err(|e| TrackerError::from_io(&e, "creating date directory"))?;

        let hex = hash.to_hex();
        let filename = format!("{}_{}.webp", now.format("%H%M%S"), &hex[..8]);
        let filepath = date_dir.join(filename);

        let encoded = encode_webp(&image, WEBP_QUALITY)
            .map_err(|e| TrackerError::TransientIo(format!("webp encode failed: {e}")))?;
        std::fs::write(&filepath, encoded)
            .map_err(|e| TrackerError::from_io(&e, "saving screenshot"))?;

        log::debug!("Screenshot saved: {}", filepath.display());
        Ok((filepath, hex))
    }

    /// Capture the monitor whose frame contains the region's origin, cropped
    /// to the region. Used for active-monitor capture.
    fn capture_region(monitors: &[Monitor], geo: &WindowGeometry) -> Result<DynamicImage, TrackerError> {
        let monitor = monitors
            .iter()
            .find(|m| {
                let (Ok(x), Ok(y), Ok(w), Ok(h)) = (m.x(), m.y(), m.width(), m.height()) else {
                    return false;
                };
                geo.x >= x as i64
                    && geo.x < (x as i64 + w as i64)
                    && geo.y >= y as i64
                    && geo.y < (y as i64 + h as i64)
            })
            .or_else(|| monitors.first())
            .ok_or(TrackerError::NoMonitors)?;

        let raw = monitor
            .capture_image()
            .map_err(|e| TrackerError::TransientIo(format!("capture failed: {e}")))?;
        let frame = DynamicImage::ImageRgba8(raw);

        // Translate virtual-screen coordinates into the monitor's frame
        let mon_x = monitor.x().unwrap_or(0) as i64;
        let mon_y = monitor.y().unwrap_or(0) as i64;
        let local = WindowGeometry {
            x: geo.x - mon_x,
            y: geo.y - mon_y,
            width: geo.width,
            height: geo.height,
        };
        match crop_rect(&local, frame.width(), frame.height()) {
            Some((x, y, w, h)) => Ok(frame.crop_imm(x, y, w, h)),
            None => Ok(frame),
        }
    }

    /// Path to the cached cropped variant of a screenshot, creating it on
    /// first use. Falls back to the original when there is no usable
    /// geometry, the crop is degenerate, or the rectangle misses the frame.
    pub fn get_cropped_path(&self, filepath: &Path, geometry: Option<&WindowGeometry>) -> PathBuf {
        let Some(geo) = geometry else {
            return filepath.to_path_buf();
        };
        let crop_path = crop_cache_path(filepath);
        if crop_path.exists() {
            return crop_path;
        }

        match Self::write_crop(filepath, &crop_path, geo) {
            Ok(true) => crop_path,
            Ok(false) => filepath.to_path_buf(),
            Err(e) => {
                log::warn!("Failed to crop {}: {e}", filepath.display());
                filepath.to_path_buf()
            }
        }
    }

    fn write_crop(filepath: &Path, crop_path: &Path, geo: &WindowGeometry) -> Result<bool> {
        let img = image::open(filepath)
            .map_err(|e| anyhow!("opening {}: {e}", filepath.display()))?;
        let Some((x, y, w, h)) = crop_rect(geo, img.width(), img.height()) else {
            return Ok(false);
        };
        let cropped = img.crop_imm(x, y, w, h);
        let encoded = encode_webp(&cropped, CROP_WEBP_QUALITY)?;
        std::fs::write(crop_path, encoded)?;
        log::debug!("Created cropped screenshot: {}", crop_path.display());
        Ok(true)
    }
}

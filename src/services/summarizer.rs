use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::services::llm_client::{build_slot_prompt, parse_reply, prepare_image, LlmClient, OcrText};
use crate::services::ocr::OcrEngine;
use crate::services::reports;
use crate::services::screenshot::ScreenCapture;
use crate::storage::config::SummarizationConfig;
use crate::storage::store::{
    from_local_timestamp, parse_iso, to_iso, FocusEvent, NewThresholdSummary, Screenshot, Session,
    Store,
};

const QUEUE_CAPACITY: usize = 64;
const IDLE_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Manual work accepted by the worker alongside the cron schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerTask {
    SummarizeRange(NaiveDateTime, NaiveDateTime),
    Regenerate(i64),
}

/// Start of the wall-clock slot containing `dt`: slots begin at 0, f, 2f, ...
/// minutes past local midnight. Anchoring on absolute midnight rather than
/// "last run + f" keeps the schedule from drifting.
pub fn slot_start_for(dt: NaiveDateTime, frequency_minutes: u32) -> NaiveDateTime {
    let f = frequency_minutes.max(1);
    let minutes_since_midnight = dt.hour() * 60 + dt.minute();
    let slot_minutes = (minutes_since_midnight / f) * f;
    dt.date()
        .and_hms_opt(slot_minutes / 60, slot_minutes % 60, 0)
        .expect("slot minutes stay within the day")
}

/// The next scheduled firing after `now`.
pub fn next_scheduled_run(now: NaiveDateTime, frequency_minutes: u32) -> NaiveDateTime {
    slot_start_for(now, frequency_minutes) + ChronoDuration::minutes(frequency_minutes.max(1) as i64)
}

/// Clip focus events to a range: duration becomes the intersection with
/// `[range_start, range_end]`; events with no overlap are dropped. An event
/// whose `end_time` fails to parse is treated as still running.
pub fn clip_focus_events(
    events: Vec<FocusEvent>,
    range_start: NaiveDateTime,
    range_end: NaiveDateTime,
) -> Vec<FocusEvent> {
    let mut clipped = Vec::new();
    for mut event in events {
        let Some(event_start) = parse_iso(&event.start_time) else {
            clipped.push(event);
            continue;
        };
        let event_end = parse_iso(&event.end_time).unwrap_or(range_end);

        let overlap_start = event_start.max(range_start);
        let overlap_end = event_end.min(range_end);
        if overlap_start < overlap_end {
            event.duration_seconds =
                (overlap_end - overlap_start).num_milliseconds() as f64 / 1000.0;
            clipped.push(event);
        }
    }
    clipped
}

/// Uniform time sampling: at most `max_samples`, targeting roughly one
/// screenshot per `sample_interval_minutes` of covered time.
pub fn sample_screenshots(
    screenshots: &[Screenshot],
    max_samples: usize,
    sample_interval_minutes: u32,
) -> Vec<Screenshot> {
    if screenshots.len() <= max_samples {
        return screenshots.to_vec();
    }
    let first = screenshots.first().map(|s| s.timestamp).unwrap_or(0);
    let last = screenshots.last().map(|s| s.timestamp).unwrap_or(0);
    let duration_minutes = ((last - first).max(0) as f64) / 60.0;
    let ideal = (duration_minutes / sample_interval_minutes.max(1) as f64).floor() as usize;
    let target = ideal.max(1).min(max_samples);

    let step = screenshots.len() as f64 / target as f64;
    (0..target)
        .map(|i| screenshots[((i as f64 * step) as usize).min(screenshots.len() - 1)].clone())
        .collect()
}

/// Cron-aligned summarization worker.
///
/// A single background task generates at most one summary at a time: the
/// scheduled slot when its boundary passes, otherwise one manual task
/// (regenerate / backfill) per idle cycle, plus a daily report synthesized
/// once per midnight crossing.
pub struct SummarizerWorker {
    store: Arc<Store>,
    config: SummarizationConfig,
    capture: Arc<ScreenCapture>,
    llm: LlmClient,
    data_dir: PathBuf,
    queue_tx: mpsc::Sender<WorkerTask>,
    queue_rx: Mutex<Option<mpsc::Receiver<WorkerTask>>>,
    last_daily_report_date: Mutex<Option<String>>,
}

impl SummarizerWorker {
    pub fn new(
        store: Arc<Store>,
        config: SummarizationConfig,
        capture: Arc<ScreenCapture>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        let llm = LlmClient::new(&config.ollama_host, &config.model);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Self {
            store,
            config,
            capture,
            llm,
            data_dir,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            last_daily_report_date: Mutex::new(None),
        })
    }

    /// Queue a regeneration. Fails without blocking when the queue is full.
    pub fn queue_regenerate(&self, summary_id: i64) -> Result<()> {
        self.queue_tx
            .try_send(WorkerTask::Regenerate(summary_id))
            .map_err(|_| anyhow::anyhow!("summarizer queue full"))?;
        log::info!("Queued summary {summary_id} for regeneration");
        Ok(())
    }

    /// Group unsummarized screenshots into their aligned slots and queue one
    /// summarize-range task per slot that had any session activity. Returns
    /// the number of slots queued.
    pub fn force_summarize_pending(&self, date: Option<chrono::NaiveDate>) -> Result<usize> {
        let unsummarized = self.store.get_unsummarized_screenshots(false, date)?;
        if unsummarized.is_empty() {
            log::info!("No unsummarized screenshots to process");
            return Ok(0);
        }

        let f = self.config.frequency_minutes;
        let mut slots: Vec<NaiveDateTime> = unsummarized
            .iter()
            .map(|s| slot_start_for(from_local_timestamp(s.timestamp), f))
            .collect();
        slots.sort();
        slots.dedup();

        let mut queued = 0;
        let mut afk_slots = 0;
        for slot_start in slots {
            let slot_end = slot_start + ChronoDuration::minutes(f.max(1) as i64);
            if !self.store.has_active_session_in_range(slot_start, slot_end)? {
                afk_slots += 1;
                continue;
            }
            self.queue_tx
                .try_send(WorkerTask::SummarizeRange(slot_start, slot_end))
                .map_err(|_| anyhow::anyhow!("summarizer queue full"))?;
            queued += 1;
        }
        log::info!(
            "Force-queued {queued} time slots for summarization ({}min slots, skipped {afk_slots} AFK slots)",
            f
        );
        Ok(queued)
    }

    /// Spawn the run loop. Panics if called twice.
    pub fn start(self: &Arc<Self>, stop_rx: watch::Receiver<bool>) {
        let worker = Arc::clone(self);
        let queue_rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .expect("worker started twice");
        tokio::spawn(async move {
            worker.run_loop(queue_rx, stop_rx).await;
        });
    }

    async fn run_loop(
        self: Arc<Self>,
        mut queue_rx: mpsc::Receiver<WorkerTask>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let f = self.config.frequency_minutes;
        let mut next = next_scheduled_run(Local::now().naive_local(), f);
        log::info!(
            "Summarizer worker started ({f}min slots, next run at {})",
            next.format("%H:%M")
        );

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let now = Local::now().naive_local();

            self.maybe_generate_daily_report(now).await;

            if now >= next && self.config.enabled {
                let slot_start = next - ChronoDuration::minutes(f.max(1) as i64);
                log::info!(
                    "Scheduled summarization for slot {} - {}",
                    slot_start.format("%H:%M"),
                    next.format("%H:%M")
                );
                if let Err(e) = self.summarize_range(slot_start, next).await {
                    log::error!("Scheduled summarization failed: {e}");
                }
                next = next_scheduled_run(Local::now().naive_local(), f);
                log::info!("Next scheduled run at {}", next.format("%H:%M"));
            }

            tokio::select! {
                task = tokio::time::timeout(IDLE_RECV_TIMEOUT, queue_rx.recv()) => {
                    match task {
                        Ok(Some(task)) => self.run_task(task).await,
                        Ok(None) => break,
                        Err(_) => {} // idle cycle
                    }
                }
                _ = stop_rx.changed() => {}
            }
        }
        log::info!("Summarizer worker stopped");
    }

    async fn run_task(&self, task: WorkerTask) {
        match task {
            WorkerTask::SummarizeRange(start, end) => {
                if let Err(e) = self.summarize_range(start, end).await {
                    log::error!("Summarize-range task failed: {e}");
                }
            }
            WorkerTask::Regenerate(id) => {
                if let Err(e) = self.regenerate(id).await {
                    log::error!("Regeneration of summary {id} failed: {e}");
                }
            }
        }
    }

    /// The slot pipeline: dedup gate, AFK gate, availability gate, evidence
    /// gathering, sampling, LLM call, atomic persist.
    pub async fn summarize_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<()> {
        let start_iso = to_iso(start);
        let end_iso = to_iso(end);

        if self.store.has_summary_for_time_range(&start_iso, &end_iso)? {
            log::info!("Skipping {start_iso} - {end_iso}: summary already exists");
            return Ok(());
        }
        if !self.store.has_active_session_in_range(start, end)? {
            log::info!("Skipping {start_iso} - {end_iso}: user was AFK for the entire slot");
            return Ok(());
        }
        if !self.llm.is_available(self.config.include_ocr).await {
            log::warn!("Summarizer backend unavailable, slot {start_iso} left for backfill");
            return Ok(());
        }

        let screenshots = self.store.get_screenshots_in_range(start, end)?;
        let focus_events = clip_focus_events(
            self.store.get_focus_events_overlapping_range(start, end, true)?,
            start,
            end,
        );
        if screenshots.is_empty() && focus_events.is_empty() {
            log::info!("Skipping {start_iso} - {end_iso}: no evidence in slot");
            return Ok(());
        }
        log::info!(
            "Slot {start_iso} - {end_iso}: {} screenshots, {} focus events",
            screenshots.len(),
            focus_events.len()
        );

        let sampled = sample_screenshots(
            &screenshots,
            self.config.max_samples,
            self.config.sample_interval_minutes,
        );
        let ocr_texts = if self.config.include_ocr {
            self.gather_ocr(&sampled).await?
        } else {
            Vec::new()
        };

        let previous_summary = if self.config.include_previous_summary {
            self.store.get_last_threshold_summary()?.map(|s| s.summary)
        } else {
            None
        };

        let evidence_ids: Vec<i64> = screenshots.iter().map(|s| s.id).collect();
        self.generate_and_persist(
            &start_iso,
            &end_iso,
            &sampled,
            evidence_ids,
            focus_events,
            ocr_texts,
            previous_summary,
            None,
        )
        .await
    }

    /// Re-run the pipeline over a root summary's own screenshot set and link
    /// the new row back via `regenerated_from`.
    pub async fn regenerate(&self, summary_id: i64) -> Result<()> {
        let Some(old) = self.store.get_threshold_summary(summary_id)? else {
            anyhow::bail!("summary {summary_id} not found");
        };
        let root_id = old.regenerated_from.unwrap_or(old.id);

        let mut screenshots = Vec::new();
        for id in &old.screenshot_ids {
            if let Some(s) = self.store.get_screenshot(*id)? {
                screenshots.push(s);
            }
        }
        screenshots.sort_by_key(|s| s.timestamp);
        if screenshots.is_empty() {
            anyhow::bail!("no screenshots left for summary {summary_id}");
        }
        if !self.llm.is_available(self.config.include_ocr).await {
            anyhow::bail!("summarizer backend unavailable");
        }

        let range_start = parse_iso(&old.start_time)
            .unwrap_or_else(|| from_local_timestamp(screenshots[0].timestamp));
        let range_end = parse_iso(&old.end_time)
            .unwrap_or_else(|| from_local_timestamp(screenshots[screenshots.len() - 1].timestamp));
        let focus_events = clip_focus_events(
            self.store
                .get_focus_events_overlapping_range(range_start, range_end, true)?,
            range_start,
            range_end,
        );

        let sampled = sample_screenshots(
            &screenshots,
            self.config.max_samples,
            self.config.sample_interval_minutes,
        );
        let ocr_texts = if self.config.include_ocr {
            self.gather_ocr(&sampled).await?
        } else {
            Vec::new()
        };

        log::info!("Regenerating summary {summary_id} (root {root_id})");
        self.generate_and_persist(
            &old.start_time,
            &old.end_time,
            &sampled,
            old.screenshot_ids.clone(),
            focus_events,
            ocr_texts,
            None, // regenerations never chain previous context
            Some(root_id),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_and_persist(
        &self,
        start_iso: &str,
        end_iso: &str,
        sampled: &[Screenshot],
        evidence_ids: Vec<i64>,
        focus_events: Vec<FocusEvent>,
        ocr_texts: Vec<OcrText>,
        previous_summary: Option<String>,
        regenerated_from: Option<i64>,
    ) -> Result<()> {
        let prompt = build_slot_prompt(
            previous_summary.as_deref(),
            self.config.include_focus_context.then_some(&focus_events[..]),
            &ocr_texts,
        );

        let images = if self.config.include_screenshots {
            let mut images = Vec::new();
            for screenshot in sampled {
                let path = self.image_path_for(screenshot);
                match prepare_image(&path) {
                    Ok(b64) => images.push(b64),
                    Err(e) => log::warn!("Failed to prepare {}: {e}", path.display()),
                }
            }
            images
        } else {
            Vec::new()
        };

        let started = std::time::Instant::now();
        let raw = match self.llm.generate(&prompt, images).await {
            Ok(raw) => raw,
            Err(e) => {
                // The slot is NOT marked summarized; backfill will retry it
                log::error!(
                    "LLM call failed for {start_iso} - {end_iso}: {}",
                    crate::TrackerError::from(e)
                );
                return Ok(());
            }
        };
        let inference_ms = started.elapsed().as_millis() as i64;
        let parsed = parse_reply(&raw);

        let summary_id = self.store.save_threshold_summary(&NewThresholdSummary {
            start_time: start_iso.to_string(),
            end_time: end_iso.to_string(),
            summary: parsed.summary.clone(),
            screenshot_ids: evidence_ids,
            model_used: self.config.model.clone(),
            config_snapshot: Some(self.config_snapshot()),
            inference_time_ms: Some(inference_ms),
            prompt_text: Some(prompt),
            explanation: parsed.explanation,
            tags: parsed.tags,
            confidence: parsed.confidence,
            // Project detection is an external capability; the worker
            // stores whatever the detector attached, currently nothing.
            project: None,
            regenerated_from,
        })?;
        log::info!(
            "Saved summary {summary_id} (conf={}): {}",
            parsed.confidence.map_or("-".to_string(), |c| format!("{c:.2}")),
            parsed.summary.chars().take(80).collect::<String>()
        );
        Ok(())
    }

    /// OCR once per unique window title among the sampled screenshots,
    /// memoized per session in the store.
    async fn gather_ocr(&self, sampled: &[Screenshot]) -> Result<Vec<OcrText>> {
        let mut seen = std::collections::HashSet::new();
        let mut texts = Vec::new();

        for screenshot in sampled {
            let Some(title) = screenshot.window_title.clone() else { continue };
            if !seen.insert(title.clone()) {
                continue;
            }
            let session_id = self.store.get_session_for_screenshot(screenshot.id)?;

            if let Some(session_id) = session_id {
                if let Some(cached) = self.store.get_cached_ocr(session_id, &title)? {
                    texts.push(OcrText { window_title: title, ocr_text: cached });
                    continue;
                }
            }

            let path = self.image_path_for(screenshot);
            let text = OcrEngine::extract_text(&path).await;
            if let Some(session_id) = session_id {
                self.store.cache_ocr(session_id, &title, &text, screenshot.id)?;
            }
            texts.push(OcrText { window_title: title, ocr_text: text });
        }
        Ok(texts)
    }

    /// Absolute path for a screenshot, cropped variant when configured.
    fn image_path_for(&self, screenshot: &Screenshot) -> PathBuf {
        let full = self.resolve_filepath(&screenshot.filepath);
        if self.config.crop_to_window {
            self.capture
                .get_cropped_path(&full, screenshot.window_geometry.as_ref())
        } else {
            full
        }
    }

    fn resolve_filepath(&self, filepath: &str) -> PathBuf {
        let path = PathBuf::from(filepath);
        if path.is_absolute() {
            path
        } else {
            self.data_dir.join("screenshots").join(filepath)
        }
    }

    fn config_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "frequency_minutes": self.config.frequency_minutes,
            "include_focus_context": self.config.include_focus_context,
            "include_screenshots": self.config.include_screenshots,
            "include_ocr": self.config.include_ocr,
            "include_previous_summary": self.config.include_previous_summary,
            "crop_to_window": self.config.crop_to_window,
            "max_samples": self.config.max_samples,
            "sample_interval_minutes": self.config.sample_interval_minutes,
            "focus_weighted_sampling": self.config.focus_weighted_sampling,
        })
    }

    /// Generate the cached daily report for yesterday, once per midnight
    /// crossing and only when none exists yet.
    async fn maybe_generate_daily_report(&self, now: NaiveDateTime) {
        if !self.config.enabled {
            return;
        }
        let yesterday = (now.date() - ChronoDuration::days(1))
            .format("%Y-%m-%d")
            .to_string();
        {
            let last = self.last_daily_report_date.lock().unwrap();
            if last.as_deref() == Some(yesterday.as_str()) {
                return;
            }
        }
        match self.store.get_cached_report("daily", &yesterday) {
            Ok(Some(_)) => {
                *self.last_daily_report_date.lock().unwrap() = Some(yesterday);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Cached report lookup failed: {e}");
                return;
            }
        }

        log::info!("Generating daily report for {yesterday}");
        match reports::generate_daily_report(&self.store, &self.llm, &yesterday).await {
            Ok(Some(_)) => log::info!("Generated daily report for {yesterday}"),
            Ok(None) => log::info!("No activity found for {yesterday}, skipping daily report"),
            Err(e) => log::error!("Failed to generate daily report for {yesterday}: {e}"),
        }
        *self.last_daily_report_date.lock().unwrap() = Some(yesterday);
    }

    /// Session-scoped narrative summary, written to the session row when a
    /// session closes. Slot summaries remain the primary surface.
    pub async fn summarize_closed_session(&self, session: &Session) -> Result<()> {
        if !self.llm.is_available(self.config.include_ocr).await {
            log::warn!("Summarizer unavailable, skipping session {} narrative", session.id);
            return Ok(());
        }
        let screenshots = self.store.get_session_screenshots(session.id)?;
        if screenshots.len() < 2 {
            log::info!("Session {}: not enough screenshots for a narrative", session.id);
            return Ok(());
        }

        let sampled = sample_screenshots(
            &screenshots,
            self.config.max_samples,
            self.config.sample_interval_minutes,
        );
        let ocr_texts = if self.config.include_ocr {
            self.gather_ocr(&sampled).await?
        } else {
            Vec::new()
        };
        let previous = self
            .store
            .get_last_threshold_summary()?
            .map(|s| s.summary);

        let range_start = parse_iso(&session.start_time);
        let range_end = session.end_time.as_deref().and_then(parse_iso);
        let focus_events = match (range_start, range_end) {
            (Some(start), Some(end)) => clip_focus_events(
                self.store.get_focus_events_overlapping_range(start, end, true)?,
                start,
                end,
            ),
            _ => Vec::new(),
        };

        let prompt = build_slot_prompt(
            previous.as_deref(),
            self.config.include_focus_context.then_some(&focus_events[..]),
            &ocr_texts,
        );
        let mut images = Vec::new();
        if self.config.include_screenshots {
            for screenshot in &sampled {
                if let Ok(b64) = prepare_image(&self.image_path_for(screenshot)) {
                    images.push(b64);
                }
            }
        }

        let started = std::time::Instant::now();
        let raw = match self.llm.generate(&prompt, images).await {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Session {} narrative failed: {e}", session.id);
                return Ok(());
            }
        };
        let parsed = parse_reply(&raw);
        let sampled_ids: Vec<i64> = sampled.iter().map(|s| s.id).collect();
        self.store.save_session_summary(
            session.id,
            &parsed.summary,
            &self.config.model,
            started.elapsed().as_millis() as i64,
            Some(&prompt),
            &sampled_ids,
        )?;
        log::info!("Session {}: {}", session.id, parsed.summary);
        Ok(())
    }
}

use base64::Engine;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::services::ocr;
use crate::storage::store::FocusEvent;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IMAGE_SIDE: u32 = 1024;
const JPEG_QUALITY: u8 = 85;
const OCR_SNIPPET_CHARS: usize = 500;
const FOCUS_CONTEXT_TOP_N: usize = 8;

/// Failure taxonomy for the LLM client. None of these are retried here; the
/// slot stays unsummarized and a later backfill picks it up.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("cannot reach LLM host: {0}")]
    Unreachable(String),

    #[error("LLM returned HTTP {0}")]
    HttpError(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    #[serde(default)]
    name: String,
}

/// Structured fields parsed from a slot-summary reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub summary: String,
    pub explanation: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
}

/// Parse the model's reply leniently. The first lines form the one-line
/// summary; `EXPLANATION:`, `CONFIDENCE:` and `TAGS:` are recognized
/// anywhere; unknown lines accumulate into the summary body; out-of-range
/// confidence is clamped.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let mut summary_lines: Vec<String> = Vec::new();
    let mut explanation: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut confidence: Option<f64> = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let upper = trimmed.to_ascii_uppercase();
        if let Some(rest) = upper
            .starts_with("EXPLANATION:")
            .then(|| trimmed["EXPLANATION:".len()..].trim())
        {
            if !rest.is_empty() {
                explanation = Some(rest.to_string());
            }
        } else if let Some(rest) = upper
            .starts_with("CONFIDENCE:")
            .then(|| trimmed["CONFIDENCE:".len()..].trim())
        {
            if let Ok(value) = rest.trim_end_matches(|c: char| !c.is_ascii_digit()).parse::<f64>() {
                confidence = Some(value.clamp(0.0, 1.0));
            } else if let Ok(value) = rest.parse::<f64>() {
                confidence = Some(value.clamp(0.0, 1.0));
            }
        } else if let Some(rest) = upper
            .starts_with("TAGS:")
            .then(|| trimmed["TAGS:".len()..].trim())
        {
            tags = rest
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        } else {
            summary_lines.push(trimmed.to_string());
        }
    }

    ParsedReply {
        summary: summary_lines.join(" "),
        explanation,
        tags,
        confidence,
    }
}

/// One OCR snippet for the prompt, keyed by window title.
#[derive(Debug, Clone)]
pub struct OcrText {
    pub window_title: String,
    pub ocr_text: String,
}

/// Assemble the slot-summarization prompt: optional previous-summary block,
/// optional focus-context block, optional OCR block, then the fixed
/// instruction footer.
pub fn build_slot_prompt(
    previous_summary: Option<&str>,
    focus_events: Option<&[FocusEvent]>,
    ocr_texts: &[OcrText],
) -> String {
    let mut parts: Vec<String> = vec!["You are summarizing a developer's work period.".to_string(), String::new()];

    if let Some(previous) = previous_summary {
        parts.push(format!("Previous period context: {previous}"));
        parts.push(String::new());
    }

    if let Some(events) = focus_events {
        if !events.is_empty() {
            parts.push("App and window usage during this period (focus-tracked):".to_string());
            for line in focus_context_lines(events) {
                parts.push(line);
            }
            parts.push(String::new());
        }
    }

    if !ocr_texts.is_empty() {
        let mut lines = Vec::new();
        for item in ocr_texts {
            if item.ocr_text.is_empty() {
                continue;
            }
            let snippet = if item.ocr_text.len() > OCR_SNIPPET_CHARS {
                let cut = item
                    .ocr_text
                    .char_indices()
                    .take_while(|(i, _)| *i < OCR_SNIPPET_CHARS)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                format!("{}...", &item.ocr_text[..cut])
            } else {
                item.ocr_text.clone()
            };
            lines.push(format!("[{}]: {}", item.window_title, snippet));
        }
        if !lines.is_empty() {
            parts.push("Window titles and OCR text from this period:".to_string());
            parts.extend(lines);
            parts.push(String::new());
        }
    }

    parts.extend([
        "Based on the screenshots and text above, write ONE sentence (max 20 words) describing the main activity.".to_string(),
        "Format: \"[Action verb] [what] in/for [project/context]\"".to_string(),
        "Examples:".to_string(),
        "- \"Debugging portal permissions in activity-tracker service\"".to_string(),
        "- \"Building dataset with 1000 images for object detection\"".to_string(),
        "- \"Reviewing pull request for authentication changes\"".to_string(),
        String::new(),
        "Be specific. Use actual filenames, project names, and technical terms visible in the screenshots.".to_string(),
        "Then add these lines:".to_string(),
        "EXPLANATION: one sentence on what you observed".to_string(),
        "CONFIDENCE: a number between 0.0 and 1.0".to_string(),
        "TAGS: comma-separated activity tags".to_string(),
    ]);

    parts.join("\n")
}

/// Top-N apps and windows with minutes, from already-clipped focus events.
fn focus_context_lines(events: &[FocusEvent]) -> Vec<String> {
    use std::collections::HashMap;

    let mut app_totals: HashMap<&str, f64> = HashMap::new();
    let mut window_totals: HashMap<(&str, &str), f64> = HashMap::new();
    for event in events {
        *app_totals.entry(event.app_name.as_str()).or_default() += event.duration_seconds;
        *window_totals
            .entry((event.app_name.as_str(), event.window_title.as_str()))
            .or_default() += event.duration_seconds;
    }

    let mut apps: Vec<_> = app_totals.into_iter().collect();
    apps.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut windows: Vec<_> = window_totals.into_iter().collect();
    windows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut lines = Vec::new();
    for (app, seconds) in apps.into_iter().take(FOCUS_CONTEXT_TOP_N) {
        lines.push(format!("- {app}: {:.1} min", seconds / 60.0));
    }
    for ((app, title), seconds) in windows.into_iter().take(FOCUS_CONTEXT_TOP_N) {
        lines.push(format!("  - {app} / {title}: {:.1} min", seconds / 60.0));
    }
    lines
}

/// Resize to <=1024px on the longest side and encode as base64 JPEG q85.
pub fn prepare_image(path: &Path) -> Result<String, LlmError> {
    let img = image::open(path)
        .map_err(|e| LlmError::MalformedResponse(format!("cannot read image {}: {e}", path.display())))?;
    let img = if img.width() > MAX_IMAGE_SIDE || img.height() > MAX_IMAGE_SIDE {
        img.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, FilterType::Lanczos3)
    } else {
        img
    };

    let mut jpeg = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| LlmError::MalformedResponse(format!("jpeg encode failed: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg.into_inner()))
}

/// HTTP client for a chat-style multimodal Ollama API.
pub struct LlmClient {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl LlmClient {
    pub fn new(host: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `POST {host}/api/chat` with the prompt and base64 images; returns
    /// `message.content`.
    pub async fn generate(&self, prompt: &str, images: Vec<String>) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
                images: (!images.is_empty()).then_some(images),
            }],
            stream: false,
        };

        let url = format!("{}/api/chat", self.host);
        log::info!(
            "LLM request to {url}: model={}, images={}",
            self.model,
            request.messages[0].images.as_ref().map_or(0, |i| i.len())
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(REQUEST_TIMEOUT.as_secs())
                } else {
                    LlmError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::HttpError(status.as_u16()));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        let content = body
            .message
            .map(|m| m.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::MalformedResponse("empty message content".to_string()));
        }
        Ok(content)
    }

    /// Text-only convenience call.
    pub async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        self.generate(prompt, Vec::new()).await
    }

    /// `GET {host}/api/tags`: true iff a listed model's name starts with the
    /// configured model's base name (split at `:`), and - when OCR is
    /// requested - the tesseract binary is on PATH.
    pub async fn is_available(&self, require_ocr: bool) -> bool {
        if require_ocr && !ocr::binary_on_path("tesseract") {
            log::warn!("Tesseract not found in PATH");
            return false;
        }

        let url = format!("{}/api/tags", self.host);
        let response = match self
            .client
            .get(&url)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Cannot reach LLM host at {}: {e}", self.host);
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        let tags: TagsResponse = match response.json().await {
            Ok(tags) => tags,
            Err(_) => return false,
        };

        let base = self.model.split(':').next().unwrap_or(&self.model);
        let found = tags.models.iter().any(|m| m.name.starts_with(base));
        if !found {
            log::warn!("Model {} not found on LLM host", self.model);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn focus_event(app: &str, title: &str, seconds: f64) -> FocusEvent {
        FocusEvent {
            id: 0,
            window_title: title.to_string(),
            app_name: app.to_string(),
            window_class: None,
            start_time: "2026-01-05T10:00:00".to_string(),
            end_time: "2026-01-05T10:05:00".to_string(),
            duration_seconds: seconds,
            session_id: Some(1),
            terminal_context: None,
        }
    }

    #[test]
    fn parses_fully_structured_reply() {
        let reply = "Debugging focus clipping in activity tracker\n\
                     EXPLANATION: Editor and test output visible throughout.\n\
                     CONFIDENCE: 0.85\n\
                     TAGS: coding, debugging, rust";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.summary, "Debugging focus clipping in activity tracker");
        assert_eq!(parsed.explanation.as_deref(), Some("Editor and test output visible throughout."));
        assert_eq!(parsed.confidence, Some(0.85));
        assert_eq!(parsed.tags, vec!["coding", "debugging", "rust"]);
    }

    #[test]
    fn missing_fields_yield_defaults() {
        let parsed = parse_reply("Just a plain summary line");
        assert_eq!(parsed.summary, "Just a plain summary line");
        assert_eq!(parsed.explanation, None);
        assert_eq!(parsed.confidence, None);
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        assert_eq!(parse_reply("s\nCONFIDENCE: 1.7").confidence, Some(1.0));
        assert_eq!(parse_reply("s\nCONFIDENCE: -0.3").confidence, Some(0.0));
        assert_eq!(parse_reply("s\nCONFIDENCE: high").confidence, None);
    }

    #[test]
    fn unknown_lines_accumulate_into_summary() {
        let parsed = parse_reply("Working on the parser\nAlso touched the store\nTAGS: coding");
        assert_eq!(parsed.summary, "Working on the parser Also touched the store");
        assert_eq!(parsed.tags, vec!["coding"]);
    }

    #[test]
    fn case_insensitive_field_markers() {
        let parsed = parse_reply("s\nexplanation: lowercase works\nconfidence: 0.5\ntags: a, b");
        assert_eq!(parsed.explanation.as_deref(), Some("lowercase works"));
        assert_eq!(parsed.confidence, Some(0.5));
        assert_eq!(parsed.tags, vec!["a", "b"]);
    }

    #[test]
    fn prompt_block_order_and_truncation() {
        let long_ocr = "x".repeat(800);
        let prompt = build_slot_prompt(
            Some("Previously reviewing PRs"),
            Some(&[focus_event("Firefox", "docs", 300.0)]),
            &[OcrText {
                window_title: "editor".to_string(),
                ocr_text: long_ocr,
            }],
        );

        let previous_at = prompt.find("Previous period context").unwrap();
        let focus_at = prompt.find("App and window usage").unwrap();
        let ocr_at = prompt.find("OCR text from this period").unwrap();
        let instructions_at = prompt.find("ONE sentence").unwrap();
        assert!(previous_at < focus_at);
        assert!(focus_at < ocr_at);
        assert!(ocr_at < instructions_at);

        // OCR snippet truncated to 500 chars plus ellipsis
        assert!(prompt.contains(&format!("[editor]: {}...", "x".repeat(500))));
        assert!(prompt.contains("- Firefox: 5.0 min"));
        assert!(prompt.contains("CONFIDENCE:"));
    }

    #[test]
    fn prompt_omits_empty_blocks() {
        let prompt = build_slot_prompt(None, None, &[]);
        assert!(!prompt.contains("Previous period context"));
        assert!(!prompt.contains("App and window usage"));
        assert!(!prompt.contains("OCR text"));
        assert!(prompt.contains("ONE sentence"));
    }

    #[test]
    fn focus_context_sorts_by_clipped_minutes() {
        let lines = focus_context_lines(&[
            focus_event("Terminal", "bash", 120.0),
            focus_event("Firefox", "docs", 600.0),
            focus_event("Firefox", "mail", 60.0),
        ]);
        assert_eq!(lines[0], "- Firefox: 11.0 min");
        assert_eq!(lines[1], "- Terminal: 2.0 min");
        assert!(lines[2].contains("Firefox / docs"));
    }
}

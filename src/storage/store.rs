use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::TrackerError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS screenshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        filepath TEXT NOT NULL,
        dhash TEXT NOT NULL,
        window_title TEXT,
        app_name TEXT,
        window_x INTEGER,
        window_y INTEGER,
        window_width INTEGER,
        window_height INTEGER,
        monitor_name TEXT,
        monitor_width INTEGER,
        monitor_height INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_screenshot_timestamp ON screenshots(timestamp);
    CREATE INDEX IF NOT EXISTS idx_screenshot_dhash ON screenshots(dhash);

    CREATE TABLE IF NOT EXISTS activity_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration_seconds INTEGER,
        summary TEXT,
        screenshot_count INTEGER NOT NULL DEFAULT 0,
        unique_windows INTEGER NOT NULL DEFAULT 0,
        model_used TEXT,
        inference_time_ms INTEGER,
        prompt_text TEXT,
        screenshot_ids_used TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_session_start ON activity_sessions(start_time);
    CREATE INDEX IF NOT EXISTS idx_session_end ON activity_sessions(end_time);

    CREATE TABLE IF NOT EXISTS session_screenshots (
        session_id INTEGER NOT NULL REFERENCES activity_sessions(id),
        screenshot_id INTEGER NOT NULL REFERENCES screenshots(id),
        PRIMARY KEY (session_id, screenshot_id)
    );

    CREATE TABLE IF NOT EXISTS session_ocr_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES activity_sessions(id),
        window_title TEXT NOT NULL,
        ocr_text TEXT,
        screenshot_id INTEGER,
        UNIQUE(session_id, window_title)
    );
    CREATE INDEX IF NOT EXISTS idx_ocr_session ON session_ocr_cache(session_id);

    CREATE TABLE IF NOT EXISTS window_focus_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        window_title TEXT NOT NULL,
        app_name TEXT NOT NULL,
        window_class TEXT,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        duration_seconds REAL NOT NULL,
        session_id INTEGER REFERENCES activity_sessions(id),
        terminal_context TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_focus_start ON window_focus_events(start_time);
    CREATE INDEX IF NOT EXISTS idx_focus_session ON window_focus_events(session_id);

    CREATE TABLE IF NOT EXISTS threshold_summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        summary TEXT NOT NULL,
        screenshot_ids TEXT NOT NULL,
        screenshot_count INTEGER NOT NULL,
        model_used TEXT NOT NULL,
        config_snapshot TEXT,
        inference_time_ms INTEGER,
        prompt_text TEXT,
        explanation TEXT,
        tags TEXT,
        confidence REAL,
        project TEXT,
        regenerated_from INTEGER REFERENCES threshold_summaries(id),
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_threshold_summary_time
        ON threshold_summaries(start_time, end_time);
    CREATE INDEX IF NOT EXISTS idx_threshold_summary_project
        ON threshold_summaries(project);

    CREATE TABLE IF NOT EXISTS threshold_summary_screenshots (
        summary_id INTEGER NOT NULL REFERENCES threshold_summaries(id) ON DELETE CASCADE,
        screenshot_id INTEGER NOT NULL REFERENCES screenshots(id) ON DELETE CASCADE,
        PRIMARY KEY (summary_id, screenshot_id)
    );
    CREATE INDEX IF NOT EXISTS idx_tss_screenshot
        ON threshold_summary_screenshots(screenshot_id);

    CREATE TABLE IF NOT EXISTS cached_reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        period_type TEXT NOT NULL,
        period_date TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        executive_summary TEXT NOT NULL,
        sections TEXT,
        analytics TEXT,
        model_used TEXT,
        child_summary_ids TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(period_type, period_date)
    );
";

/// ISO-8601 local timestamp without sub-second precision. These strings are
/// the canonical slot keys, so formatting must stay stable.
pub fn to_iso(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// POSIX seconds for a local wall-clock time. Screenshot `timestamp` columns
/// store these, so session/summary boundaries must convert the same way.
pub fn local_timestamp(dt: NaiveDateTime) -> i64 {
    use chrono::TimeZone;
    chrono::Local
        .from_local_datetime(&dt)
        .earliest()
        .map(|t| t.timestamp())
        .unwrap_or_else(|| dt.and_utc().timestamp())
}

/// Inverse of `local_timestamp`.
pub fn from_local_timestamp(ts: i64) -> NaiveDateTime {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|utc| utc.with_timezone(&chrono::Local).naive_local())
        .unwrap_or_default()
}

/// Parse timestamps written by this store or by older deployments
/// (space-separated, optional fractional seconds).
pub fn parse_iso(s: &str) -> Option<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    None
}

#[derive(Debug, Clone, Default)]
pub struct WindowGeometry {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone)]
pub struct MonitorMeta {
    pub name: String,
    pub width: i64,
    pub height: i64,
}

/// Metadata for a freshly captured screenshot, immutable after insert.
#[derive(Debug, Clone)]
pub struct NewScreenshot {
    pub timestamp: i64,
    pub filepath: String,
    pub dhash: String,
    pub window_title: Option<String>,
    pub app_name: Option<String>,
    pub window_geometry: Option<WindowGeometry>,
    pub monitor: Option<MonitorMeta>,
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub id: i64,
    pub timestamp: i64,
    pub filepath: String,
    pub dhash: String,
    pub window_title: Option<String>,
    pub app_name: Option<String>,
    pub window_geometry: Option<WindowGeometry>,
    pub monitor: Option<MonitorMeta>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: Option<i64>,
    pub summary: Option<String>,
    pub screenshot_count: i64,
    pub unique_windows: i64,
    pub model_used: Option<String>,
    pub inference_time_ms: Option<i64>,
    pub prompt_text: Option<String>,
    pub screenshot_ids_used: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct FocusEvent {
    pub id: i64,
    pub window_title: String,
    pub app_name: String,
    pub window_class: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub session_id: Option<i64>,
    pub terminal_context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ThresholdSummary {
    pub id: i64,
    pub start_time: String,
    pub end_time: String,
    pub summary: String,
    pub screenshot_ids: Vec<i64>,
    pub screenshot_count: i64,
    pub model_used: String,
    pub config_snapshot: Option<serde_json::Value>,
    pub inference_time_ms: Option<i64>,
    pub prompt_text: Option<String>,
    pub explanation: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    /// Detected project context, filled in by an external detector.
    pub project: Option<String>,
    pub regenerated_from: Option<i64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewThresholdSummary {
    pub start_time: String,
    pub end_time: String,
    pub summary: String,
    pub screenshot_ids: Vec<i64>,
    pub model_used: String,
    pub config_snapshot: Option<serde_json::Value>,
    pub inference_time_ms: Option<i64>,
    pub prompt_text: Option<String>,
    pub explanation: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    pub project: Option<String>,
    pub regenerated_from: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CachedReport {
    pub id: i64,
    pub period_type: String,
    pub period_date: String,
    pub start_time: String,
    pub end_time: String,
    pub executive_summary: String,
    pub sections: Option<serde_json::Value>,
    pub analytics: Option<serde_json::Value>,
    pub model_used: Option<String>,
    pub child_summary_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct NewCachedReport {
    pub period_type: String,
    pub period_date: String,
    pub start_time: String,
    pub end_time: String,
    pub executive_summary: String,
    pub sections: Option<serde_json::Value>,
    pub analytics: Option<serde_json::Value>,
    pub model_used: Option<String>,
    pub child_summary_ids: Vec<i64>,
}

/// Per-app focus aggregate over a time range.
#[derive(Debug, Clone)]
pub struct AppDuration {
    pub app_name: String,
    pub total_seconds: f64,
    pub event_count: i64,
}

/// Sole owner of durable state. A single handle is threaded to every
/// component; all access goes through the interior connection lock, which
/// serializes writes and keeps multi-statement operations atomic.
pub struct Store {
    conn: Mutex<Connection>,
}

fn ids_to_json(ids: &[i64]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn ids_from_json(raw: Option<String>) -> Vec<i64> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn tags_from_json(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn json_from_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
        log::info!("Migration: added column {table}.{column}");
    }
    Ok(())
}

fn row_to_screenshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Screenshot> {
    let window_x: Option<i64> = row.get("window_x")?;
    let window_y: Option<i64> = row.get("window_y")?;
    let window_width: Option<i64> = row.get("window_width")?;
    let window_height: Option<i64> = row.get("window_height")?;
    let geometry = match (window_x, window_y, window_width, window_height) {
        (Some(x), Some(y), Some(width), Some(height)) if width > 0 && height > 0 => {
            Some(WindowGeometry { x, y, width, height })
        }
        _ => None,
    };

    let monitor_name: Option<String> = row.get("monitor_name")?;
    let monitor = match (
        monitor_name,
        row.get::<_, Option<i64>>("monitor_width")?,
        row.get::<_, Option<i64>>("monitor_height")?,
    ) {
        (Some(name), Some(width), Some(height)) => Some(MonitorMeta { name, width, height }),
        _ => None,
    };

    Ok(Screenshot {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        filepath: row.get("filepath")?,
        dhash: row.get("dhash")?,
        window_title: row.get("window_title")?,
        app_name: row.get("app_name")?,
        window_geometry: geometry,
        monitor,
    })
}

const SCREENSHOT_COLS: &str = "id, timestamp, filepath, dhash, window_title, app_name, \
     window_x, window_y, window_width, window_height, \
     monitor_name, monitor_width, monitor_height";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get("id")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration_seconds: row.get("duration_seconds")?,
        summary: row.get("summary")?,
        screenshot_count: row.get("screenshot_count")?,
        unique_windows: row.get("unique_windows")?,
        model_used: row.get("model_used")?,
        inference_time_ms: row.get("inference_time_ms")?,
        prompt_text: row.get("prompt_text")?,
        screenshot_ids_used: ids_from_json(row.get("screenshot_ids_used")?),
    })
}

const SESSION_COLS: &str = "id, start_time, end_time, duration_seconds, summary, \
     screenshot_count, unique_windows, model_used, inference_time_ms, \
     prompt_text, screenshot_ids_used";

fn row_to_focus_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<FocusEvent> {
    Ok(FocusEvent {
        id: row.get("id")?,
        window_title: row.get("window_title")?,
        app_name: row.get("app_name")?,
        window_class: row.get("window_class")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration_seconds: row.get("duration_seconds")?,
        session_id: row.get("session_id")?,
        terminal_context: row.get("terminal_context")?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThresholdSummary> {
    Ok(ThresholdSummary {
        id: row.get("id")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        summary: row.get("summary")?,
        screenshot_ids: ids_from_json(row.get("screenshot_ids")?),
        screenshot_count: row.get("screenshot_count")?,
        model_used: row.get("model_used")?,
        config_snapshot: json_from_column(row.get("config_snapshot")?),
        inference_time_ms: row.get("inference_time_ms")?,
        prompt_text: row.get("prompt_text")?,
        explanation: row.get("explanation")?,
        tags: tags_from_json(row.get("tags")?),
        confidence: row.get("confidence")?,
        project: row.get("project")?,
        regenerated_from: row.get("regenerated_from")?,
        created_at: row.get("created_at")?,
    })
}

const SUMMARY_COLS: &str = "id, start_time, end_time, summary, screenshot_ids, \
     screenshot_count, model_used, config_snapshot, inference_time_ms, \
     prompt_text, explanation, tags, confidence, project, regenerated_from, created_at";

impl Store {
    /// Open (or create) the database at `path`, applying schema and column
    /// migrations. Startup failures are classified: unwritable locations are
    /// `PermissionDenied`, an unreadable database is `SchemaCorruption`.
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrackerError::from_io(&e, "creating data directory"))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TrackerError::from_sqlite(&e, "opening database"))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrackerError::SchemaCorruption(format!("applying schema: {e}")))?;
        Self::migrate(&conn)
            .map_err(|e| TrackerError::SchemaCorruption(format!("migrating schema: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Bring databases from older deployments up to the current schema.
    /// Unknown extra columns are left alone.
    fn migrate(conn: &Connection) -> Result<()> {
        for col in ["window_x", "window_y", "window_width", "window_height"] {
            add_column_if_missing(conn, "screenshots", col, "INTEGER")?;
        }
        add_column_if_missing(conn, "screenshots", "monitor_name", "TEXT")?;
        for col in ["monitor_width", "monitor_height"] {
            add_column_if_missing(conn, "screenshots", col, "INTEGER")?;
        }
        add_column_if_missing(conn, "activity_sessions", "prompt_text", "TEXT")?;
        add_column_if_missing(conn, "activity_sessions", "screenshot_ids_used", "TEXT")?;
        add_column_if_missing(conn, "window_focus_events", "terminal_context", "TEXT")?;
        add_column_if_missing(conn, "threshold_summaries", "prompt_text", "TEXT")?;
        add_column_if_missing(conn, "threshold_summaries", "explanation", "TEXT")?;
        add_column_if_missing(conn, "threshold_summaries", "tags", "TEXT")?;
        add_column_if_missing(conn, "threshold_summaries", "confidence", "REAL")?;
        add_column_if_missing(conn, "threshold_summaries", "project", "TEXT")?;
        Ok(())
    }

    // ===================== Screenshots =====================

    pub fn insert_screenshot(&self, meta: &NewScreenshot) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let geo = meta.window_geometry.clone().unwrap_or_default();
        let has_geo = meta.window_geometry.is_some();
        conn.execute(
            "INSERT INTO screenshots
                 (timestamp, filepath, dhash, window_title, app_name,
                  window_x, window_y, window_width, window_height,
                  monitor_name, monitor_width, monitor_height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                meta.timestamp,
                meta.filepath,
                meta.dhash,
                meta.window_title,
                meta.app_name,
                has_geo.then_some(geo.x),
                has_geo.then_some(geo.y),
                has_geo.then_some(geo.width),
                has_geo.then_some(geo.height),
                meta.monitor.as_ref().map(|m| m.name.clone()),
                meta.monitor.as_ref().map(|m| m.width),
                meta.monitor.as_ref().map(|m| m.height),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_screenshot(&self, id: i64) -> Result<Option<Screenshot>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {SCREENSHOT_COLS} FROM screenshots WHERE id = ?1"),
                params![id],
                row_to_screenshot,
            )
            .optional()?;
        Ok(row)
    }

    /// Screenshots with `timestamp` in the half-open range `[start, end)`.
    pub fn get_screenshots_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Screenshot>> {
        let start_ts = local_timestamp(start);
        let end_ts = local_timestamp(end);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCREENSHOT_COLS} FROM screenshots
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp ASC"
        ))?;
        let rows = stmt
            .query_map(params![start_ts, end_ts], row_to_screenshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a screenshot row and everything referencing it. Called by the
    /// retention collaborator after deleting the file on disk.
    pub fn delete_screenshot(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session_screenshots WHERE screenshot_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM threshold_summary_screenshots WHERE screenshot_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM screenshots WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ===================== Sessions =====================

    pub fn create_session(&self, start: NaiveDateTime) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_sessions (start_time) VALUES (?1)",
            params![to_iso(start)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close a session: stamp end time and duration, refresh screenshot and
    /// unique-window counts from the link table. One transaction.
    pub fn end_session(&self, id: i64, end: NaiveDateTime, duration_seconds: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let screenshot_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM session_screenshots WHERE session_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let unique_windows: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT s.window_title)
             FROM session_screenshots ss
             JOIN screenshots s ON ss.screenshot_id = s.id
             WHERE ss.session_id = ?1 AND s.window_title IS NOT NULL",
            params![id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE activity_sessions
             SET end_time = ?1, duration_seconds = ?2,
                 screenshot_count = ?3, unique_windows = ?4
             WHERE id = ?5",
            params![to_iso(end), duration_seconds, screenshot_count, unique_windows, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a session together with its OCR cache entries and screenshot
    /// links. Used for sessions below the minimum duration.
    pub fn delete_session(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session_ocr_cache WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM session_screenshots WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM activity_sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM activity_sessions WHERE id = ?1"),
                params![id],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    /// The session with `end_time IS NULL`, if any (I1: at most one exists).
    pub fn get_active_session(&self) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM activity_sessions
                     WHERE end_time IS NULL
                     ORDER BY start_time DESC LIMIT 1"
                ),
                [],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn link_screenshot_to_session(&self, session_id: i64, screenshot_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO session_screenshots (session_id, screenshot_id)
             VALUES (?1, ?2)",
            params![session_id, screenshot_id],
        )?;
        Ok(())
    }

    /// The session a screenshot is linked to, if any. A missing link means
    /// the screenshot fell during AFK.
    pub fn get_session_for_screenshot(&self, screenshot_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let session_id: Option<i64> = conn
            .query_row(
                "SELECT session_id FROM session_screenshots WHERE screenshot_id = ?1",
                params![screenshot_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(session_id)
    }

    pub fn get_last_screenshot_timestamp_for_session(&self, session_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(s.timestamp)
             FROM screenshots s
             JOIN session_screenshots ss ON s.id = ss.screenshot_id
             WHERE ss.session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    pub fn get_session_screenshots(&self, session_id: i64) -> Result<Vec<Screenshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM screenshots s
             JOIN session_screenshots ss ON s.id = ss.screenshot_id
             WHERE ss.session_id = ?1
             ORDER BY s.timestamp ASC",
            SCREENSHOT_COLS
                .split(", ")
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![session_id], row_to_screenshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_unique_window_titles_for_session(&self, session_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.window_title
             FROM screenshots s
             JOIN session_screenshots ss ON s.id = ss.screenshot_id
             WHERE ss.session_id = ?1 AND s.window_title IS NOT NULL
             ORDER BY s.window_title",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// True iff any session overlaps the half-open range. Used to suppress
    /// AFK-only slots.
    pub fn has_active_session_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM activity_sessions
                 WHERE datetime(start_time) < datetime(?1)
                   AND (end_time IS NULL OR datetime(end_time) > datetime(?2))
                 LIMIT 1",
                params![to_iso(end), to_iso(start)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Optional narrative summary on the session row itself. Slot-scoped
    /// threshold summaries remain the primary surface.
    pub fn save_session_summary(
        &self,
        session_id: i64,
        summary: &str,
        model: &str,
        inference_time_ms: i64,
        prompt_text: Option<&str>,
        screenshot_ids_used: &[i64],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE activity_sessions
             SET summary = ?1, model_used = ?2, inference_time_ms = ?3,
                 prompt_text = ?4, screenshot_ids_used = ?5
             WHERE id = ?6",
            params![
                summary,
                model,
                inference_time_ms,
                prompt_text,
                ids_to_json(screenshot_ids_used),
                session_id
            ],
        )?;
        Ok(())
    }

    // ===================== OCR cache =====================

    pub fn get_cached_ocr(&self, session_id: i64, window_title: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let text: Option<Option<String>> = conn
            .query_row(
                "SELECT ocr_text FROM session_ocr_cache
                 WHERE session_id = ?1 AND window_title = ?2",
                params![session_id, window_title],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text.flatten())
    }

    pub fn cache_ocr(
        &self,
        session_id: i64,
        window_title: &str,
        ocr_text: &str,
        sample_screenshot_id: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO session_ocr_cache
                 (session_id, window_title, ocr_text, screenshot_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, window_title, ocr_text, sample_screenshot_id],
        )?;
        Ok(())
    }

    // ===================== Focus events =====================

    #[allow(clippy::too_many_arguments)]
    pub fn save_focus_event(
        &self,
        window_title: &str,
        app_name: &str,
        window_class: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        session_id: Option<i64>,
        terminal_context: Option<&str>,
    ) -> Result<i64> {
        let duration = (end - start).num_milliseconds() as f64 / 1000.0;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO window_focus_events
                 (window_title, app_name, window_class, start_time, end_time,
                  duration_seconds, session_id, terminal_context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                window_title,
                app_name,
                window_class,
                to_iso(start),
                to_iso(end),
                duration,
                session_id,
                terminal_context
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Focus events overlapping `[start, end)`. With `require_session`,
    /// events with a NULL `session_id` (AFK attribution) are excluded.
    pub fn get_focus_events_overlapping_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        require_session: bool,
    ) -> Result<Vec<FocusEvent>> {
        let session_filter = if require_session { "AND session_id IS NOT NULL" } else { "" };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, window_title, app_name, window_class, start_time, end_time,
                    duration_seconds, session_id, terminal_context
             FROM window_focus_events
             WHERE datetime(start_time) < datetime(?1)
               AND datetime(end_time) > datetime(?2)
               {session_filter}
             ORDER BY start_time ASC"
        ))?;
        let rows = stmt
            .query_map(params![to_iso(end), to_iso(start)], row_to_focus_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-app focus durations over a range, longest first. Report analytics.
    pub fn get_app_durations_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<AppDuration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_name, SUM(duration_seconds) AS total, COUNT(*) AS cnt
             FROM window_focus_events
             WHERE datetime(start_time) < datetime(?1)
               AND datetime(end_time) > datetime(?2)
               AND session_id IS NOT NULL
             GROUP BY app_name
             ORDER BY total DESC",
        )?;
        let rows = stmt
            .query_map(params![to_iso(end), to_iso(start)], |row| {
                Ok(AppDuration {
                    app_name: row.get(0)?,
                    total_seconds: row.get(1)?,
                    event_count: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of focus switches (event boundaries) inside a range.
    pub fn get_context_switch_count(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM window_focus_events
             WHERE datetime(start_time) >= datetime(?1)
               AND datetime(start_time) < datetime(?2)
               AND session_id IS NOT NULL",
            params![to_iso(start), to_iso(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// One-shot maintenance for legacy rows: re-assign `session_id` by
    /// start-time containment and clip end/duration to the owning session's
    /// end. Returns the number of rows touched. Never run automatically.
    pub fn fix_focus_event_attribution(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let reassigned = tx.execute(
            "UPDATE window_focus_events
             SET session_id = (
                 SELECT a.id FROM activity_sessions a
                 WHERE datetime(a.start_time) <= datetime(window_focus_events.start_time)
                   AND (a.end_time IS NULL
                        OR datetime(a.end_time) >= datetime(window_focus_events.start_time))
                 ORDER BY a.start_time DESC LIMIT 1
             )",
            [],
        )?;
        let clipped = tx.execute(
            "UPDATE window_focus_events
             SET end_time = (SELECT a.end_time FROM activity_sessions a
                             WHERE a.id = window_focus_events.session_id),
                 duration_seconds = MAX(0.0,
                     (julianday((SELECT a.end_time FROM activity_sessions a
                                 WHERE a.id = window_focus_events.session_id))
                      - julianday(start_time)) * 86400.0)
             WHERE session_id IS NOT NULL
               AND (SELECT a.end_time FROM activity_sessions a
                    WHERE a.id = window_focus_events.session_id) IS NOT NULL
               AND datetime(end_time) > datetime(
                    (SELECT a.end_time FROM activity_sessions a
                     WHERE a.id = window_focus_events.session_id))",
            [],
        )?;
        tx.commit()?;
        Ok(reassigned.max(clipped))
    }

    // ===================== Threshold summaries =====================

    /// Screenshots not consumed by any threshold summary, recency first.
    /// `require_session` restricts to screenshots linked to a session
    /// (excludes AFK captures); `date` restricts to one local day.
    pub fn get_unsummarized_screenshots(
        &self,
        require_session: bool,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Screenshot>> {
        let session_filter = if require_session {
            "AND EXISTS (SELECT 1 FROM session_screenshots ss WHERE ss.screenshot_id = s.id)"
        } else {
            ""
        };
        let (date_filter, date_params) = match date {
            Some(day) => {
                let midnight = day.and_hms_opt(0, 0, 0).expect("midnight is always valid");
                let start = local_timestamp(midnight);
                ("AND s.timestamp >= ?1 AND s.timestamp < ?2", vec![start, start + 86_400])
            }
            None => ("", vec![]),
        };
        let conn = self.conn.lock().unwrap();
        let cols = SCREENSHOT_COLS
            .split(", ")
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM screenshots s
             WHERE NOT EXISTS (
                 SELECT 1 FROM threshold_summary_screenshots tss
                 WHERE tss.screenshot_id = s.id
             )
             {session_filter}
             {date_filter}
             ORDER BY s.timestamp DESC"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(date_params), row_to_screenshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Exact-match dedup guard on the slot boundaries among non-regenerated
    /// rows (I6). Regenerations share the range and do not count.
    pub fn has_summary_for_time_range(&self, start_iso: &str, end_iso: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM threshold_summaries
                 WHERE start_time = ?1 AND end_time = ?2
                   AND regenerated_from IS NULL
                 LIMIT 1",
                params![start_iso, end_iso],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a summary and its screenshot link rows atomically. A crash can
    /// never leave a summary without its links (I5).
    pub fn save_threshold_summary(&self, new: &NewThresholdSummary) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO threshold_summaries
                 (start_time, end_time, summary, screenshot_ids, screenshot_count,
                  model_used, config_snapshot, inference_time_ms, prompt_text,
                  explanation, tags, confidence, project, regenerated_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new.start_time,
                new.end_time,
                new.summary,
                ids_to_json(&new.screenshot_ids),
                new.screenshot_ids.len() as i64,
                new.model_used,
                new.config_snapshot.as_ref().map(|v| v.to_string()),
                new.inference_time_ms,
                new.prompt_text,
                new.explanation,
                (!new.tags.is_empty())
                    .then(|| serde_json::to_string(&new.tags).unwrap_or_default()),
                new.confidence,
                new.project,
                new.regenerated_from,
            ],
        )?;
        let summary_id = tx.last_insert_rowid();
        {
            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO threshold_summary_screenshots
                     (summary_id, screenshot_id) VALUES (?1, ?2)",
            )?;
            for screenshot_id in &new.screenshot_ids {
                link.execute(params![summary_id, screenshot_id])?;
            }
        }
        tx.commit()?;
        Ok(summary_id)
    }

    pub fn get_threshold_summary(&self, id: i64) -> Result<Option<ThresholdSummary>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {SUMMARY_COLS} FROM threshold_summaries WHERE id = ?1"),
                params![id],
                row_to_summary,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_last_threshold_summary(&self) -> Result<Option<ThresholdSummary>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLS} FROM threshold_summaries
                     ORDER BY datetime(end_time) DESC, id DESC LIMIT 1"
                ),
                [],
                row_to_summary,
            )
            .optional()?;
        Ok(row)
    }

    /// Root summary plus all rows regenerated from it, oldest first.
    pub fn get_summary_versions(&self, root_id: i64) -> Result<Vec<ThresholdSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLS} FROM threshold_summaries
             WHERE id = ?1 OR regenerated_from = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![root_id], row_to_summary)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_summaries_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<ThresholdSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLS} FROM threshold_summaries
             WHERE datetime(start_time) >= datetime(?1)
               AND datetime(start_time) < datetime(?2)
             ORDER BY start_time ASC"
        ))?;
        let rows = stmt
            .query_map(params![to_iso(start), to_iso(end)], row_to_summary)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ===================== Cached reports =====================

    /// Insert or refresh the rollup for `(period_type, period_date)`.
    pub fn save_cached_report(&self, report: &NewCachedReport) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO cached_reports
                 (period_type, period_date, start_time, end_time, executive_summary,
                  sections, analytics, model_used, child_summary_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.period_type,
                report.period_date,
                report.start_time,
                report.end_time,
                report.executive_summary,
                report.sections.as_ref().map(|v| v.to_string()),
                report.analytics.as_ref().map(|v| v.to_string()),
                report.model_used,
                ids_to_json(&report.child_summary_ids),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_cached_report(
        &self,
        period_type: &str,
        period_date: &str,
    ) -> Result<Option<CachedReport>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, period_type, period_date, start_time, end_time,
                        executive_summary, sections, analytics, model_used, child_summary_ids
                 FROM cached_reports
                 WHERE period_type = ?1 AND period_date = ?2",
                params![period_type, period_date],
                |row| {
                    Ok(CachedReport {
                        id: row.get(0)?,
                        period_type: row.get(1)?,
                        period_date: row.get(2)?,
                        start_time: row.get(3)?,
                        end_time: row.get(4)?,
                        executive_summary: row.get(5)?,
                        sections: json_from_column(row.get(6)?),
                        analytics: json_from_column(row.get(7)?),
                        model_used: row.get(8)?,
                        child_summary_ids: ids_from_json(row.get(9)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_cached_report(&self, period_type: &str, period_date: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM cached_reports WHERE period_type = ?1 AND period_date = ?2",
            params![period_type, period_date],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(s: &str) -> NaiveDateTime {
        parse_iso(s).unwrap()
    }

    fn shot(ts: i64, title: Option<&str>) -> NewScreenshot {
        NewScreenshot {
            timestamp: ts,
            filepath: format!("2026/01/05/{ts}_abcd1234.webp"),
            dhash: "a1b2c3d4e5f60718".to_string(),
            window_title: title.map(String::from),
            app_name: title.map(|_| "Firefox".to_string()),
            window_geometry: None,
            monitor: None,
        }
    }

    #[test]
    fn iso_round_trip() {
        let t = dt("2026-01-05T10:15:00");
        assert_eq!(to_iso(t), "2026-01-05T10:15:00");
        assert_eq!(parse_iso("2026-01-05 10:15:00"), Some(t));
        assert_eq!(parse_iso("2026-01-05T10:15:00.250"), Some(dt("2026-01-05T10:15:00") + chrono::Duration::milliseconds(250)));
        assert_eq!(parse_iso("not a time"), None);
    }

    #[test]
    fn session_lifecycle_and_counts() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();

        let a = store.insert_screenshot(&shot(1000, Some("docs - Firefox"))).unwrap();
        let b = store.insert_screenshot(&shot(1030, Some("docs - Firefox"))).unwrap();
        let c = store.insert_screenshot(&shot(1060, Some("bash - Terminal"))).unwrap();
        for id in [a, b, c] {
            store.link_screenshot_to_session(sid, id).unwrap();
        }
        // Idempotent relink
        store.link_screenshot_to_session(sid, a).unwrap();

        store.end_session(sid, dt("2026-01-05T10:30:00"), 1800).unwrap();
        let session = store.get_session(sid).unwrap().unwrap();
        assert_eq!(session.end_time.as_deref(), Some("2026-01-05T10:30:00"));
        assert_eq!(session.duration_seconds, Some(1800));
        assert_eq!(session.screenshot_count, 3);
        assert_eq!(session.unique_windows, 2);
    }

    #[test]
    fn at_most_one_active_session() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_active_session().unwrap().is_none());

        let first = store.create_session(dt("2026-01-05T09:00:00")).unwrap();
        store.end_session(first, dt("2026-01-05T09:30:00"), 1800).unwrap();
        let second = store.create_session(dt("2026-01-05T10:00:00")).unwrap();

        let active = store.get_active_session().unwrap().unwrap();
        assert_eq!(active.id, second);
    }

    #[test]
    fn delete_session_cascades() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        let ssid = store.insert_screenshot(&shot(1000, Some("short"))).unwrap();
        store.link_screenshot_to_session(sid, ssid).unwrap();
        store.cache_ocr(sid, "short", "text", ssid).unwrap();

        store.delete_session(sid).unwrap();
        assert!(store.get_session(sid).unwrap().is_none());
        assert!(store.get_session_screenshots(sid).unwrap().is_empty());
        assert!(store.get_cached_ocr(sid, "short").unwrap().is_none());
        // The screenshot row itself survives
        assert!(store.get_screenshot(ssid).unwrap().is_some());
    }

    #[test]
    fn last_screenshot_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        assert_eq!(store.get_last_screenshot_timestamp_for_session(sid).unwrap(), None);

        let a = store.insert_screenshot(&shot(1000, None)).unwrap();
        let b = store.insert_screenshot(&shot(2000, None)).unwrap();
        store.link_screenshot_to_session(sid, a).unwrap();
        store.link_screenshot_to_session(sid, b).unwrap();
        assert_eq!(store.get_last_screenshot_timestamp_for_session(sid).unwrap(), Some(2000));
    }

    #[test]
    fn screenshots_in_range_is_half_open() {
        let store = Store::open_in_memory().unwrap();
        let start = dt("2026-01-05T10:00:00");
        let end = dt("2026-01-05T10:15:00");
        let before = local_timestamp(start) - 1;
        let at_start = local_timestamp(start);
        let at_end = local_timestamp(end);

        store.insert_screenshot(&shot(before, None)).unwrap();
        let included = store.insert_screenshot(&shot(at_start, None)).unwrap();
        store.insert_screenshot(&shot(at_end, None)).unwrap();

        let rows = store.get_screenshots_in_range(start, end).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, included);
    }

    #[test]
    fn active_session_overlap_detection() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:05:00")).unwrap();
        store.end_session(sid, dt("2026-01-05T10:20:00"), 900).unwrap();

        // Overlapping slot
        assert!(store
            .has_active_session_in_range(dt("2026-01-05T10:00:00"), dt("2026-01-05T10:15:00"))
            .unwrap());
        // Entirely AFK slot
        assert!(!store
            .has_active_session_in_range(dt("2026-01-05T11:00:00"), dt("2026-01-05T11:15:00"))
            .unwrap());
        // Session ending exactly at slot start does not overlap
        assert!(!store
            .has_active_session_in_range(dt("2026-01-05T10:20:00"), dt("2026-01-05T10:35:00"))
            .unwrap());
        // Open session overlaps everything after its start
        store.create_session(dt("2026-01-05T12:00:00")).unwrap();
        assert!(store
            .has_active_session_in_range(dt("2026-01-05T13:00:00"), dt("2026-01-05T13:15:00"))
            .unwrap());
    }

    #[test]
    fn focus_event_save_and_overlap_query() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        store
            .save_focus_event(
                "docs - Firefox",
                "Firefox",
                Some("firefox"),
                dt("2026-01-05T10:00:05"),
                dt("2026-01-05T10:14:50"),
                Some(sid),
                None,
            )
            .unwrap();
        // AFK-attributed event (no session)
        store
            .save_focus_event(
                "lockscreen",
                "gnome",
                None,
                dt("2026-01-05T10:10:00"),
                dt("2026-01-05T10:12:00"),
                None,
                None,
            )
            .unwrap();
        // Outside the slot
        store
            .save_focus_event(
                "bash - Terminal",
                "Terminal",
                None,
                dt("2026-01-05T11:00:00"),
                dt("2026-01-05T11:05:00"),
                Some(sid),
                None,
            )
            .unwrap();

        let all = store
            .get_focus_events_overlapping_range(
                dt("2026-01-05T10:00:00"),
                dt("2026-01-05T10:15:00"),
                false,
            )
            .unwrap();
        assert_eq!(all.len(), 2);

        let with_session = store
            .get_focus_events_overlapping_range(
                dt("2026-01-05T10:00:00"),
                dt("2026-01-05T10:15:00"),
                true,
            )
            .unwrap();
        assert_eq!(with_session.len(), 1);
        assert_eq!(with_session[0].window_title, "docs - Firefox");
        assert!((with_session[0].duration_seconds - 885.0).abs() < 0.01);
    }

    #[test]
    fn threshold_summary_atomic_insert_and_links() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_screenshot(&shot(1000, None)).unwrap();
        let b = store.insert_screenshot(&shot(1060, None)).unwrap();

        let id = store
            .save_threshold_summary(&NewThresholdSummary {
                start_time: "2026-01-05T10:00:00".to_string(),
                end_time: "2026-01-05T10:15:00".to_string(),
                summary: "Debugging portal permissions in tracker service".to_string(),
                screenshot_ids: vec![a, b],
                model_used: "gemma3:12b-it-qat".to_string(),
                config_snapshot: Some(serde_json::json!({"max_samples": 10})),
                inference_time_ms: Some(2500),
                prompt_text: Some("prompt".to_string()),
                explanation: Some("Saw an editor and terminal".to_string()),
                tags: vec!["coding".to_string(), "debugging".to_string()],
                confidence: Some(0.8),
                project: Some("activity-tracker".to_string()),
                regenerated_from: None,
            })
            .unwrap();

        let summary = store.get_threshold_summary(id).unwrap().unwrap();
        assert_eq!(summary.screenshot_ids, vec![a, b]);
        assert_eq!(summary.screenshot_count, 2);
        assert_eq!(summary.tags, vec!["coding", "debugging"]);
        assert_eq!(summary.confidence, Some(0.8));
        assert_eq!(summary.project.as_deref(), Some("activity-tracker"));

        // I5: link rows match screenshot_ids
        let unsummarized = store.get_unsummarized_screenshots(false, None).unwrap();
        assert!(unsummarized.is_empty());
    }

    #[test]
    fn dedup_guard_ignores_regenerations() {
        let store = Store::open_in_memory().unwrap();
        let base = NewThresholdSummary {
            start_time: "2026-01-05T10:00:00".to_string(),
            end_time: "2026-01-05T10:15:00".to_string(),
            summary: "original".to_string(),
            screenshot_ids: vec![],
            model_used: "m".to_string(),
            config_snapshot: None,
            inference_time_ms: None,
            prompt_text: None,
            explanation: None,
            tags: vec![],
            confidence: None,
            project: None,
            regenerated_from: None,
        };
        assert!(!store
            .has_summary_for_time_range("2026-01-05T10:00:00", "2026-01-05T10:15:00")
            .unwrap());
        let root = store.save_threshold_summary(&base).unwrap();
        assert!(store
            .has_summary_for_time_range("2026-01-05T10:00:00", "2026-01-05T10:15:00")
            .unwrap());

        // A regeneration shares the range but is not counted by the guard
        let regen = NewThresholdSummary {
            summary: "regenerated".to_string(),
            regenerated_from: Some(root),
            ..base
        };
        let regen_id = store.save_threshold_summary(&regen).unwrap();
        let versions = store.get_summary_versions(root).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, root);
        assert_eq!(versions[1].id, regen_id);
        assert_eq!(versions[1].regenerated_from, Some(root));
    }

    #[test]
    fn unsummarized_filters() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let day_ts = local_timestamp(day.and_hms_opt(12, 0, 0).unwrap());
        let other_ts = day_ts + 3 * 86_400;

        let linked = store.insert_screenshot(&shot(day_ts, None)).unwrap();
        let afk = store.insert_screenshot(&shot(day_ts + 60, None)).unwrap();
        let other_day = store.insert_screenshot(&shot(other_ts, None)).unwrap();
        store.link_screenshot_to_session(sid, linked).unwrap();

        let session_only = store.get_unsummarized_screenshots(true, None).unwrap();
        assert_eq!(session_only.iter().map(|s| s.id).collect::<Vec<_>>(), vec![linked]);

        let all = store.get_unsummarized_screenshots(false, None).unwrap();
        assert_eq!(all.len(), 3);
        // Recency-first ordering
        assert_eq!(all[0].id, other_day);

        let day_only = store.get_unsummarized_screenshots(false, Some(day)).unwrap();
        assert_eq!(day_only.len(), 2);
        assert!(day_only.iter().all(|s| s.id == linked || s.id == afk));
    }

    #[test]
    fn delete_screenshot_cascades_links() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        let ssid = store.insert_screenshot(&shot(1000, None)).unwrap();
        store.link_screenshot_to_session(sid, ssid).unwrap();
        store
            .save_threshold_summary(&NewThresholdSummary {
                start_time: "2026-01-05T10:00:00".to_string(),
                end_time: "2026-01-05T10:15:00".to_string(),
                summary: "s".to_string(),
                screenshot_ids: vec![ssid],
                model_used: "m".to_string(),
                config_snapshot: None,
                inference_time_ms: None,
                prompt_text: None,
                explanation: None,
                tags: vec![],
                confidence: None,
                project: None,
                regenerated_from: None,
            })
            .unwrap();

        store.delete_screenshot(ssid).unwrap();
        assert!(store.get_screenshot(ssid).unwrap().is_none());
        assert!(store.get_session_screenshots(sid).unwrap().is_empty());
        assert!(store.get_unsummarized_screenshots(false, None).unwrap().is_empty());
    }

    #[test]
    fn ocr_cache_memoizes_per_title() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        let ssid = store.insert_screenshot(&shot(1000, Some("editor"))).unwrap();

        assert!(store.get_cached_ocr(sid, "editor").unwrap().is_none());
        store.cache_ocr(sid, "editor", "fn main() {}", ssid).unwrap();
        assert_eq!(store.get_cached_ocr(sid, "editor").unwrap().as_deref(), Some("fn main() {}"));

        // Same title in a different session misses
        let other = store.create_session(dt("2026-01-05T12:00:00")).unwrap();
        assert!(store.get_cached_ocr(other, "editor").unwrap().is_none());
    }

    #[test]
    fn session_summary_fields_are_optional_narrative() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        store
            .save_session_summary(sid, "Reviewed auth changes", "gemma3:12b-it-qat", 1200, Some("p"), &[1, 2])
            .unwrap();
        let session = store.get_session(sid).unwrap().unwrap();
        assert_eq!(session.summary.as_deref(), Some("Reviewed auth changes"));
        assert_eq!(session.screenshot_ids_used, vec![1, 2]);
        assert!(session.end_time.is_none());
    }

    #[test]
    fn cached_report_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let report = NewCachedReport {
            period_type: "daily".to_string(),
            period_date: "2026-01-04".to_string(),
            start_time: "2026-01-04T00:00:00".to_string(),
            end_time: "2026-01-05T00:00:00".to_string(),
            executive_summary: "Worked on the tracker store".to_string(),
            sections: Some(serde_json::json!([{"title": "Morning", "body": "..."}])),
            analytics: Some(serde_json::json!({"active_minutes": 312})),
            model_used: Some("gemma3:12b-it-qat".to_string()),
            child_summary_ids: vec![1, 2, 3],
        };
        store.save_cached_report(&report).unwrap();

        let loaded = store.get_cached_report("daily", "2026-01-04").unwrap().unwrap();
        assert_eq!(loaded.executive_summary, "Worked on the tracker store");
        assert_eq!(loaded.child_summary_ids, vec![1, 2, 3]);
        assert!(store.get_cached_report("daily", "2026-01-03").unwrap().is_none());

        // Replace on same key
        let replacement = NewCachedReport {
            executive_summary: "Updated".to_string(),
            ..report
        };
        store.save_cached_report(&replacement).unwrap();
        let loaded = store.get_cached_report("daily", "2026-01-04").unwrap().unwrap();
        assert_eq!(loaded.executive_summary, "Updated");

        assert!(store.delete_cached_report("daily", "2026-01-04").unwrap());
        assert!(!store.delete_cached_report("daily", "2026-01-04").unwrap());
    }

    #[test]
    fn focus_fixup_reassigns_and_clips() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        store.end_session(sid, dt("2026-01-05T10:30:00"), 1800).unwrap();

        // Legacy row: wrong (missing) session, end time spilling past session end
        store
            .save_focus_event(
                "docs - Firefox",
                "Firefox",
                None,
                dt("2026-01-05T10:10:00"),
                dt("2026-01-05T10:45:00"),
                None,
                None,
            )
            .unwrap();

        let touched = store.fix_focus_event_attribution().unwrap();
        assert!(touched >= 1);

        let events = store
            .get_focus_events_overlapping_range(
                dt("2026-01-05T10:00:00"),
                dt("2026-01-05T11:00:00"),
                true,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, Some(sid));
        assert_eq!(events[0].end_time, "2026-01-05T10:30:00");
        assert!((events[0].duration_seconds - 1200.0).abs() < 1.0);
    }

    #[test]
    fn app_durations_and_context_switches() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(dt("2026-01-05T10:00:00")).unwrap();
        store
            .save_focus_event("a", "Firefox", None, dt("2026-01-05T10:00:00"), dt("2026-01-05T10:10:00"), Some(sid), None)
            .unwrap();
        store
            .save_focus_event("b", "Terminal", None, dt("2026-01-05T10:10:00"), dt("2026-01-05T10:12:00"), Some(sid), None)
            .unwrap();
        store
            .save_focus_event("c", "Firefox", None, dt("2026-01-05T10:12:00"), dt("2026-01-05T10:20:00"), Some(sid), None)
            .unwrap();

        let apps = store
            .get_app_durations_in_range(dt("2026-01-05T10:00:00"), dt("2026-01-05T10:30:00"))
            .unwrap();
        assert_eq!(apps[0].app_name, "Firefox");
        assert!((apps[0].total_seconds - 1080.0).abs() < 0.01);
        assert_eq!(apps[0].event_count, 2);

        let switches = store
            .get_context_switch_count(dt("2026-01-05T10:00:00"), dt("2026-01-05T10:30:00"))
            .unwrap();
        assert_eq!(switches, 3);
    }
}

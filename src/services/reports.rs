use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::sync::Arc;

use crate::services::llm_client::LlmClient;
use crate::storage::store::{to_iso, AppDuration, NewCachedReport, Store, ThresholdSummary};

/// Build the analytics blob for one day from focus aggregates.
fn analytics_json(
    apps: &[AppDuration],
    context_switches: i64,
    summary_count: usize,
) -> serde_json::Value {
    let total_minutes: f64 = apps.iter().map(|a| a.total_seconds).sum::<f64>() / 60.0;
    serde_json::json!({
        "active_minutes": total_minutes.round() as i64,
        "context_switches": context_switches,
        "summary_count": summary_count,
        "top_apps": apps.iter().take(5).map(|a| {
            serde_json::json!({
                "name": a.app_name,
                "minutes": (a.total_seconds / 60.0).round() as i64,
                "events": a.event_count,
            })
        }).collect::<Vec<_>>(),
    })
}

/// Chronological sections, one per child summary.
fn sections_json(summaries: &[ThresholdSummary]) -> serde_json::Value {
    serde_json::json!(summaries
        .iter()
        .map(|s| {
            serde_json::json!({
                "start_time": s.start_time,
                "end_time": s.end_time,
                "summary": s.summary,
                "tags": s.tags,
            })
        })
        .collect::<Vec<_>>())
}

fn executive_prompt(date: &str, summaries: &[ThresholdSummary], apps: &[AppDuration]) -> String {
    let mut lines = vec![
        format!("Combine these work-period summaries from {date} into a 2-3 sentence daily summary."),
        "Focus on main accomplishments and themes.".to_string(),
        String::new(),
    ];
    for s in summaries {
        let time = s.start_time.split('T').nth(1).unwrap_or(&s.start_time);
        lines.push(format!("{} - {}", &time[..5.min(time.len())], s.summary));
    }
    if !apps.is_empty() {
        lines.push(String::new());
        lines.push("Top applications by focus time:".to_string());
        for app in apps.iter().take(5) {
            lines.push(format!("- {}: ~{} min", app.app_name, (app.total_seconds / 60.0).round()));
        }
    }
    lines.join("\n")
}

fn fallback_executive_summary(summaries: &[ThresholdSummary], apps: &[AppDuration]) -> String {
    let top = apps
        .iter()
        .take(3)
        .map(|a| a.app_name.clone())
        .collect::<Vec<_>>()
        .join(", ");
    if top.is_empty() {
        format!("Tracked {} work periods.", summaries.len())
    } else {
        format!("Tracked {} work periods. Most time in: {top}.", summaries.len())
    }
}

/// Synthesize the cached daily report for `date` (YYYY-MM-DD) from that
/// day's threshold summaries. Returns the report row id, or `None` when the
/// day had no summaries. The caller is responsible for the
/// only-once-per-midnight and already-cached gates.
pub async fn generate_daily_report(
    store: &Arc<Store>,
    llm: &LlmClient,
    date: &str,
) -> Result<Option<i64>> {
    let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
        anyhow::bail!("invalid report date: {date}");
    };
    let day_start = day.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    let day_end = day_start + ChronoDuration::days(1);

    let summaries = store.get_summaries_in_range(day_start, day_end)?;
    if summaries.is_empty() {
        return Ok(None);
    }

    let apps = store.get_app_durations_in_range(day_start, day_end)?;
    let context_switches = store.get_context_switch_count(day_start, day_end)?;

    let executive_summary = match llm
        .generate_text(&executive_prompt(date, &summaries, &apps))
        .await
    {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            log::warn!("Executive summary generation failed, using fallback: {e}");
            fallback_executive_summary(&summaries, &apps)
        }
    };

    let id = store.save_cached_report(&NewCachedReport {
        period_type: "daily".to_string(),
        period_date: date.to_string(),
        start_time: to_iso(day_start),
        end_time: to_iso(day_end),
        executive_summary,
        sections: Some(sections_json(&summaries)),
        analytics: Some(analytics_json(&apps, context_switches, summaries.len())),
        model_used: Some(llm.model().to_string()),
        child_summary_ids: summaries.iter().map(|s| s.id).collect(),
    })?;
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: i64, start: &str, text: &str) -> ThresholdSummary {
        ThresholdSummary {
            id,
            start_time: start.to_string(),
            end_time: start.to_string(),
            summary: text.to_string(),
            screenshot_ids: vec![],
            screenshot_count: 0,
            model_used: "m".to_string(),
            config_snapshot: None,
            inference_time_ms: None,
            prompt_text: None,
            explanation: None,
            tags: vec!["coding".to_string()],
            confidence: None,
            project: None,
            regenerated_from: None,
            created_at: None,
        }
    }

    fn app(name: &str, seconds: f64) -> AppDuration {
        AppDuration {
            app_name: name.to_string(),
            total_seconds: seconds,
            event_count: 3,
        }
    }

    #[test]
    fn analytics_aggregates_minutes() {
        let analytics = analytics_json(&[app("Firefox", 1800.0), app("Terminal", 600.0)], 12, 4);
        assert_eq!(analytics["active_minutes"], 40);
        assert_eq!(analytics["context_switches"], 12);
        assert_eq!(analytics["top_apps"][0]["name"], "Firefox");
        assert_eq!(analytics["top_apps"][0]["minutes"], 30);
    }

    #[test]
    fn prompt_lists_periods_chronologically() {
        let prompt = executive_prompt(
            "2026-01-04",
            &[
                summary(1, "2026-01-04T09:00:00", "Reviewing store migrations"),
                summary(2, "2026-01-04T10:15:00", "Writing focus clipping tests"),
            ],
            &[app("Code", 3600.0)],
        );
        let first = prompt.find("09:00 - Reviewing store migrations").unwrap();
        let second = prompt.find("10:15 - Writing focus clipping tests").unwrap();
        assert!(first < second);
        assert!(prompt.contains("- Code: ~60 min"));
    }

    #[test]
    fn fallback_mentions_top_apps() {
        let text = fallback_executive_summary(
            &[summary(1, "2026-01-04T09:00:00", "s")],
            &[app("Firefox", 600.0)],
        );
        assert!(text.contains("1 work periods"));
        assert!(text.contains("Firefox"));
    }

    #[test]
    fn sections_preserve_tags() {
        let sections = sections_json(&[summary(1, "2026-01-04T09:00:00", "s")]);
        assert_eq!(sections[0]["tags"][0], "coding");
    }
}

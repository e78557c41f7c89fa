//! Markdown rendering of stored click totals.

use bitstats_core::DAY_FORMAT;
use bitstats_storage::{DailyTotal, SqliteRecordStore};
use chrono::{Duration, NaiveDate};

use crate::SyncError;

/// Render the last `days` days (counting back from `today`, inclusive) of stored
/// clicks as a Markdown table, one row per day and short link.
pub async fn report_markdown(
    store: &SqliteRecordStore,
    days: u32,
    today: NaiveDate,
) -> Result<String, SyncError> {
    let since = Duration::try_days(i64::from(days.max(1)) - 1)
        .and_then(|window| today.checked_sub_signed(window))
        .ok_or_else(|| {
            anyhow::anyhow!("report window of {days} days reaches before {}", NaiveDate::MIN)
        })?
        .format(DAY_FORMAT)
        .to_string();
    let totals = store.daily_totals(&since).await?;
    Ok(render_totals(&since, &totals))
}

pub fn render_totals(since: &str, totals: &[DailyTotal]) -> String {
    let mut lines = vec![format!("# Bitly clicks since {since}"), String::new()];

    if totals.is_empty() {
        lines.push("_no clicks recorded_".to_string());
        lines.push(String::new());
        return lines.join("\n");
    }

    lines.push("| date | link | host | path | campaign | clicks |".to_string());
    lines.push("|------|------|------|------|----------|-------:|".to_string());
    for row in totals {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            cell(&row.day),
            cell(&row.link),
            cell(&row.host),
            cell(&row.path),
            cell(&row.utm_campaign),
            row.clicks
        ));
    }
    let total: i64 = totals.iter().map(|row| row.clicks).sum();
    lines.push(String::new());
    lines.push(format!("Total clicks: {total}"));
    lines.push(String::new());
    lines.join("\n")
}

fn cell(value: &str) -> String {
    value.replace('|', "\\|")
}

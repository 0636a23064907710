//! Everything the CLI prints goes through here.
//!
//! Human output is a status mark followed by the message, `kv` lines under
//! section headers, and tables for conversation and project listings. JSON
//! output bypasses all of it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_HORIZONTAL_ONLY;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt::Display;
use std::io::Write;
use std::time::Duration;

/// Width of the key column of `kv` lines.
const KEY_WIDTH: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// Machine-readable, one JSON document per command
    Json,
    /// Like `Human`, without colors or spinners
    Plain,
}

impl OutputFormat {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }

    pub fn shows_progress(&self) -> bool {
        matches!(self, Self::Human)
    }
}

#[derive(Clone, Copy)]
enum Mark {
    Done,
    Failed,
    Caution,
    Note,
}

impl Mark {
    fn render(self) -> String {
        match self {
            Self::Done => style("✓").green().bold().to_string(),
            Self::Failed => style("✗").red().bold().to_string(),
            Self::Caution => style("!").yellow().bold().to_string(),
            Self::Note => style("·").dim().to_string(),
        }
    }
}

fn line(mark: Mark, msg: impl Display) {
    match mark {
        Mark::Failed => eprintln!("{} {}", mark.render(), msg),
        _ => println!("{} {}", mark.render(), msg),
    }
}

pub fn success(msg: impl Display) {
    line(Mark::Done, msg);
}

/// Printed to stderr.
pub fn error(msg: impl Display) {
    line(Mark::Failed, msg);
}

pub fn warning(msg: impl Display) {
    line(Mark::Caution, msg);
}

pub fn info(msg: impl Display) {
    line(Mark::Note, msg);
}

pub fn header(title: impl Display) {
    println!();
    println!("{}", style(title).bold());
}

pub fn kv(key: impl Display, value: impl Display) {
    let key = format!("{key}:");
    println!("  {} {}", style(format!("{key:<KEY_WIDTH$}")).cyan(), value);
}

/// A ticking spinner in human output, a hidden bar otherwise.
pub fn spinner_for(format: OutputFormat, msg: impl Into<String>) -> ProgressBar {
    if !format.shows_progress() {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new_spinner().with_message(msg.into());
    if let Ok(spinner_style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        bar.set_style(spinner_style);
    }
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Ask a yes/no question. Anything but an explicit yes is a no.
pub fn confirm(question: impl Into<String>) -> Result<bool> {
    Confirm::new()
        .with_prompt(question)
        .default(false)
        .interact()
        .context("Could not read an answer from the terminal")
}

/// A listing with a fixed set of columns.
pub struct ListTable {
    table: Table,
}

impl ListTable {
    pub fn new<const N: usize>(columns: [&str; N]) -> Self {
        let mut table = Table::new();
        table
            .load_preset(UTF8_HORIZONTAL_ONLY)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(
                columns
                    .into_iter()
                    .map(|column| Cell::new(column).add_attribute(Attribute::Bold)),
            );
        Self { table }
    }

    pub fn push<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Cell>,
    {
        self.table.add_row(cells);
    }

    pub fn len(&self) -> usize {
        self.table.row_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn print(&self) {
        println!("{}", self.table);
    }
}

/// Sizes in binary units, one decimal above a KiB.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

/// Sync passes usually take milliseconds, so those keep full precision.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{}ms", duration.as_millis()),
        1..60 => format!("{:.1}s", duration.as_secs_f64()),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Age of `ts` relative to `now`; a date once it is a week old.
pub fn format_timestamp_at(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(ts);
    let (minutes, hours, days) = (age.num_minutes(), age.num_hours(), age.num_days());

    if minutes < 1 {
        "just now".to_string()
    } else if hours < 1 {
        format!("{minutes}m ago")
    } else if days < 1 {
        format!("{hours}h ago")
    } else if days < 7 {
        format!("{days}d ago")
    } else {
        ts.format("%Y-%m-%d %H:%M UTC").to_string()
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    format_timestamp_at(ts, Utc::now())
}

/// Write `data` to stdout as pretty JSON.
pub fn json<T: Serialize>(data: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, data).context("Failed to encode JSON output")?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(3660)), "1h 01m");
    }

    #[test]
    fn test_format_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp_at(now, now), "just now");
        assert_eq!(format_timestamp_at(now - chrono::Duration::minutes(5), now), "5m ago");
        assert_eq!(format_timestamp_at(now - chrono::Duration::hours(3), now), "3h ago");
        assert_eq!(format_timestamp_at(now - chrono::Duration::days(2), now), "2d ago");
        assert_eq!(
            format_timestamp_at(now - chrono::Duration::days(30), now),
            "2024-04-10 12:00 UTC"
        );
    }

    #[test]
    fn test_only_human_output_shows_progress() {
        assert!(OutputFormat::Json.is_json());
        assert!(!OutputFormat::Plain.is_json());
        assert!(OutputFormat::Human.shows_progress());
        assert!(!OutputFormat::Plain.shows_progress());
        assert!(spinner_for(OutputFormat::Json, "syncing").is_hidden());
    }

    #[test]
    fn test_list_table() {
        let mut table = ListTable::new(["ID", "Title", "Messages"]);
        assert!(table.is_empty());

        table.push(["abc", "Fix flaky test", "2"]);
        table.push(["def".to_string(), "-".to_string(), 0.to_string()]);
        assert_eq!(table.len(), 2);
    }
}

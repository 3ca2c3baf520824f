use crate::db::HistoryStore;
use crate::errors::{AppError, AppResult};
use crate::models::{format_date, MetricResult, Progress, TrendDirection};
use crate::pipeline::RunReport;
use crate::schema::{self, SLOTS};
use std::fmt::{self, Write as _};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

pub fn write_run_summary(report: &RunReport, dir: &Path) -> AppResult<SummaryPaths> {
    let day_dir = dir.join(format_date(report.run_date));
    let json = day_dir.join("summary.json");
    let markdown = day_dir.join("summary.md");

    let payload = serde_json::to_vec_pretty(report).map_err(|error| AppError::Io(error.to_string()))?;
    write_atomic(&json, &payload)?;
    let rendered = render_markdown(report).map_err(|error| AppError::Io(error.to_string()))?;
    write_atomic(&markdown, rendered.as_bytes())?;

    tracing::info!(path = %day_dir.display(), "run summary written");
    Ok(SummaryPaths { json, markdown })
}

pub fn render_markdown(report: &RunReport) -> Result<String, fmt::Error> {
    let mut out = String::new();
    writeln!(out, "# Daily summary {}", format_date(report.run_date))?;
    writeln!(out)?;
    writeln!(out, "Run `{}`", report.run_id)?;
    writeln!(out)?;

    writeln!(out, "## Goals")?;
    writeln!(out)?;
    if report.metrics.results.is_empty() {
        writeln!(out, "No goals evaluated.")?;
    } else {
        writeln!(out, "| Goal | Window | Actual | Target | Progress | Status | Trend |")?;
        writeln!(out, "|---|---|---|---|---|---|---|")?;
        for result in &report.metrics.results {
            writeln!(
                out,
                "| {} | {}..{} | {} | {} | {} | {} | {} |",
                result.goal.label(),
                format_date(result.window_start),
                format_date(result.window_end),
                number(result.actual_value),
                number(Some(result.target_value)),
                progress(result),
                result.status.as_str(),
                trend_arrow(result.trend.direction),
            )?;
        }
    }

    if !report.metrics.unresolved.is_empty() {
        writeln!(out)?;
        writeln!(out, "## Unresolved goals")?;
        writeln!(out)?;
        for unresolved in &report.metrics.unresolved {
            writeln!(out, "- {}: {}", unresolved.goal.label(), unresolved.reason)?;
        }
    }

    writeln!(out)?;
    writeln!(out, "## Warnings")?;
    writeln!(out)?;
    if report.warnings().is_empty() {
        writeln!(out, "None.")?;
    } else {
        for warning in report.warnings() {
            writeln!(out, "- {}", warning)?;
        }
    }

    writeln!(out)?;
    match (report.records.first(), report.records.last()) {
        (Some(first), Some(last)) => {
            writeln!(
                out,
                "{} records from {} to {}.",
                report.records.len(),
                format_date(first.date),
                format_date(last.date)
            )?;
        }
        _ => {
            writeln!(out, "No records in range.")?;
        }
    }
    Ok(out)
}

pub fn export_history_csv(store: &HistoryStore, path: &Path) -> AppResult<usize> {
    let dates = store.dates()?;
    let records = match (dates.first(), dates.last()) {
        (Some(first), Some(last)) => store.range(*first, *last)?,
        _ => Vec::new(),
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["date".to_string()];
    header.extend(SLOTS.iter().map(|slot| schema::column_name(slot.domain, slot.name)));
    writer.write_record(&header)?;

    for record in &records {
        let mut row = Vec::with_capacity(header.len());
        row.push(format_date(record.date));
        for slot in SLOTS {
            row.push(
                record
                    .value(slot.domain, slot.name)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row)?;
    }
    let bytes = writer.into_inner().map_err(|error| AppError::Io(error.to_string()))?;
    write_atomic(path, &bytes)?;

    tracing::info!(path = %path.display(), rows = records.len(), "history exported");
    Ok(records.len())
}

fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

fn number(value: Option<f64>) -> String {
    match value {
        Some(value) if value.fract() == 0.0 => format!("{:.0}", value),
        Some(value) => format!("{:.2}", value),
        None => "n/a".to_string(),
    }
}

fn progress(result: &MetricResult) -> String {
    match result.progress {
        Progress::Ratio(ratio) => format!("{:.1}%", ratio * 100.0),
        Progress::Deviation(deviation) => format!("{:+.2}", deviation),
        Progress::Undefined => "n/a".to_string(),
    }
}

fn trend_arrow(direction: TrendDirection) -> &'static str {
    match direction {
        TrendDirection::Up => "up",
        TrendDirection::Down => "down",
        TrendDirection::Flat => "flat",
        TrendDirection::Unknown => "-",
    }
}

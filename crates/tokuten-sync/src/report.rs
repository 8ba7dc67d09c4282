//! Per-run report files under `reports/<run_id>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokuten_core::SyncReport;

pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

pub fn reports_root(workspace_root: &Path) -> PathBuf {
    workspace_root.join("reports")
}

pub async fn write_run_reports(workspace_root: &Path, report: &SyncReport) -> Result<PathBuf> {
    let dir = reports_root(workspace_root).join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join(RUN_REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_REPORT_FILE}"))?;
    fs::write(dir.join(DAILY_BRIEF_FILE), daily_brief(report))
        .await
        .with_context(|| format!("writing {DAILY_BRIEF_FILE}"))?;
    Ok(dir)
}

fn daily_brief(report: &SyncReport) -> String {
    let mut exhibitors: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &report.merged_movies {
        for group in &record.bonus_groups {
            *exhibitors.entry(group.exhibitor_name.as_str()).or_default() += group.bonuses.len();
        }
    }

    let mut lines = vec![
        "# Tokuten Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Scraped at: {}", report.last_scraped_at),
        format!("- Success: {}", report.success),
        format!("- Incomplete: {}", report.incomplete),
        format!("- Canonical movies: {}", report.source_movie_count),
        format!("- Matched bonuses: {}", report.total_bonuses),
        format!("- Unmatched bonuses: {}", report.unmatched_bonuses.len()),
    ];
    if let Some(outcome) = &report.sync_outcome {
        lines.push(format!(
            "- Persistence: {:?} path, {} saved ({} inserted, {} updated, {} unchanged), {} manual bonuses skipped",
            outcome.path,
            outcome.saved_count,
            outcome.inserted_count,
            outcome.updated_count,
            outcome.unchanged_count,
            outcome.skipped_count
        ));
    }

    lines.push(String::new());
    lines.push("## Bonuses per exhibitor".to_string());
    lines.extend(exhibitors.iter().map(|(name, n)| format!("- {name}: {n}")));

    let rereleases: Vec<_> = report
        .merged_movies
        .iter()
        .filter(|r| r.is_rerelease)
        .map(|r| format!("- {} (`{}`)", r.seed.title, r.external_id()))
        .collect();
    if !rereleases.is_empty() {
        lines.push(String::new());
        lines.push("## Re-releases".to_string());
        lines.extend(rereleases);
    }

    if !report.source_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.extend(
            report
                .source_errors
                .iter()
                .map(|e| format!("- {:?} `{}`: {}", e.kind, e.scope, e.message)),
        );
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown summary of the `runs` most recent reports, newest first.
pub fn report_daily_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let root = reports_root(workspace_root);
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
        let path = entry?.path().join(RUN_REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let report: SyncReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut lines = vec!["# Tokuten Report Daily".to_string(), String::new()];
    for report in reports.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- finished: {}", report.timestamp));
        lines.push(format!(
            "- movies: {} merged, {} bonuses, {} unmatched",
            report.merged_movies.len(),
            report.total_bonuses,
            report.unmatched_bonuses.len()
        ));
        if let Some(outcome) = &report.sync_outcome {
            lines.push(format!(
                "- saved: {} via {:?} ({} errors)",
                outcome.saved_count,
                outcome.path,
                outcome.errors.len()
            ));
        }
        lines.push(format!("- source errors: {}", report.source_errors.len()));
        if report.incomplete {
            lines.push("- **incomplete run**".to_string());
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tokuten_core::{CanonicalMovieSeed, ErrorRecord, MergedMovieRecord, RunStage};
    use uuid::Uuid;

    fn report(minutes_ago: i64) -> SyncReport {
        let now = Utc::now() - ChronoDuration::minutes(minutes_ago);
        let mut record = MergedMovieRecord::from_seed(CanonicalMovieSeed::new("100", "鬼滅之刃"));
        record.is_rerelease = true;
        SyncReport {
            run_id: Uuid::new_v4(),
            success: true,
            incomplete: false,
            stage: RunStage::Reported,
            last_scraped_at: now,
            source_movie_count: 1,
            total_bonuses: 0,
            merged_movies: vec![record],
            unmatched_bonuses: Vec::new(),
            source_errors: vec![ErrorRecord::source_fetch("broken", "boom")],
            sync_outcome: None,
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn writes_report_files_and_summarizes_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let older = report(10);
        let newer = report(1);
        write_run_reports(dir.path(), &older).await.expect("write older");
        let newer_dir = write_run_reports(dir.path(), &newer).await.expect("write newer");

        let brief = std::fs::read_to_string(newer_dir.join(DAILY_BRIEF_FILE)).expect("brief");
        assert!(brief.contains("## Re-releases"));
        assert!(brief.contains("`broken`: boom"));

        let md = report_daily_markdown(1, dir.path()).expect("markdown");
        assert!(md.contains(&newer.run_id.to_string()));
        assert!(!md.contains(&older.run_id.to_string()));

        let md = report_daily_markdown(5, dir.path()).expect("markdown");
        let newer_at = md.find(&newer.run_id.to_string()).expect("newer listed");
        let older_at = md.find(&older.run_id.to_string()).expect("older listed");
        assert!(newer_at < older_at);
    }

    #[test]
    fn missing_reports_dir_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(report_daily_markdown(3, dir.path()).is_err());
    }
}

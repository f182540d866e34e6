//! Run log command implementation

use anyhow::Result;

use crate::detect::format_millis;
use crate::store::TrackingStore;

pub fn run(store: &TrackingStore, limit: usize) -> Result<()> {
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("No audit runs recorded.");
        return Ok(());
    }

    println!(
        "{:<18} {:<10} {:<8} {:>5} {:>5} {:>8} {:>8}  {}",
        "Started", "Run", "Status", "New", "Upd", "Inserted", "Deleted", "Projects"
    );
    println!("{}", "-".repeat(95));

    for run in runs {
        let status = if run.dry_run {
            format!("{}*", run.status)
        } else {
            run.status.clone()
        };
        let mut projects = run.projects.join(",");
        if !run.failures.is_empty() {
            projects.push_str(&format!(" (failed: {})", run.failures.join(",")));
        }

        println!(
            "{:<18} {:<10} {:<8} {:>5} {:>5} {:>8} {:>8}  {}",
            format_millis(run.started_at, "%Y-%m-%d %H:%M"),
            &run.id[..8.min(run.id.len())],
            status,
            run.new_count,
            run.updated_count,
            run.inserted,
            run.deleted,
            projects,
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
    println!("\n* dry run");

    Ok(())
}

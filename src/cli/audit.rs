//! Audit command implementation

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::detect::Status;
use crate::monitor::{AuditRequest, AuditSummary, Monitor};
use crate::notify::{Notifier, OutboxNotifier};
use crate::source::RestClient;
use crate::store::TrackingStore;

pub async fn run(config: Config, client: Arc<RestClient>, request: AuditRequest) -> Result<()> {
    if request.projects.is_empty() {
        anyhow::bail!("no projects given, pass at least one with --project");
    }

    let store = TrackingStore::open(&config.database_path())?;
    let checkpoints = super::checkpoint_store(&config, client.clone())?;
    let notifier: Option<Arc<dyn Notifier>> = config
        .outbox_path()
        .map(|dir| Arc::new(OutboxNotifier::new(&dir)) as Arc<dyn Notifier>);

    let monitor = Monitor::new(config, client, checkpoints, notifier, store);
    let summary = monitor.run(&request).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &AuditSummary) {
    println!(
        "Audit {}{}",
        summary.run_id,
        if summary.dry_run { " (dry run)" } else { "" }
    );
    println!(
        "Entities: {} new, {} updated, {} unchanged",
        summary.count(Status::New),
        summary.count(Status::Updated),
        summary.count(Status::Existing)
    );
    println!(
        "Tracking table: {} inserted, {} deleted",
        summary.merge.inserted, summary.merge.deleted
    );

    let changes: Vec<_> = summary.changes().collect();
    if !changes.is_empty() {
        println!();
        println!(
            "{:<9} {:<18} {:<14} {:<20} {}",
            "Status", "Change Time", "Entity", "Project", "Name"
        );
        println!("{}", "-".repeat(90));
        for entry in changes {
            println!(
                "{:<9} {:<18} {:<14} {:<20} {}",
                entry.status,
                entry.change_time(),
                entry.entity.id,
                entry.project_name,
                entry.entity.name
            );
        }
    }

    if !summary.checkpoints.is_empty() {
        println!();
        for (project, outcome) in &summary.checkpoints {
            println!("Checkpoint {}: {}", project, outcome.describe());
        }
    }

    if !summary.failures.is_empty() {
        println!();
        for failure in &summary.failures {
            println!(
                "FAILED {} after {} attempt(s): {}",
                failure.project_id, failure.attempts, failure.error
            );
        }
    }

    if let Some(path) = &summary.digest {
        println!("Digest written to {}", path.display());
    }
    if let Some(location) = &summary.notified {
        println!("Notification: {}", location);
    }
}

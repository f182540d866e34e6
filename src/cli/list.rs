//! List command implementation

use anyhow::Result;

use crate::detect::{format_millis, Status};
use crate::store::TrackingStore;

pub fn run(store: &TrackingStore, project: Option<String>, status: Option<String>) -> Result<()> {
    let status = status
        .as_deref()
        .map(str::parse::<Status>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let rows = store.list_rows(project.as_deref(), status)?;

    if rows.is_empty() {
        println!("No tracked entities. Run 'repowatch audit' first.");
        return Ok(());
    }

    println!(
        "{:<18} {:<14} {:<14} {:<9} {:<34} {:<16} {}",
        "Change Time", "Project", "Entity", "Status", "Fingerprint", "Contributor", "Name"
    );
    println!("{}", "-".repeat(120));

    for row in rows {
        let project = if row.project_name.chars().count() > 14 {
            format!("{}...", row.project_name.chars().take(11).collect::<String>())
        } else {
            row.project_name.clone()
        };

        println!(
            "{:<18} {:<14} {:<14} {:<9} {:<34} {:<16} {}",
            format_millis(row.changed_on, "%Y-%m-%d %H:%M"),
            project,
            row.entity_id,
            row.status,
            row.fingerprint,
            row.contributor,
            row.name,
        );
    }

    Ok(())
}

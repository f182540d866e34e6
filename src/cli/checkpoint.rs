//! Checkpoint commands
//!
//! Operator view of each project's audit checkpoint, and a way to move it
//! by hand (for example to replay the last few days on the next run).

use anyhow::{anyhow, Result};

use crate::detect::{days_before, format_millis, now_millis};
use crate::source::CheckpointStore;

pub async fn show(checkpoints: &dyn CheckpointStore, projects: &[String]) -> Result<()> {
    println!("{:<16} {:<16} {}", "Project", "Checkpoint", "UTC");
    println!("{}", "-".repeat(55));

    for project in projects {
        match checkpoints.get_checkpoint(project).await? {
            Some(at) => println!(
                "{:<16} {:<16} {}",
                project,
                at,
                format_millis(at, "%Y-%m-%d %H:%M:%S")
            ),
            None => println!("{:<16} {:<16} {}", project, "-", "never audited"),
        }
    }
    Ok(())
}

/// Set to `at` (epoch millis), or to `days` before now, or to now
pub async fn set(
    checkpoints: &dyn CheckpointStore,
    project: &str,
    at: Option<i64>,
    days: Option<f64>,
) -> Result<()> {
    let value = match (at, days) {
        (Some(at), _) => at,
        (None, Some(days)) => days_before(now_millis(), days)
            .ok_or_else(|| anyhow!("--days must be a non-negative number, got {days}"))?,
        (None, None) => now_millis(),
    };

    checkpoints.set_checkpoint(project, value).await?;
    println!(
        "Checkpoint for {} set to {} ({} UTC)",
        project,
        value,
        format_millis(value, "%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DAY_MS;
    use crate::source::mock::MockCheckpoints;

    #[tokio::test]
    async fn set_days_back_from_now() {
        let checkpoints = MockCheckpoints::new();
        let before = now_millis();
        set(&checkpoints, "syn0", None, Some(2.0)).await.unwrap();

        let value = checkpoints.value("syn0").unwrap();
        assert!(value <= before - 2 * DAY_MS + 1_000);
        assert!(value >= before - 2 * DAY_MS - 1_000);
    }

    #[tokio::test]
    async fn negative_days_are_refused_without_writing() {
        let checkpoints = MockCheckpoints::new();
        let err = set(&checkpoints, "syn0", None, Some(-1e300)).await.unwrap_err();

        assert!(err.to_string().contains("--days"));
        assert_eq!(checkpoints.value("syn0"), None);
    }
}

//! Markdown activity digest over the tracking table

use std::collections::HashMap;
use std::fmt::Write;

use super::{Bucket, Links};
use crate::detect::format_millis;
use crate::reconcile::TrackingRow;

/// Annotation used for the file type breakdown
const FILE_TYPE: &str = "fileType";

/// Per bucket: top contributors, top file types and the latest activity,
/// each cut to `limit` lines.
pub fn render_digest(rows: &[TrackingRow], buckets: &[Bucket], limit: usize, links: &Links) -> String {
    let mut out = String::new();

    for bucket in buckets {
        let mut members: Vec<&TrackingRow> =
            rows.iter().filter(|r| bucket.contains(r.changed_on)).collect();
        members.sort_by(|a, b| {
            b.changed_on
                .cmp(&a.changed_on)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let _ = writeln!(out, "### {}\n", bucket.label);
        if members.is_empty() {
            out.push_str("_No activity._\n\n");
            continue;
        }

        out.push_str("**Contributors**\n\n| Contributor | Changes |\n|---|---|\n");
        for (who, count) in top(members.iter().map(|r| r.contributor.as_str()), limit) {
            let _ = writeln!(out, "| {} | {} |", cell(who), count);
        }

        let file_types = members
            .iter()
            .filter_map(|r| r.annotations.get(FILE_TYPE))
            .map(String::as_str)
            .filter(|t| !t.is_empty());
        let file_types = top(file_types, limit);
        if !file_types.is_empty() {
            out.push_str("\n**fileTypes**\n\n| fileType | Changes |\n|---|---|\n");
            for (file_type, count) in file_types {
                let _ = writeln!(out, "| {} | {} |", cell(file_type), count);
            }
        }

        out.push_str("\n**Activity**\n\n| Entity | Id | Contributor | Change Time |\n|---|---|---|---|\n");
        for row in members.iter().take(limit) {
            let _ = writeln!(
                out,
                "| {} | [{}]({}) | {} | {} |",
                cell(&row.name),
                row.entity_id,
                links.entity(&row.entity_id),
                cell(&row.contributor),
                format_millis(row.changed_on, "%b/%d/%Y %H:%M"),
            );
        }
        out.push('\n');
    }

    out
}

/// Most frequent values first, ties broken alphabetically
fn top<'a>(values: impl Iterator<Item = &'a str>, limit: usize) -> Vec<(&'a str, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    counts.truncate(limit);
    counts
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

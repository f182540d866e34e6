//! Audit email body

use std::fmt::Write;

use super::Links;
use crate::detect::pool::ProjectFailure;
use crate::detect::{format_millis, ClassifiedEntity};

/// Render the audit email: a heading with the audit time, one table row per
/// entry, and a list of projects that could not be checked.
pub fn render_email(
    entries: &[&ClassifiedEntity],
    failures: &[ProjectFailure],
    audited_at: i64,
    links: &Links,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "<h4>Time of Audit: {} UTC</h4>",
        format_millis(audited_at, "%a %b %e %H:%M:%S %Y")
    );
    out.push_str(
        "<table border=1><tr>\
         <th>Project</th>\
         <th>Entity</th>\
         <th>Ver.</th>\
         <th>Type</th>\
         <th>Change Time</th>\
         <th>Contributor</th></tr>\n",
    );

    for entry in entries {
        let version = entry
            .entity
            .version
            .map(|v| v.to_string())
            .unwrap_or_default();
        let contributor = match entry.entity.changed_by.as_deref() {
            Some(principal) => format!(
                "<a href=\"{}\">{}</a>",
                escape_html(&links.profile(principal)),
                escape_html(&entry.contributor)
            ),
            None => escape_html(&entry.contributor),
        };
        let _ = writeln!(
            out,
            "<tr><td><a href=\"{}\">{}</a></td>\
             <td><a href=\"{}\">({})</a> {} </td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&links.entity(&entry.project_id)),
            escape_html(&entry.project_name),
            escape_html(&links.entity(&entry.entity.id)),
            escape_html(&entry.entity.id),
            escape_html(&entry.entity.name),
            version,
            escape_html(entry.entity.node_type.as_str()),
            entry.change_time(),
            contributor,
        );
    }
    out.push_str("</table>\n");

    if !failures.is_empty() {
        out.push_str("<h4>Projects not checked</h4>\n<ul>\n");
        for failure in failures {
            let _ = writeln!(
                out,
                "<li>{}: {} (after {} attempt{})</li>",
                escape_html(&failure.project_id),
                escape_html(&failure.error),
                failure.attempts,
                if failure.attempts == 1 { "" } else { "s" },
            );
        }
        out.push_str("</ul>\n");
    }

    out.push_str("</body>");
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

//! Notification delivery
//!
//! Delivery is best effort: a failed send is logged by the caller and never
//! undoes a committed merge.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Principal id of the recipient
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub content_type: String,
}

impl Message {
    pub fn html(recipient: String, subject: String, body: String) -> Self {
        Self {
            recipient,
            subject,
            body,
            content_type: "text/html".to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message, returning where it went
    async fn send(&self, message: &Message) -> Result<String>;
}

/// Writes each message as a file in a directory, for a mail relay (or a
/// person) to pick up.
pub struct OutboxNotifier {
    dir: PathBuf,
}

impl OutboxNotifier {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn file_name(message: &Message, id: &str) -> String {
        let ext = match message.content_type.as_str() {
            "text/html" => "html",
            "text/markdown" => "md",
            _ => "txt",
        };
        let recipient: String = message
            .recipient
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}-{}.{}", recipient, id, ext)
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, message: &Message) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating outbox {}", self.dir.display()))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.dir.join(Self::file_name(message, &id));
        let contents = format!(
            "To: {}\nSubject: {}\nContent-Type: {}\n\n{}",
            message.recipient, message.subject, message.content_type, message.body
        );
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn outbox_writes_one_file_per_message() {
        let dir = TempDir::new().unwrap();
        let outbox = OutboxNotifier::new(&dir.path().join("outbox"));
        let message = Message::html("100".into(), "Updated Synapse Files".into(), "<p>hi</p>".into());

        let first = outbox.send(&message).await.unwrap();
        let second = outbox.send(&message).await.unwrap();
        assert_ne!(first, second);
        assert!(first.ends_with(".html"));

        let written = std::fs::read_to_string(&first).unwrap();
        assert!(written.starts_with("To: 100\nSubject: Updated Synapse Files\nContent-Type: text/html\n\n"));
        assert!(written.ends_with("<p>hi</p>"));
    }

    #[test]
    fn recipient_is_sanitised_in_file_name() {
        let message = Message::html("../x y".into(), "s".into(), String::new());
        assert_eq!(OutboxNotifier::file_name(&message, "id"), "___x_y-id.html");
    }
}

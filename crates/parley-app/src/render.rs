//! Terminal rendering of republished assistant messages.
//!
//! The orchestrator republishes the whole message on every update; the
//! terminal can only append, so only the not-yet-printed tail is written.
//! A regenerated reply reuses its index but carries a new timestamp, so it
//! is tracked as a separate message.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_chat::{MessageUpdate, Republisher, UpdateKind};
use parley_core::types::Citation;

#[derive(Default)]
pub struct TerminalRenderer {
    printed: Mutex<HashMap<(Uuid, usize, DateTime<Utc>), usize>>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to append to the terminal for `update`.
    fn render(&self, update: &MessageUpdate) -> String {
        let Ok(mut printed) = self.printed.lock() else {
            return String::new();
        };
        let key = (update.conversation_id, update.index, update.message.timestamp);
        match update.kind {
            UpdateKind::Partial | UpdateKind::Final => {
                let content = &update.message.content;
                let done = printed.get(&key).copied().unwrap_or(0);
                let mut out = content.get(done..).unwrap_or("").to_string();
                printed.insert(key, content.len().max(done));
                if update.kind == UpdateKind::Final {
                    out.push('\n');
                }
                out
            }
            UpdateKind::Citations => update
                .message
                .citations
                .as_deref()
                .map(format_citations)
                .unwrap_or_default(),
        }
    }
}

impl Republisher for TerminalRenderer {
    fn republish(&self, update: MessageUpdate) {
        let text = self.render(&update);
        if text.is_empty() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush()) {
            tracing::warn!(error = %e, "Failed to write to terminal");
        }
    }
}

fn format_citations(citations: &[Citation]) -> String {
    let mut out = String::from("\nSources:\n");
    for (i, c) in citations.iter().enumerate() {
        match &c.page {
            Some(page) => out.push_str(&format!("  [{}] {} (p. {})\n", i + 1, c.file_name, page)),
            None => out.push_str(&format!("  [{}] {}\n", i + 1, c.file_name)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::types::Message;

    fn update(kind: UpdateKind, content: &str, id: Uuid) -> MessageUpdate {
        MessageUpdate {
            conversation_id: id,
            index: 1,
            kind,
            message: Message {
                content: content.to_string(),
                ..Message::assistant(Utc::now())
            },
        }
    }

    #[test]
    fn test_only_new_tail_is_rendered() {
        let r = TerminalRenderer::new();
        let id = Uuid::new_v4();
        assert_eq!(r.render(&update(UpdateKind::Partial, "Hel", id)), "Hel");
        assert_eq!(r.render(&update(UpdateKind::Partial, "Hello, wor", id)), "lo, wor");
        assert_eq!(r.render(&update(UpdateKind::Final, "Hello, world", id)), "ld\n");
    }

    #[test]
    fn test_messages_tracked_separately() {
        let r = TerminalRenderer::new();
        r.render(&update(UpdateKind::Partial, "first", Uuid::new_v4()));
        assert_eq!(
            r.render(&update(UpdateKind::Partial, "second", Uuid::new_v4())),
            "second"
        );
    }

    #[test]
    fn test_regenerated_reply_printed_in_full() {
        let r = TerminalRenderer::new();
        let id = Uuid::new_v4();
        let old = update(UpdateKind::Final, "The old, long first reply", id);
        assert_eq!(r.render(&old), "The old, long first reply\n");

        let mut partial = update(UpdateKind::Partial, "New", id);
        partial.message.timestamp = old.message.timestamp + chrono::Duration::seconds(5);
        let mut last = update(UpdateKind::Final, "New answer", id);
        last.message.timestamp = partial.message.timestamp;
        assert_eq!(r.render(&partial), "New");
        assert_eq!(r.render(&last), " answer\n");
    }

    #[test]
    fn test_citations_listed() {
        let r = TerminalRenderer::new();
        let mut u = update(UpdateKind::Citations, "answer", Uuid::new_v4());
        u.message.citations = Some(vec![
            Citation::file("a.pdf"),
            Citation {
                file_name: "b.pdf".into(),
                page: Some("4".into()),
                excerpt: None,
            },
        ]);
        let text = r.render(&u);
        assert!(text.contains("[1] a.pdf\n"));
        assert!(text.contains("[2] b.pdf (p. 4)"));
    }
}

//! Stream assembly: turns a chunked reply into throttled partial states.
//!
//! A partial is yielded for the first chunk and then at most once per
//! update interval. The final state is always yielded and always carries the
//! complete content. A read failure finalizes the reply with the error
//! suffix appended to whatever arrived.
//!
//! The backend may end the body with a usage record, a line starting with
//! [`USAGE_MARKER`] followed by JSON. The record, or any prefix of the marker
//! that might begin one, is never part of the visible content.

use std::sync::Arc;

use async_stream::stream;
use chrono::Duration;
use futures::{Stream, StreamExt};

use parley_core::config::StreamConfig;

use crate::backend::ChunkStream;
use crate::clock::Clock;

/// Start of the trailing usage record in a response body.
pub const USAGE_MARKER: &str = "\u{1e}usage:";

#[derive(Clone, Debug, PartialEq)]
pub enum StreamUpdate {
    Partial(String),
    Final(AssembledReply),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssembledReply {
    /// Visible reply text.
    pub content: String,
    /// Everything received, including any usage record.
    pub raw_body: String,
    /// Whether the stream failed before its end.
    pub interrupted: bool,
    pub chunks: usize,
}

pub struct StreamAssembler {
    clock: Arc<dyn Clock>,
    update_interval: Duration,
    error_suffix: String,
}

impl StreamAssembler {
    pub fn new(clock: Arc<dyn Clock>, config: &StreamConfig) -> Self {
        Self {
            clock,
            update_interval: Duration::milliseconds(config.update_interval_ms as i64),
            error_suffix: config.error_suffix.clone(),
        }
    }

    /// Consume `source`, yielding partial states followed by exactly one
    /// `Final`. Nothing is read until the returned stream is polled.
    pub fn consume(&self, mut source: ChunkStream) -> impl Stream<Item = StreamUpdate> + Send {
        let clock = self.clock.clone();
        let interval = self.update_interval;
        let error_suffix = self.error_suffix.clone();

        stream! {
            let mut raw = String::new();
            let mut chunks = 0usize;
            let mut last_publish = None;
            let mut interrupted = false;

            while let Some(item) = source.next().await {
                match item {
                    Ok(chunk) => {
                        raw.push_str(&chunk);
                        chunks += 1;
                        let now = clock.now();
                        let due = match last_publish {
                            None => true,
                            Some(last) => now - last >= interval,
                        };
                        if due {
                            last_publish = Some(now);
                            yield StreamUpdate::Partial(visible_content(&raw).to_string());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(chunks, error = %e, "Stream read failed, finalizing partial reply");
                        interrupted = true;
                        break;
                    }
                }
            }

            let mut content = visible_content(&raw).to_string();
            if interrupted {
                content.push_str(&error_suffix);
            }
            yield StreamUpdate::Final(AssembledReply {
                content,
                raw_body: raw,
                interrupted,
                chunks,
            });
        }
    }
}

/// Body text with the usage record, or a pending marker prefix, removed.
pub fn visible_content(raw: &str) -> &str {
    if let Some(pos) = raw.find(USAGE_MARKER) {
        return &raw[..pos];
    }
    // The marker is ASCII, so every prefix length is a char boundary.
    for len in (1..USAGE_MARKER.len()).rev() {
        if raw.ends_with(&USAGE_MARKER[..len]) {
            return &raw[..raw.len() - len];
        }
    }
    raw
}

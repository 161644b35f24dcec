//! Sink fan-out (spec §4.5-4.7). Every configured sink sees every
//! dispatched event; a failing sink is logged and never blocks its peers.

pub mod file;
pub mod remote;
pub mod stdout;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::metrics::Metrics;
use writetrace_common::WriteEvent;

#[async_trait]
pub trait Sink: Send + Sync {
    async fn handle(&self, event: &WriteEvent, metrics: &Arc<Metrics>);
}

pub struct SinkList {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkList {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub async fn dispatch(&self, event: &WriteEvent, metrics: &Arc<Metrics>) {
        metrics.record_event();
        for sink in &self.sinks {
            sink.handle(event, metrics).await;
        }
    }
}

/// The line shape every sink renders (spec §6 stdout/file format).
#[derive(Serialize)]
pub struct EventRecord {
    pub timestamp: u64,
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub fd: u32,
    pub count: u64,
    pub data: String,
}

impl EventRecord {
    pub fn from_event(event: &WriteEvent) -> Self {
        let data = render_data(trim_trailing_newlines(event.data_prefix()));
        EventRecord {
            timestamp: event.timestamp_ns,
            pid: event.pid,
            tid: event.tid,
            comm: event.comm_str().to_string(),
            fd: event.fd,
            count: event.count,
            data,
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn trim_trailing_newlines(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r') {
        end -= 1;
    }
    &bytes[..end]
}

/// Renders a captured write buffer losslessly (spec §4.4: never interpreted
/// as UTF-8, preserved byte-for-byte). ASCII-escapes every byte rather than
/// lossy-replacing invalid UTF-8 with U+FFFD, so a binary payload survives
/// intact instead of being mangled into an unrelated byte sequence.
pub fn render_data(bytes: &[u8]) -> String {
    String::from_utf8(bytes.escape_ascii().collect()).expect("escape_ascii output is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_newline_from_data() {
        let mut ev = WriteEvent::zeroed();
        ev.count = 6;
        ev.data[..6].copy_from_slice(b"hello\n");
        let record = EventRecord::from_event(&ev);
        assert_eq!(record.data, "hello");
    }

    #[test]
    fn escapes_invalid_utf8_instead_of_replacing_it() {
        let mut ev = WriteEvent::zeroed();
        ev.count = 4;
        ev.data[..4].copy_from_slice(&[0xFF, 0x00, b'a', 0xFE]);
        let record = EventRecord::from_event(&ev);
        assert_eq!(record.data, "\\xff\\x00a\\xfe");
        assert!(!record.data.contains('\u{FFFD}'));
    }
}

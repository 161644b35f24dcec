//! File sink with rotation (spec §4.6): `<path>`, `<path>.1`, `<path>.2`, …
//! capped at `max_backups`, oldest backup shifted first so renames never
//! clobber a not-yet-moved file.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{EventRecord, Sink};
use crate::config::DEFAULT_MAX_BACKUPS;
use crate::metrics::Metrics;
use writetrace_common::WriteEvent;

struct State {
    file: tokio::fs::File,
    records_written: u64,
}

pub struct FileSink {
    path: String,
    max_records_per_file: u64,
    max_backups: usize,
    state: Mutex<State>,
}

impl FileSink {
    pub async fn new(path: &str, max_records_per_file: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_string(),
            max_records_per_file,
            max_backups: DEFAULT_MAX_BACKUPS,
            state: Mutex::new(State {
                file,
                records_written: 0,
            }),
        })
    }

    async fn rotate(&self) -> std::io::Result<tokio::fs::File> {
        for n in (1..=self.max_backups).rev() {
            let from = format!("{}.{n}", self.path);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                if n + 1 > self.max_backups {
                    let _ = tokio::fs::remove_file(&from).await;
                } else {
                    let to = format!("{}.{}", self.path, n + 1);
                    tokio::fs::rename(&from, &to).await?;
                }
            }
        }
        tokio::fs::rename(&self.path, format!("{}.1", self.path)).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn handle(&self, event: &WriteEvent, metrics: &Arc<Metrics>) {
        let line = EventRecord::from_event(event).to_json_line();
        let mut state = self.state.lock().await;

        if state.records_written >= self.max_records_per_file {
            match self.rotate().await {
                Ok(fresh) => {
                    state.file = fresh;
                    state.records_written = 0;
                }
                Err(e) => {
                    metrics.record_sink_error();
                    warn!("file sink rotation failed for {}: {e}", self.path);
                }
            }
        }

        if let Err(e) = state.file.write_all(line.as_bytes()).await {
            metrics.record_sink_error();
            warn!("file sink write failed for {}: {e}", self.path);
            return;
        }
        if let Err(e) = state.file.write_all(b"\n").await {
            metrics.record_sink_error();
            warn!("file sink write failed for {}: {e}", self.path);
            return;
        }
        state.records_written += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileSink::new(path.to_str().unwrap(), 1000).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        sink.handle(&WriteEvent::zeroed(), &metrics).await;
        sink.handle(&WriteEvent::zeroed(), &metrics).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn rotates_after_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileSink::new(path.to_str().unwrap(), 2).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        for _ in 0..3 {
            sink.handle(&WriteEvent::zeroed(), &metrics).await;
        }

        let backup = format!("{}.1", path.to_str().unwrap());
        assert!(tokio::fs::try_exists(&backup).await.unwrap());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}

//! Bounded event pipeline (spec §5): the ring reader pushes decoded events
//! into a fixed-capacity channel with non-blocking, drop-on-full sends; the
//! dispatcher drains it and fans out to every configured sink.

use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::sinks::SinkList;
use writetrace_common::WriteEvent;

/// Channel depth between the ring reader and the dispatcher. Past this many
/// un-dispatched events, new ones are dropped rather than applying
/// backpressure to the kernel-facing reader.
pub const PIPELINE_CAPACITY: usize = 1024;

/// Cheap, cloneable handle for pushing events from the ring reader. Kept
/// separate from [`Pipeline`] so the reader thread can own one independently
/// of whoever holds the pipeline for shutdown.
#[derive(Clone)]
pub struct PipelineSender(mpsc::Sender<WriteEvent>);

impl PipelineSender {
    /// Pushes a decoded event, dropping it (and counting the drop) if the
    /// channel is full. Never blocks the caller.
    pub fn push(&self, event: WriteEvent, metrics: &Metrics) {
        match self.0.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics.record_drop();
                warn!("pipeline full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("pipeline dispatcher gone, dropping event");
            }
        }
    }
}

pub struct Pipeline {
    tx: mpsc::Sender<WriteEvent>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the dispatcher task and returns a handle for pushing events
    /// into it.
    pub fn spawn(sinks: Arc<SinkList>, metrics: Arc<Metrics>) -> Self {
        let (tx, mut rx) = mpsc::channel(PIPELINE_CAPACITY);

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sinks.dispatch(&event, &metrics).await;
            }
        });

        Self { tx, dispatcher }
    }

    /// A cloneable sender the ring reader can own independently of this
    /// `Pipeline` value.
    pub fn sender(&self) -> PipelineSender {
        PipelineSender(self.tx.clone())
    }

    /// Closes the send side and returns the dispatcher's join handle so the
    /// caller can await it with a bounded deadline, draining whatever was
    /// already queued.
    pub fn shutdown(self) -> tokio::task::JoinHandle<()> {
        drop(self.tx);
        self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::Sink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl Sink for CountingSink {
        async fn handle(&self, _event: &WriteEvent, _metrics: &Arc<Metrics>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn dispatches_to_every_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let sinks = Arc::new(SinkList::new(vec![Box::new(CountingSink(count.clone()))]));
        let metrics = Arc::new(Metrics::new());
        let pipeline = Pipeline::spawn(sinks, metrics.clone());
        let sender = pipeline.sender();

        sender.push(WriteEvent::zeroed(), &metrics);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}

use async_trait::async_trait;

use std::sync::Arc;

use super::{EventRecord, Sink};
use crate::metrics::Metrics;
use writetrace_common::WriteEvent;

pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn handle(&self, event: &WriteEvent, _metrics: &Arc<Metrics>) {
        println!("{}", EventRecord::from_event(event).to_json_line());
    }
}

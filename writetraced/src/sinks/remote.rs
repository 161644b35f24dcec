//! Remote push sink (spec §4.7): fire-and-forget Loki-style push over HTTP.
//! Never retries and never blocks the dispatcher beyond spawning the task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::json;

use super::{render_data, Sink};
use crate::metrics::Metrics;
use writetrace_common::WriteEvent;

pub struct RemoteSink {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteSink {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builds with a fixed timeout");
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Sink for RemoteSink {
    async fn handle(&self, event: &WriteEvent, metrics: &Arc<Metrics>) {
        let data = render_data(event.data_prefix());
        let body = json!({
            "streams": [{
                "stream": {
                    "app": "write-tracer",
                    "pid": event.pid.to_string(),
                    "comm": event.comm_str(),
                    "fd": event.fd.to_string(),
                },
                "values": [[event.timestamp_ns.to_string(), data]],
            }]
        });

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    metrics.record_sink_error();
                    warn!("remote push to {endpoint} returned {}", resp.status());
                }
                Err(e) => {
                    metrics.record_sink_error();
                    warn!("remote push to {endpoint} failed: {e}");
                }
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_with_fixed_timeout() {
        let _sink = RemoteSink::new("http://127.0.0.1:0/loki/api/v1/push");
    }
}

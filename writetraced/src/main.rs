use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;

use writetraced::api;
use writetraced::config::{self, Args, Config};
use writetraced::decoder;
use writetraced::loader;
use writetraced::metrics::{self, Metrics};
use writetraced::pipeline::Pipeline;
use writetraced::registry::PidRegistry;
use writetraced::sinks::file::FileSink;
use writetraced::sinks::remote::RemoteSink;
use writetraced::sinks::stdout::StdoutSink;
use writetraced::sinks::{Sink, SinkList};
use writetrace_common::KernelConfig;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(config::log_level().parse().unwrap_or(log::LevelFilter::Info));
    builder.init();

    let args = Args::parse();
    let cfg = match Config::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new());

    if cfg.metrics_port != 0 {
        let metrics = metrics.clone();
        let port = cfg.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port).await {
                warn!("metrics server exited: {e}");
            }
        });
        info!("metrics server listening on 0.0.0.0:{port}");
    }

    let kernel_cfg = KernelConfig::new(cfg.target_pid, &cfg.target_fds);
    let loaded = loader::load(&kernel_cfg).context("failed to load and attach probe")?;

    let registry = Arc::new(PidRegistry::new(loaded.tid_map));
    if cfg.target_pid != 0 {
        match registry.register(cfg.target_pid) {
            Ok(threads) => info!("tracking pid {} ({threads} threads)", cfg.target_pid),
            Err(e) => warn!("initial registration of pid {} failed: {e}", cfg.target_pid),
        }
    }

    spawn_liveness_monitor(registry.clone(), metrics.clone(), cfg.tracking_interval);

    if cfg.control_port != 0 {
        let registry = registry.clone();
        let port = cfg.control_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(registry, port).await {
                warn!("control API server exited: {e}");
            }
        });
        info!("control API listening on 127.0.0.1:{port}");
    }

    let sinks = build_sinks(&cfg).await?;
    let pipeline = Pipeline::spawn(Arc::new(sinks), metrics.clone());

    let mut events = loaded.events;
    let reader_metrics = metrics.clone();
    let sender = pipeline.sender();
    let reader = tokio::task::spawn_blocking(move || loop {
        match events.next() {
            Some(record) => match decoder::decode(record.as_ref()) {
                Ok(event) => sender.push(event, &reader_metrics),
                Err(e) => {
                    reader_metrics.record_decode_error();
                    warn!("dropping malformed ring record: {e}");
                }
            },
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received, draining pipeline");
    reader.abort();
    let dispatcher = pipeline.shutdown();
    if timeout(SHUTDOWN_DRAIN, dispatcher).await.is_err() {
        warn!("dispatcher did not drain within {SHUTDOWN_DRAIN:?}, shutting down anyway");
    }
    // `loaded.guard` drops here, detaching every probe in reverse order.
    drop(loaded.guard);
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

fn spawn_liveness_monitor<M>(registry: Arc<PidRegistry<M>>, metrics: Arc<Metrics>, interval: Duration)
where
    M: writetraced::registry::KernelTidMap + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dead = registry.sweep_dead();
            for pid in dead {
                info!("pid {pid} no longer exists, evicted from registry");
            }
            for process in registry.list() {
                if let Err(e) = registry.refresh_threads(process.parent_pid) {
                    warn!("refresh_threads({}) failed: {e}", process.parent_pid);
                }
            }
            metrics.set_tracked_pids(registry.list().len());
            match registry.kernel_tid_count() {
                Ok(n) => metrics.set_tracked_tids(n),
                Err(e) => warn!("failed to read kernel TID map for the gauge: {e}"),
            }
        }
    });
}

async fn build_sinks(cfg: &Config) -> Result<SinkList> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    if !cfg.silence_stdout {
        sinks.push(Box::new(StdoutSink));
    }

    if let Some(path) = &cfg.file_output_path {
        let sink = FileSink::new(path, cfg.max_records_per_file)
            .await
            .with_context(|| format!("opening file sink at {path}"))?;
        sinks.push(Box::new(sink));
    }

    if let Some(endpoint) = &cfg.remote_endpoint {
        sinks.push(Box::new(RemoteSink::new(endpoint)));
    }

    Ok(SinkList::new(sinks))
}

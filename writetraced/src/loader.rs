//! eBPF loader (spec §4.2): loads the compiled probe, instantiates its
//! three maps, attaches the three tracepoints, and seeds the kernel TID map
//! for the initial `--pid`. Every attach handle is released in reverse
//! order on any exit path via `Drop`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use aya::maps::{Array, HashMap as AyaHashMap, MapData, RingBuf};
use aya::programs::TracePoint;
use aya::{Ebpf, EbpfLoader as AyaEbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};

use crate::registry::KernelTidMap;
use writetrace_common::KernelConfig;

const BPF_PATH_ENV: &str = "WRITETRACE_BPF_PATH";
const BPF_PATH_CANDIDATES: &[&str] = &[
    "target/bpfel-unknown-none/release/writetrace-ebpf",
    "./target/bpfel-unknown-none/release/writetrace-ebpf",
    "/usr/local/share/writetrace/writetrace-ebpf",
];

/// Holds the loaded `Ebpf` object alive for as long as the probes must stay
/// attached. Dropping it detaches every program.
pub struct ProbeGuard {
    _bpf: Ebpf,
    _logger: Option<EbpfLogger>,
}

pub struct LoadedProbe {
    pub guard: ProbeGuard,
    pub events: RingBuf<MapData>,
    pub tid_map: AyaTidMap,
}

/// Thin `KernelTidMap` wrapper over the live `TRACKED_TIDS` hash map.
pub struct AyaTidMap {
    inner: std::sync::Mutex<AyaHashMap<MapData, u32, u8>>,
}

impl KernelTidMap for AyaTidMap {
    fn insert(&self, tid: u32) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .insert(tid, 1u8, 0)
            .map_err(|e| e.to_string())
    }

    fn remove(&self, tid: u32) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .remove(&tid)
            .map_err(|e| e.to_string())
    }

    fn tid_count(&self) -> Result<usize, String> {
        let inner = self.inner.lock().unwrap();
        let mut count = 0usize;
        for key in inner.keys() {
            key.map_err(|e| e.to_string())?;
            count += 1;
        }
        Ok(count)
    }
}

fn read_bpf_bytes() -> Result<Vec<u8>> {
    if let Ok(path) = std::env::var(BPF_PATH_ENV) {
        return std::fs::read(&path).with_context(|| format!("reading {path}"));
    }
    for candidate in BPF_PATH_CANDIDATES {
        if Path::new(candidate).exists() {
            return std::fs::read(candidate).with_context(|| format!("reading {candidate}"));
        }
    }
    Err(anyhow!(
        "writetrace-ebpf object not found; set {BPF_PATH_ENV} or build it with `cargo xtask build-ebpf`"
    ))
}

fn attach_tracepoint(bpf: &mut Ebpf, program: &str, category: &str, name: &str) -> Result<()> {
    let tp: &mut TracePoint = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("{program} program not found in the compiled object"))?
        .try_into()?;
    tp.load()?;
    tp.attach(category, name)
        .with_context(|| format!("attaching {program} to {category}:{name}"))?;
    Ok(())
}

/// Loads the probe object, writes `cfg` into the config map, attaches all
/// three tracepoints, and (if `target_pid != 0`) enrolls every thread under
/// `/proc/<target_pid>/task`.
pub fn load(cfg: &KernelConfig) -> Result<LoadedProbe> {
    let bytes = read_bpf_bytes()?;
    let mut bpf = AyaEbpfLoader::new().load(&bytes)?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => Some(logger),
        Err(e) => {
            warn!("BPF logger not active: {e}");
            None
        }
    };

    {
        let config_map = bpf
            .map_mut("CONFIG")
            .ok_or_else(|| anyhow!("CONFIG map not found"))?;
        let mut config_map: Array<_, KernelConfig> = Array::try_from(config_map)?;
        config_map.set(0, *cfg, 0)?;
    }

    let attach_result = (|| -> Result<()> {
        attach_tracepoint(&mut bpf, "sys_enter_write", "syscalls", "sys_enter_write")?;
        attach_tracepoint(&mut bpf, "sched_process_fork", "sched", "sched_process_fork")?;
        attach_tracepoint(&mut bpf, "sched_process_exit", "sched", "sched_process_exit")?;
        Ok(())
    })();

    if let Err(e) = attach_result {
        // bpf is dropped here, detaching whatever did attach in reverse order.
        return Err(e.context("failed to attach probe; aborting startup"));
    }

    let tid_map_data = bpf
        .take_map("TRACKED_TIDS")
        .ok_or_else(|| anyhow!("TRACKED_TIDS map not found"))?;
    let tid_map = AyaTidMap {
        inner: std::sync::Mutex::new(AyaHashMap::try_from(tid_map_data)?),
    };

    let events_map = bpf
        .take_map("EVENTS")
        .ok_or_else(|| anyhow!("EVENTS map not found"))?;
    let events = RingBuf::try_from(events_map)?;

    if cfg.target_pid != 0 {
        seed_initial_pid(&tid_map, cfg.target_pid);
    }

    info!("probe loaded and attached");
    Ok(LoadedProbe {
        guard: ProbeGuard {
            _bpf: bpf,
            _logger: logger,
        },
        events,
        tid_map,
    })
}

fn seed_initial_pid(tid_map: &AyaTidMap, pid: u32) {
    let dir = match std::fs::read_dir(format!("/proc/{pid}/task")) {
        Ok(dir) => dir,
        Err(e) => {
            warn!("initial enrollment of pid {pid} failed: {e}");
            return;
        }
    };
    for entry in dir.flatten() {
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            if let Err(e) = tid_map.insert(tid) {
                warn!("failed to seed tid {tid} for pid {pid}: {e}");
            }
        }
    }
}

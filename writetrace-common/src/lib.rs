#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Wire-format types shared between the kernel probe (`writetrace-ebpf`) and
//! the user-space daemon (`writetraced`). Everything here is `#[repr(C)]`
//! and `Pod`, so it can be copied byte-for-byte across the kernel/user-space
//! boundary without an intermediate serialization step.

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

/// Maximum number of FDs the kernel-side filter can hold.
pub const MAX_TARGET_FDS: usize = 64;

/// Bytes captured from the start of the write buffer, regardless of `count`.
pub const MAX_CAPTURED_DATA: usize = 256;

/// Length of the `comm` (task name) field copied from `task_struct`.
pub const COMM_LEN: usize = 16;

/// Size in bytes of [`WriteEvent`] on the wire. Fixed regardless of `count`.
pub const WRITE_EVENT_WIRE_SIZE: usize = 304;

/// Max number of threads the kernel-side tracked-TID set can hold.
pub const MAX_TRACKED_TIDS: u32 = 10_240;

/// Config mirrored into the kernel side. Exactly mirrors `Config`'s tracing
/// inputs: which process to follow, and which FDs to keep.
///
/// The filter uses `target_fds[0..num_fds)` only when `num_fds > 0`; an empty
/// list means "all FDs".
#[repr(C, align(8))]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    pub target_pid: u32,
    pub num_fds: u32,
    pub target_fds: [u32; MAX_TARGET_FDS],
}

impl KernelConfig {
    pub const fn zeroed() -> Self {
        Self {
            target_pid: 0,
            num_fds: 0,
            target_fds: [0; MAX_TARGET_FDS],
        }
    }

    /// Build a `KernelConfig` from a target pid and an ordered FD list.
    /// Truncates silently past `MAX_TARGET_FDS`; callers validate length
    /// earlier (see `writetraced::config`).
    pub fn new(target_pid: u32, fds: &[u32]) -> Self {
        let mut target_fds = [0u32; MAX_TARGET_FDS];
        let n = fds.len().min(MAX_TARGET_FDS);
        target_fds[..n].copy_from_slice(&fds[..n]);
        Self {
            target_pid,
            num_fds: n as u32,
            target_fds,
        }
    }
}

/// A single captured `write(2)` invocation, exactly as laid out on the wire
/// (see spec §3 for the byte offsets). `repr(C, align(8))` with this field
/// order reproduces that layout with no implicit padding: two `u64`s, four
/// `u32`s, then the two byte arrays.
#[repr(C, align(8))]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WriteEvent {
    /// Kernel monotonic timestamp, nanoseconds.
    pub timestamp_ns: u64,
    /// Byte count the syscall was invoked with (may exceed captured data).
    pub count: u64,
    /// Thread-group id (what userspace calls the process id).
    pub pid: u32,
    /// Thread id.
    pub tid: u32,
    pub fd: u32,
    /// Explicit padding, must be zero; keeps the layout identical on both sides.
    pub _padding: u32,
    /// NUL-padded ASCII task name.
    pub comm: [u8; COMM_LEN],
    /// First `min(count, 256)` bytes of the user buffer.
    pub data: [u8; MAX_CAPTURED_DATA],
}

#[cfg(test)]
const _: () = {
    assert!(size_of::<WriteEvent>() == WRITE_EVENT_WIRE_SIZE);
};

impl WriteEvent {
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            count: 0,
            pid: 0,
            tid: 0,
            fd: 0,
            _padding: 0,
            comm: [0; COMM_LEN],
            data: [0; MAX_CAPTURED_DATA],
        }
    }

    /// Number of captured payload bytes prior to trimming, per the
    /// bounded-payload invariant: `len(data) = min(count, 256)`.
    pub fn captured_len(&self) -> usize {
        (self.count as usize).min(MAX_CAPTURED_DATA)
    }

    /// The captured prefix of the write buffer, not yet trimmed of trailing
    /// newlines (decoding is the decoder's job, not the wire type's).
    pub fn data_prefix(&self) -> &[u8] {
        &self.data[..self.captured_len()]
    }

    /// `comm`, trimmed of its trailing NUL padding.
    pub fn comm_str(&self) -> &str {
        let end = self.comm.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        core::str::from_utf8(&self.comm[..end]).unwrap_or("")
    }
}

#[cfg(all(feature = "user", test))]
mod tests {
    use super::*;

    #[test]
    fn kernel_config_truncates_past_max_fds() {
        let fds: Vec<u32> = (0..200).collect();
        let cfg = KernelConfig::new(7, &fds);
        assert_eq!(cfg.num_fds as usize, MAX_TARGET_FDS);
        assert_eq!(cfg.target_pid, 7);
    }

    #[test]
    fn write_event_captured_len_bounds_to_256() {
        let mut ev = WriteEvent::zeroed();
        ev.count = 8192;
        assert_eq!(ev.captured_len(), MAX_CAPTURED_DATA);
        ev.count = 6;
        assert_eq!(ev.captured_len(), 6);
    }

    #[test]
    fn comm_str_trims_nul_padding() {
        let mut ev = WriteEvent::zeroed();
        ev.comm[..4].copy_from_slice(b"cat\0");
        assert_eq!(ev.comm_str(), "cat");
    }

    #[test]
    fn kernel_config_round_trips_through_json() {
        let cfg = KernelConfig::new(42, &[3, 4, 5]);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: KernelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target_pid, 42);
        assert_eq!(back.num_fds, 3);
        assert_eq!(&back.target_fds[..3], &[3, 4, 5]);
    }
}

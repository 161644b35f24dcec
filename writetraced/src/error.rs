//! Error taxonomy (spec §7). Fatal errors (`ConfigError`, `LoadError`) abort
//! startup; registry errors are surfaced to the control API caller as HTTP
//! status codes; per-event errors (`DecodeError`, `SinkError`) are logged and
//! never terminate the pipeline.

use std::fmt;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by [`crate::registry::PidRegistry`] operations.
#[derive(Debug)]
pub enum RegistryError {
    AlreadyRegistered(u32),
    NotRegistered(u32),
    ProcessNotFound(u32),
    KernelMap(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(pid) => write!(f, "pid {pid} is already registered"),
            RegistryError::NotRegistered(pid) => write!(f, "pid {pid} is not registered"),
            RegistryError::ProcessNotFound(pid) => write!(f, "pid {pid} not found in /proc"),
            RegistryError::KernelMap(msg) => write!(f, "kernel map error: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Ring-record decode failures. Always non-fatal: the reader logs and
/// continues with the next record.
#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

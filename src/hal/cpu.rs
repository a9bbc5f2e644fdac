use std::path::Path;

use crate::core::{FlowError, Result};
use crate::hal::DeviceKind;
use crate::memory::{CopyKind, MemoryBackend, MemoryUsage};

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Zeroed host allocation that reports failure instead of aborting
pub(crate) fn host_alloc(size: usize) -> Option<Box<[u8]>> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(size).ok()?;
    bytes.resize(size, 0);
    Some(bytes.into_boxed_slice())
}

pub(crate) fn checked_copy(dest: &mut [u8], src: &[u8]) -> Result<()> {
    if dest.len() < src.len() {
        return Err(FlowError::invalid(format!(
            "copy of {} bytes into {} bytes",
            src.len(),
            dest.len()
        )));
    }
    dest[..src.len()].copy_from_slice(src);
    Ok(())
}

/// Host memory backend
#[derive(Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryBackend for CpuBackend {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn mem_alloc(&self, size: usize) -> Option<Box<[u8]>> {
        host_alloc(size)
    }

    fn copy(&self, dest: &mut [u8], src: &[u8], _kind: CopyKind) -> Result<()> {
        checked_copy(dest, src)
    }

    fn usage(&self) -> Result<MemoryUsage> {
        let content = std::fs::read_to_string(Path::new(MEMINFO_PATH))
            .map_err(|e| FlowError::fault(format!("failed to read {MEMINFO_PATH}: {e}")))?;
        parse_meminfo(&content)
    }
}

/// Parses `MemTotal`/`MemAvailable` out of a meminfo-formatted string
pub(crate) fn parse_meminfo(content: &str) -> Result<MemoryUsage> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let slot = match key {
            "MemTotal:" => &mut total_kb,
            "MemAvailable:" => &mut available_kb,
            _ => continue,
        };
        *slot = Some(value.parse::<u64>().map_err(|_| {
            FlowError::fault(format!("expected integer kB value for {key}, got '{value}'"))
        })?);

        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    let total = total_kb.ok_or_else(|| FlowError::fault("MemTotal not found"))?;
    let free = available_kb.ok_or_else(|| FlowError::fault("MemAvailable not found"))?;
    Ok(MemoryUsage {
        free: free * 1024,
        total: total * 1024,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:        3884296 kB\nMemFree:          210040 kB\nMemAvailable:    2712344 kB\n";
        let usage = parse_meminfo(content).unwrap();
        assert_eq!(usage.total, 3884296 * 1024);
        assert_eq!(usage.free, 2712344 * 1024);
    }

    #[test]
    fn test_parse_meminfo_missing_field() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_err());
    }
}

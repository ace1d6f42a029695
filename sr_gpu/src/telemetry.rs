use std::io::ErrorKind;

use tokio::process::Command;

use crate::{MIB, ResourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Source of live accelerator memory readings.
pub trait MemoryTelemetry {
    /// Current memory state, or `None` when there is no accelerator to
    /// measure (CPU-only host).
    fn snapshot(
        &self,
    ) -> impl Future<Output = Result<Option<MemorySnapshot>, ResourceError>>;
}

/// Reads memory from `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
    device: u32,
}

impl NvidiaSmi {
    pub fn new(program: impl Into<String>, device: u32) -> Self {
        Self {
            program: program.into(),
            device,
        }
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi", 0)
    }
}

impl MemoryTelemetry for NvidiaSmi {
    async fn snapshot(&self) -> Result<Option<MemorySnapshot>, ResourceError> {
        let output = match Command::new(&self.program)
            .arg("--query-gpu=memory.total,memory.used,memory.free")
            .arg("--format=csv,noheader,nounits")
            .arg(format!("--id={}", self.device))
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{} not found, assuming no accelerator", self.program);
                return Ok(None);
            }
            Err(e) => {
                return Err(ResourceError::Telemetry(format!(
                    "failed to run {}: {e}",
                    self.program
                )));
            }
        };

        if !output.status.success() {
            // installed but no driver or no device
            tracing::warn!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }
}

/// Parse `total, used, free` in MiB as printed by
/// `nvidia-smi --query-gpu=memory.total,memory.used,memory.free --format=csv,noheader,nounits`.
///
/// Only the first line is read; the query is already scoped to one device.
///
/// # Errors
/// Returns `ResourceError::Telemetry` if the line does not hold three
/// integers.
pub fn parse_nvidia_smi(output: &str) -> Result<MemorySnapshot, ResourceError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ResourceError::Telemetry("empty nvidia-smi output".to_string()))?;

    let values = line
        .split(',')
        .map(|field| field.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ResourceError::Telemetry(format!("unexpected nvidia-smi line {line:?}: {e}"))
        })?;

    match values.as_slice() {
        [total, used, free] => Ok(MemorySnapshot {
            total_bytes: total * MIB,
            used_bytes: used * MIB,
            free_bytes: free * MIB,
        }),
        _ => Err(ResourceError::Telemetry(format!(
            "expected 3 fields in nvidia-smi line {line:?}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let snapshot = parse_nvidia_smi("24576, 1024, 23552\n").unwrap();
        assert_eq!(
            snapshot,
            MemorySnapshot {
                total_bytes: 24576 * MIB,
                used_bytes: 1024 * MIB,
                free_bytes: 23552 * MIB,
            }
        );
    }

    #[test]
    fn test_parse_nvidia_smi_first_device_only() {
        let snapshot =
            parse_nvidia_smi("\n8192, 100, 8092\n16384, 0, 16384\n").unwrap();
        assert_eq!(snapshot.total_bytes, 8192 * MIB);
    }

    #[test]
    fn test_parse_nvidia_smi_rejects_garbage() {
        assert!(parse_nvidia_smi("").is_err());
        assert!(parse_nvidia_smi("[N/A], 10, 20").is_err());
        assert!(parse_nvidia_smi("10, 20").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_means_no_accelerator() {
        let telemetry = NvidiaSmi::new("storyreel-no-such-nvidia-smi", 0);
        assert_eq!(telemetry.snapshot().await.unwrap(), None);
    }
}

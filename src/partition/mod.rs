//! Volume Manager: partition create/remove against local disks
//!
//! Shells out to the `parted` command-line utility. Both operations are
//! idempotent (create-if-absent, delete-if-present) so a pass can be retried
//! after a partial failure. The partitioning tool corrupts on-disk state when
//! invoked concurrently for the same device; callers serialize all invocations
//! through a single worker lane (see the controller module).
//!
//! Model: a StorageVolume claims its target device wholly. The claimed region
//! is partition 1, starting at 1MiB for alignment.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// First-partition start offset, 1MiB for alignment
const PARTITION_START_BYTES: u64 = 1 << 20;

// =============================================================================
// Partitioner Port
// =============================================================================

/// Port for disk partition operations.
///
/// Implementations mutate physical disk layout; the mutation is irreversible
/// without another explicit operation.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Create the volume partition on `device`, sized to `size_bytes`.
    /// Succeeds without side effects if the partition already exists.
    async fn create_partition(&self, device: &str, size_bytes: u64) -> Result<()>;

    /// Remove the volume partition from `device`.
    /// Succeeds without side effects if the partition is already absent.
    async fn delete_partition(&self, device: &str) -> Result<()>;
}

// =============================================================================
// Partition Handle
// =============================================================================

/// A claimed region of a physical device, as reported by the partition table.
/// Valid only for the duration of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    pub number: u32,
    pub start_bytes: u64,
    pub end_bytes: u64,
    pub size_bytes: u64,
}

// =============================================================================
// PartedTool
// =============================================================================

/// Partitioner backed by the `parted` binary.
pub struct PartedTool {
    parted_path: PathBuf,
}

impl PartedTool {
    pub fn new(parted_path: impl Into<PathBuf>) -> Self {
        Self {
            parted_path: parted_path.into(),
        }
    }

    /// Run parted in script mode and capture stdout. Non-zero exit surfaces
    /// stderr as the failure message.
    async fn run(&self, operation: &str, device: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.parted_path)
            .arg("-s")
            .arg(device)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::partition_op(operation, device, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Current partitions on `device`, or `None` when the disk carries no
    /// partition table at all.
    async fn partitions(&self, device: &str) -> Result<Option<Vec<PartitionHandle>>> {
        let output = Command::new(&self.parted_path)
            .args(["-s", "-m", device, "unit", "B", "print"])
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("unrecognised disk label") {
                return Ok(None);
            }
            return Err(Error::partition_op("print", device, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_partitions(&stdout)
            .map(Some)
            .map_err(|message| Error::PartitionTableParse {
                device: device.to_string(),
                message,
            })
    }
}

#[async_trait]
impl Partitioner for PartedTool {
    async fn create_partition(&self, device: &str, size_bytes: u64) -> Result<()> {
        match self.partitions(device).await? {
            Some(parts) if parts.iter().any(|p| p.number == 1) => {
                // Redelivery after a crash between mkpart and status update
                debug!(device, "Partition already present, create is a no-op");
                return Ok(());
            }
            Some(_) => {}
            None => {
                info!(device, "No partition table, writing GPT label");
                self.run("mklabel", device, &["mklabel", "gpt"]).await?;
            }
        }

        let start = PARTITION_START_BYTES;
        let end = start + size_bytes;
        let start_arg = format!("{}B", start);
        let end_arg = format!("{}B", end);
        info!(device, size_bytes, "Creating partition");
        self.run(
            "mkpart",
            device,
            &["mkpart", "primary", &start_arg, &end_arg],
        )
        .await?;
        Ok(())
    }

    async fn delete_partition(&self, device: &str) -> Result<()> {
        match self.partitions(device).await? {
            Some(parts) if parts.iter().any(|p| p.number == 1) => {
                info!(device, "Removing partition");
                self.run("rm", device, &["rm", "1"]).await?;
                Ok(())
            }
            _ => {
                // Missing-on-disk is not an error
                debug!(device, "Partition already absent, delete is a no-op");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

/// Parse `parted -s -m <dev> unit B print` machine-readable output.
///
/// Format: a "BYT;" header, one device summary line, then one line per
/// partition: `number:startB:endB:sizeB:fs:name:flags;`
fn parse_partitions(output: &str) -> std::result::Result<Vec<PartitionHandle>, String> {
    let mut handles = Vec::new();

    for line in output.lines().skip(2) {
        let line = line.trim().trim_end_matches(';');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            return Err(format!("short partition line: {:?}", line));
        }
        let number = fields[0]
            .parse()
            .map_err(|_| format!("bad partition number in {:?}", line))?;
        handles.push(PartitionHandle {
            number,
            start_bytes: parse_byte_field(fields[1], line)?,
            end_bytes: parse_byte_field(fields[2], line)?,
            size_bytes: parse_byte_field(fields[3], line)?,
        });
    }

    Ok(handles)
}

fn parse_byte_field(field: &str, line: &str) -> std::result::Result<u64, String> {
    field
        .strip_suffix('B')
        .unwrap_or(field)
        .parse()
        .map_err(|_| format!("bad byte value {:?} in {:?}", field, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "BYT;\n\
        /dev/sdb:21474836480B:scsi:512:512:gpt:QEMU HARDDISK:;\n\
        1:1048576B:10738466815B:10737418240B:ext4::;\n";

    const EMPTY_TABLE: &str = "BYT;\n\
        /dev/sdb:21474836480B:scsi:512:512:gpt:QEMU HARDDISK:;\n";

    #[test]
    fn test_parse_partitions() {
        let parts = parse_partitions(SAMPLE).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0],
            PartitionHandle {
                number: 1,
                start_bytes: 1048576,
                end_bytes: 10738466815,
                size_bytes: 10737418240,
            }
        );
    }

    #[test]
    fn test_parse_empty_table() {
        assert!(parse_partitions(EMPTY_TABLE).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let garbage = "BYT;\n/dev/sdb:1B:scsi:512:512:gpt::;\nnot-a-partition\n";
        assert!(parse_partitions(garbage).is_err());
    }
}

//! Block device preparation for the install pipeline: device inspection,
//! volume deactivation, partitioning, formatting, mounting and dumping the
//! install payload. Everything here shells out to the standard tooling
//! (`lsblk`, `sgdisk`, `mkfs.*`, `mount`) rather than reimplementing it.

use std::process::Command;

use anyhow::{anyhow, bail, ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use ukinstall_utils::CommandRunExt;

/// File name the cloud config payload is installed under on the OEM
/// partition.
pub const CLOUD_CONFIG_NAME: &str = "90_custom.yaml";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One block device as reported by `lsblk`.
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel device name (without `/dev/`).
    pub name: String,
    /// Device type: `disk`, `part`, `loop`, ...
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    /// Full device node path.
    pub path: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Filesystem label, if formatted.
    pub label: Option<String>,
    /// Filesystem type, if formatted.
    pub fstype: Option<String>,
    /// Mount point, if currently mounted.
    pub mountpoint: Option<String>,
    /// Child devices (partitions, holders).
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// Whether this is a whole disk (as opposed to a partition or a
    /// device-mapper construct).
    pub fn is_disk(&self) -> bool {
        matches!(self.devtype.as_deref(), Some("disk") | Some("loop"))
    }

    /// Whether the device or any of its children is currently mounted.
    pub fn has_mounts(&self) -> bool {
        if self.mountpoint.is_some() {
            return true;
        }
        self.children
            .iter()
            .flatten()
            .any(|child| child.has_mounts())
    }
}

/// Query `lsblk` for a single device.
#[context("Listing device {dev}")]
pub fn list_device(dev: &Utf8Path) -> Result<Device> {
    let mut devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    let dev = devs
        .blockdevices
        .drain(..)
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))?;
    Ok(dev)
}

/// Tear down device-mapper and LVM state referencing the target disk, so
/// that partitioning does not race against stale volumes.
#[context("Deactivating volumes on {device}")]
pub fn deactivate_volumes(device: &Utf8Path) -> Result<()> {
    Command::new("blkdeactivate")
        .args(["--lvmoptions", "retry,wholevg", "--dmoptions", "force,retry", "--errors"])
        .arg(device)
        .log_debug()
        .run_capture_stderr()
}

/// Filesystem to format a partition with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    /// FAT32; required for the EFI system partition.
    Vfat,
    /// ext4; used for data partitions.
    Ext4,
}

impl FsKind {
    fn mkfs_command(&self, label: &str, node: &Utf8Path) -> Command {
        match self {
            FsKind::Vfat => {
                let mut c = Command::new("mkfs.vfat");
                c.args(["-F", "32", "-n", label]).arg(node);
                c
            }
            FsKind::Ext4 => {
                let mut c = Command::new("mkfs.ext4");
                c.args(["-F", "-L", label]).arg(node);
                c
            }
        }
    }

    /// The `-t` argument passed to `mount`.
    pub fn mount_type(&self) -> &'static str {
        match self {
            FsKind::Vfat => "vfat",
            FsKind::Ext4 => "ext4",
        }
    }

    fn gpt_type_code(&self) -> &'static str {
        // EF00 is the ESP GUID; everything else is plain linux data.
        match self {
            FsKind::Vfat => "EF00",
            FsKind::Ext4 => "8300",
        }
    }
}

/// A partition to create on the target disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    /// GPT partition name and filesystem label.
    pub label: String,
    /// Size in MiB. Only the last partition may omit this to take the
    /// remainder of the disk.
    #[serde(default)]
    pub size_mib: Option<u64>,
    /// Filesystem to create.
    pub fs: FsKind,
    /// Where the partition gets mounted during the install.
    pub mount_point: Utf8PathBuf,
}

/// A created partition together with its device node.
#[derive(Debug, Clone)]
pub struct FormattedPartition {
    /// Device node, e.g. `/dev/vda1`.
    pub node: Utf8PathBuf,
    /// The request this partition was created from.
    pub spec: PartitionSpec,
}

/// Device node for 1-based partition `index` on `device`.
///
/// Devices whose name ends in a digit (nvme0n1, mmcblk0, loop0) take a `p`
/// separator before the partition number.
pub fn partition_node(device: &Utf8Path, index: usize) -> Utf8PathBuf {
    let name = device.as_str();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{name}p{index}").into()
    } else {
        format!("{name}{index}").into()
    }
}

fn sgdisk_new_args(index: usize, part: &PartitionSpec) -> Vec<String> {
    let size = match part.size_mib {
        Some(mib) => format!("{index}:0:+{mib}M"),
        // 0 as the end sector means "rest of the disk"
        None => format!("{index}:0:0"),
    };
    vec![
        "-n".into(),
        size,
        "-t".into(),
        format!("{index}:{}", part.fs.gpt_type_code()),
        "-c".into(),
        format!("{index}:{}", part.label),
    ]
}

fn validate_layout(partitions: &[PartitionSpec]) -> Result<()> {
    ensure!(!partitions.is_empty(), "no partitions requested");
    for (i, part) in partitions.iter().enumerate() {
        if part.size_mib.is_none() && i + 1 != partitions.len() {
            bail!(
                "partition {} has no size but is not the last partition",
                part.label
            );
        }
    }
    Ok(())
}

/// Write a fresh GPT label to `device` containing `partitions` in order,
/// then format each one. Destroys everything previously on the disk.
#[context("Partitioning {device}")]
pub fn partition_and_format(
    device: &Utf8Path,
    partitions: &[PartitionSpec],
) -> Result<Vec<FormattedPartition>> {
    validate_layout(partitions)?;

    Command::new("wipefs")
        .arg("-a")
        .arg(device)
        .log_debug()
        .run_capture_stderr()?;

    let mut sgdisk = Command::new("sgdisk");
    sgdisk.arg("--zap-all");
    for (i, part) in partitions.iter().enumerate() {
        sgdisk.args(sgdisk_new_args(i + 1, part));
    }
    sgdisk.arg(device);
    sgdisk.log_debug().run_capture_stderr()?;

    // Give the kernel a chance to pick up the new table before mkfs.
    let _ = Command::new("partprobe").arg(device).log_debug().run_capture_stderr();
    let _ = Command::new("udevadm").arg("settle").log_debug().run_capture_stderr();

    let mut created = Vec::with_capacity(partitions.len());
    for (i, part) in partitions.iter().enumerate() {
        let node = partition_node(device, i + 1);
        part.fs
            .mkfs_command(&part.label, &node)
            .log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Formatting {node}"))?;
        created.push(FormattedPartition {
            node,
            spec: part.clone(),
        });
    }
    Ok(created)
}

#[context("Mounting {node} at {target}")]
fn mount_one(node: &Utf8Path, fs: FsKind, target: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
    Command::new("mount")
        .args(["-t", fs.mount_type()])
        .arg(node)
        .arg(target)
        .log_debug()
        .run_capture_stderr()
}

/// Mount every partition at its configured mount point, in order.
pub fn mount_partitions(partitions: &[FormattedPartition]) -> Result<()> {
    for part in partitions {
        mount_one(&part.node, part.spec.fs, &part.spec.mount_point)?;
    }
    Ok(())
}

/// Unmount every partition, in reverse mount order.
pub fn unmount_partitions(partitions: &[FormattedPartition]) -> Result<()> {
    for part in partitions.iter().rev() {
        let target = &part.spec.mount_point;
        Command::new("umount")
            .arg(target)
            .log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Unmounting {target}"))?;
    }
    Ok(())
}

fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<u64> {
    let mut total = 0;
    for entry in src
        .read_dir_utf8()
        .with_context(|| format!("Reading {src}"))?
    {
        let entry = entry.with_context(|| format!("Reading {src}"))?;
        let ftype = entry.file_type().with_context(|| format!("stat {}", entry.path()))?;
        let target = dst.join(entry.file_name());
        if ftype.is_dir() {
            std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
            total += copy_tree(entry.path(), &target)?;
        } else if ftype.is_file() {
            total += std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Copying {} to {target}", entry.path()))?;
        } else {
            // Symlinks and special files have no representation on a FAT
            // filesystem and nothing we ship needs them.
            bail!("Unsupported file type at {}", entry.path());
        }
    }
    Ok(total)
}

/// Copy the install source into `mount_point`, returning the number of
/// bytes written. A directory source is copied recursively, preserving its
/// relative layout; a single file is copied under its base name.
#[context("Dumping {source} to {mount_point}")]
pub fn dump_source(mount_point: &Utf8Path, source: &Utf8Path) -> Result<u64> {
    let meta = source
        .metadata()
        .with_context(|| format!("stat {source}"))?;
    if meta.is_dir() {
        copy_tree(source, mount_point)
    } else {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("Source {source} has no file name"))?;
        std::fs::copy(source, mount_point.join(name)).map_err(Into::into)
    }
}

/// Install the cloud config payload into the OEM partition.
#[context("Copying cloud config {payload}")]
pub fn copy_cloud_config(oem_mount: &Utf8Path, payload: &Utf8Path) -> Result<()> {
    let target = oem_mount.join(CLOUD_CONFIG_NAME);
    std::fs::copy(payload, &target).with_context(|| format!("Copying to {target}"))?;
    tracing::debug!("Installed cloud config at {target}");
    Ok(())
}

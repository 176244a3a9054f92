//! Types describing an install job.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use ukinstall_storage::{FsKind, PartitionSpec};

/// Immutable description of one install job. Owned by the caller and read
/// only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallSpec {
    /// Target block device, e.g. `/dev/vda`. Everything on it is destroyed.
    pub device: Utf8PathBuf,
    /// Install source: a directory tree (or single file) dumped onto the
    /// EFI system partition.
    pub source: Utf8PathBuf,
    /// Optional cloud config payload installed into the OEM partition.
    #[serde(default)]
    pub cloud_init: Option<Utf8PathBuf>,
    /// Boot entries whose kernel command line contains any of these
    /// substrings are removed instead of activated. Checked in order; the
    /// first match wins.
    #[serde(default)]
    pub skip_entries: Vec<String>,
    /// Partitions to create on the target, EFI system partition first.
    #[serde(default)]
    pub partitions: PartitionSet,
}

/// The partition layout for an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSet {
    /// The EFI system partition; the install source and boot entries live
    /// here.
    pub efi: PartitionSpec,
    /// OEM configuration partition, target of the cloud config payload.
    #[serde(default)]
    pub oem: Option<PartitionSpec>,
    /// Writable state partition taking the rest of the disk.
    #[serde(default)]
    pub persistent: Option<PartitionSpec>,
}

impl Default for PartitionSet {
    fn default() -> Self {
        Self {
            efi: PartitionSpec {
                label: "EFI".into(),
                // Needs room for at least two slots worth of UKIs
                size_mib: Some(1024),
                fs: FsKind::Vfat,
                mount_point: Utf8PathBuf::from(RUN_MOUNTS).join("efi"),
            },
            oem: Some(PartitionSpec {
                label: "OEM".into(),
                size_mib: Some(64),
                fs: FsKind::Ext4,
                mount_point: Utf8PathBuf::from(RUN_MOUNTS).join("oem"),
            }),
            persistent: Some(PartitionSpec {
                label: "PERSISTENT".into(),
                size_mib: None,
                fs: FsKind::Ext4,
                mount_point: Utf8PathBuf::from(RUN_MOUNTS).join("persistent"),
            }),
        }
    }
}

/// Directory transient install mounts are placed under.
const RUN_MOUNTS: &str = "/run/ukinstall";

impl PartitionSet {
    /// All partitions in on-disk order.
    pub fn in_order(&self) -> Vec<PartitionSpec> {
        let mut parts = vec![self.efi.clone()];
        parts.extend(self.oem.clone());
        parts.extend(self.persistent.clone());
        parts
    }
}

/// Behavior toggles for the pipeline, independent of the job description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallConfig {
    /// When true, a failing before/after install hook aborts the install;
    /// otherwise the failure is logged and ignored.
    #[serde(default)]
    pub strict: bool,
    /// Directory containing one subdirectory of scripts per hook stage.
    #[serde(default = "default_hooks_dir")]
    pub hooks_dir: Utf8PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            strict: false,
            hooks_dir: default_hooks_dir(),
        }
    }
}

fn default_hooks_dir() -> Utf8PathBuf {
    "/usr/lib/ukinstall/hooks".into()
}

/// The YAML configuration file accepted by `ukinstall install --config`:
/// the job description plus behavior toggles, at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// The install job.
    #[serde(flatten)]
    pub spec: InstallSpec,
    /// Behavior toggles.
    #[serde(flatten)]
    pub config: InstallConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_partition_order() {
        let set = PartitionSet::default();
        let order: Vec<_> = set.in_order().iter().map(|p| p.label.clone()).collect();
        assert_eq!(order, ["EFI", "OEM", "PERSISTENT"]);
        // Only the last partition may be unsized
        assert!(set.efi.size_mib.is_some());
        assert!(set.in_order().last().unwrap().size_mib.is_none());
    }

    #[test]
    fn test_config_file_parse() {
        let input = indoc! { r#"
            device: /dev/vda
            source: /var/lib/images/uki
            skip-entries:
              - interactive-install
            strict: true
        "# };
        let parsed: ConfigFile = serde_yaml::from_str(input).unwrap();
        assert_eq!(parsed.spec.device, "/dev/vda");
        assert_eq!(parsed.spec.skip_entries, ["interactive-install"]);
        assert!(parsed.config.strict);
        assert_eq!(parsed.config.hooks_dir, "/usr/lib/ukinstall/hooks");
        assert_eq!(parsed.spec.partitions, PartitionSet::default());
    }

    #[test]
    fn test_config_file_partitions_override() {
        let input = indoc! { r#"
            device: /dev/nvme0n1
            source: /var/lib/images/uki
            partitions:
              efi:
                label: ESP
                size-mib: 2048
                fs: vfat
                mount-point: /run/ukinstall/efi
        "# };
        let parsed: ConfigFile = serde_yaml::from_str(input).unwrap();
        assert_eq!(parsed.spec.partitions.efi.label, "ESP");
        assert_eq!(parsed.spec.partitions.efi.size_mib, Some(2048));
        assert!(parsed.spec.partitions.oem.is_none());
        assert!(!parsed.config.strict);
    }
}

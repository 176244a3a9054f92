//! # The end-to-end install pipeline
//!
//! A linear, fail-fast sequence: prepare the target disk, mount it, dump
//! the install source onto the EFI system partition, then activate the
//! shipped boot entries. There are no retries and no partial recovery; the
//! only unwinding mechanism is the cleanup stack, which releases acquired
//! resources (today: the mounts) on every exit path.

use anyhow::{ensure, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use ukinstall_storage as storage;

use crate::bootentries::{rewrite_loader_default, EntryRewriter};
use crate::cleanup::CleanupStack;
use crate::hooks;
use crate::spec::{ConfigFile, InstallConfig, InstallSpec};

/// Fallback directory firmware searches when no boot entry applies.
const EFI_BOOT_DIR: &str = "EFI/BOOT";
/// Stage run before anything touches the disk; errors are ignored.
const PRE_INSTALL_STAGE: &str = "install.pre";
/// Stage run once the install finished; errors are ignored.
const AFTER_INSTALL_STAGE: &str = "install.after";
/// Hook run after partitioning but before the image is applied, kept
/// compatible with non-UKI installs so users can reuse their configs.
const BEFORE_INSTALL_HOOK: &str = "before-install";
/// Hook run after the image and boot entries are in place.
const AFTER_INSTALL_HOOK: &str = "after-install";
/// Well-known one-shot script run alongside the pre-install stage.
const PRE_INSTALL_HOOK_SCRIPT: &str = "/usr/bin/ukinstall.install.pre.hook";
/// Well-known one-shot script run alongside the after-install stage.
const AFTER_INSTALL_HOOK_SCRIPT: &str = "/usr/bin/ukinstall.install.after.hook";
/// Named hook stages run at the very end; failures here are fatal.
const POST_INSTALL_HOOKS: &[&str] = &["post-install"];

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Target block device, e.g. /dev/vda. Required here or in --config.
    #[clap(long)]
    pub(crate) device: Option<Utf8PathBuf>,

    /// Source tree (or single UKI binary) dumped onto the EFI system
    /// partition.
    #[clap(long)]
    pub(crate) source: Option<Utf8PathBuf>,

    /// Cloud config payload copied into the OEM partition.
    #[clap(long)]
    pub(crate) cloud_init: Option<Utf8PathBuf>,

    /// Remove boot entries whose kernel command line contains this
    /// substring. May be given multiple times.
    #[clap(long = "skip-entry")]
    #[serde(default)]
    pub(crate) skip_entries: Vec<String>,

    /// Abort the install when a before/after install hook fails.
    #[clap(long)]
    #[serde(default)]
    pub(crate) strict: bool,

    /// Directory containing one subdirectory of hook scripts per stage.
    #[clap(long)]
    pub(crate) hooks_dir: Option<Utf8PathBuf>,

    /// Load the job description from a YAML file; flags override it.
    #[clap(long)]
    #[serde(skip)]
    pub(crate) config: Option<Utf8PathBuf>,
}

impl InstallOpts {
    /// Merge the optional config file and the command line into the final
    /// job description. Flags win over file values.
    #[context("Resolving install configuration")]
    pub(crate) fn resolve(self) -> Result<(InstallSpec, InstallConfig)> {
        let file = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Reading {path}"))?;
                let parsed: ConfigFile = serde_yaml::from_str(&raw)
                    .with_context(|| format!("Parsing {path}"))?;
                Some(parsed)
            }
            None => None,
        };
        match file {
            Some(ConfigFile {
                mut spec,
                mut config,
            }) => {
                if let Some(device) = self.device {
                    spec.device = device;
                }
                if let Some(source) = self.source {
                    spec.source = source;
                }
                if self.cloud_init.is_some() {
                    spec.cloud_init = self.cloud_init;
                }
                if !self.skip_entries.is_empty() {
                    spec.skip_entries = self.skip_entries;
                }
                if self.strict {
                    config.strict = true;
                }
                if let Some(hooks_dir) = self.hooks_dir {
                    config.hooks_dir = hooks_dir;
                }
                Ok((spec, config))
            }
            None => {
                let spec = InstallSpec {
                    device: self.device.context("--device is required")?,
                    source: self.source.context("--source is required")?,
                    cloud_init: self.cloud_init,
                    skip_entries: self.skip_entries,
                    partitions: Default::default(),
                };
                let mut config = InstallConfig {
                    strict: self.strict,
                    ..Default::default()
                };
                if let Some(hooks_dir) = self.hooks_dir {
                    config.hooks_dir = hooks_dir;
                }
                Ok((spec, config))
            }
        }
    }
}

/// Entry point for the `install` verb.
pub(crate) fn run(opts: InstallOpts) -> Result<()> {
    let (spec, config) = opts.resolve()?;
    tracing::info!("Installing {} to {}", spec.source, spec.device);
    InstallAction::new(&config, &spec).run()
}

/// The install pipeline over one job description.
pub(crate) struct InstallAction<'a> {
    config: &'a InstallConfig,
    spec: &'a InstallSpec,
}

impl<'a> InstallAction<'a> {
    pub(crate) fn new(config: &'a InstallConfig, spec: &'a InstallSpec) -> Self {
        Self { config, spec }
    }

    /// Run the pipeline to completion, unwinding the cleanup stack on
    /// every exit path and folding cleanup failures into the result.
    pub(crate) fn run(&self) -> Result<()> {
        let mut cleanup = CleanupStack::new();
        let result = self.run_inner(&mut cleanup);
        cleanup.run(result)
    }

    fn run_inner(&self, cleanup: &mut CleanupStack) -> Result<()> {
        if let Err(err) = hooks::run_stage(self.config, PRE_INSTALL_STAGE) {
            tracing::debug!("Pre-install stage: {err:#}");
        }
        hooks::run_hook_script(PRE_INSTALL_HOOK_SCRIPT);

        let device = storage::list_device(&self.spec.device)?;
        ensure!(
            device.is_disk(),
            "{} is not a disk (type {:?})",
            self.spec.device,
            device.devtype
        );
        ensure!(
            !device.has_mounts(),
            "{} has mounted filesystems; refusing to install",
            self.spec.device
        );

        storage::deactivate_volumes(&self.spec.device)?;

        let layout = self.spec.partitions.in_order();
        let partitions = storage::partition_and_format(&self.spec.device, &layout)?;

        storage::mount_partitions(&partitions)?;
        cleanup.push({
            let partitions = partitions.clone();
            move || storage::unmount_partitions(&partitions)
        });

        // This hook happens after partitioning but before the image is
        // applied, matching the ordering of non-UKI installs.
        hooks::hook(self.config, BEFORE_INSTALL_HOOK)?;

        if let Some(payload) = &self.spec.cloud_init {
            let oem = self
                .spec
                .partitions
                .oem
                .as_ref()
                .context("A cloud-init payload was given but no oem partition is configured")?;
            storage::copy_cloud_config(&oem.mount_point, payload)?;
        }

        let esp = &self.spec.partitions.efi.mount_point;
        let fallback_dir = esp.join(EFI_BOOT_DIR);
        std::fs::create_dir_all(&fallback_dir)
            .with_context(|| format!("Creating {fallback_dir}"))?;

        let bytes = storage::dump_source(esp, &self.spec.source)?;
        tracing::debug!("Dumped {bytes} bytes to {esp}");

        tracing::debug!("Processing boot entries (skip list, placeholder substitution)");
        EntryRewriter::new(esp, &self.spec.skip_entries).walk()?;
        rewrite_loader_default(esp)?;

        hooks::hook(self.config, AFTER_INSTALL_HOOK)?;

        if let Err(err) = hooks::run_stage(self.config, AFTER_INSTALL_STAGE) {
            tracing::debug!("After-install stage: {err:#}");
        }
        hooks::run_hook_script(AFTER_INSTALL_HOOK_SCRIPT);

        hooks::run_named_hooks(self.config, POST_INSTALL_HOOKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn opts() -> InstallOpts {
        InstallOpts {
            device: None,
            source: None,
            cloud_init: None,
            skip_entries: Vec::new(),
            strict: false,
            hooks_dir: None,
            config: None,
        }
    }

    #[test]
    fn test_resolve_requires_device_and_source() {
        assert!(opts().resolve().is_err());
        let err = InstallOpts {
            device: Some("/dev/vda".into()),
            ..opts()
        }
        .resolve()
        .unwrap_err();
        assert!(format!("{err:#}").contains("--source"));
    }

    #[test]
    fn test_resolve_from_flags() {
        let (spec, config) = InstallOpts {
            device: Some("/dev/vda".into()),
            source: Some("/images/uki".into()),
            skip_entries: vec!["rescue".into()],
            strict: true,
            ..opts()
        }
        .resolve()
        .unwrap();
        assert_eq!(spec.device, "/dev/vda");
        assert_eq!(spec.skip_entries, ["rescue"]);
        assert!(config.strict);
        // The default layout always leads with the EFI system partition
        assert_eq!(spec.partitions.in_order()[0].label, "EFI");
    }

    #[test]
    fn test_resolve_flags_override_config_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("install.yaml");
        std::fs::write(
            &path,
            indoc! { r#"
                device: /dev/vda
                source: /images/uki
                skip-entries:
                  - interactive-install
                strict: false
            "# },
        )
        .unwrap();
        let (spec, config) = InstallOpts {
            device: Some("/dev/vdb".into()),
            strict: true,
            config: Some(Utf8PathBuf::try_from(path).unwrap()),
            ..opts()
        }
        .resolve()
        .unwrap();
        assert_eq!(spec.device, "/dev/vdb");
        assert_eq!(spec.source, "/images/uki");
        assert_eq!(spec.skip_entries, ["interactive-install"]);
        assert!(config.strict);
    }
}

//! Rewriting boot loader entries on the EFI system partition.
//!
//! Shipped images carry generic entries whose file names and `efi` values
//! contain a placeholder token. After the image has been dumped onto the
//! partition we walk every file under the mount point, drop the entries the
//! caller asked to skip, and substitute the placeholder with the installed
//! slot name. A wrong rewrite here bricks the boot path, so every error
//! aborts the walk immediately.

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::parsers::bootconf::{BootConf, BootConfError};

/// Placeholder token baked into shipped entry files and file names.
const ARTIFACT_TOKEN: &str = "artifact";
/// Name of the slot shipped entries are switched to at install time.
const ACTIVE_SLOT: &str = "active";
/// Path of the loader configuration below the EFI partition mount point.
const LOADER_CONF: &str = "loader/loader.conf";

/// What to do with one file discovered on the EFI partition.
#[derive(Debug, PartialEq, Eq)]
enum EntryAction {
    /// Leave the file alone.
    Keep,
    /// Delete the entry together with the EFI binary it references.
    Remove,
    /// Substitute the placeholder in the entry's `efi` value and file name.
    RewriteConfig,
    /// Substitute the placeholder in the file name only.
    RenameArtifact,
}

/// Decide the fate of a single file. `conf` is the parsed entry for `.conf`
/// files and `None` otherwise.
fn classify(filename: &str, conf: Option<&BootConf>, skip_entries: &[String]) -> EntryAction {
    match Utf8Path::new(filename).extension() {
        Some("conf") => {
            let Some(conf) = conf else {
                return EntryAction::Keep;
            };
            let cmdline = conf.get("cmdline").unwrap_or_default();
            if cmdline.is_empty() {
                return EntryAction::Keep;
            }
            if skip_entries.iter().any(|s| cmdline.contains(s.as_str())) {
                return EntryAction::Remove;
            }
            if filename.contains(ARTIFACT_TOKEN) {
                EntryAction::RewriteConfig
            } else {
                EntryAction::Keep
            }
        }
        Some("efi") if filename.contains(ARTIFACT_TOKEN) => EntryAction::RenameArtifact,
        _ => EntryAction::Keep,
    }
}

fn read_conf(path: &Utf8Path) -> Result<BootConf> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    BootConf::parse(&raw).with_context(|| format!("Parsing {path}"))
}

fn write_conf(path: &Utf8Path, conf: &BootConf) -> Result<()> {
    std::fs::write(path, conf.to_string()).with_context(|| format!("Writing {path}"))
}

/// Replace every placeholder occurrence in the value of `key`. The key must
/// already be present; the caller is expected to have checked
/// applicability.
fn rewrite_value(conf: &mut BootConf, key: &str, replacement: &str) -> Result<(), BootConfError> {
    let Some(value) = conf.get(key) else {
        return Err(BootConfError::MissingKey {
            key: key.to_string(),
        });
    };
    let rewritten = value.replace(ARTIFACT_TOKEN, replacement);
    conf.set(key, &rewritten);
    Ok(())
}

/// Replace every placeholder occurrence in the file's base name and rename
/// it in place. Returns the new path.
#[context("Renaming {path}")]
fn rewrite_filename(path: &Utf8Path, replacement: &str) -> Result<Utf8PathBuf> {
    let Some(name) = path.file_name() else {
        bail!("{path} has no file name");
    };
    let new_path = path.with_file_name(name.replace(ARTIFACT_TOKEN, replacement));
    if new_path != path {
        std::fs::rename(path, &new_path).with_context(|| format!("to {new_path}"))?;
    }
    Ok(new_path)
}

/// Turn a placeholder entry into the active one: substitute the token in
/// its `efi` value, write the entry back, then rename the file itself.
#[context("Activating entry {path}")]
fn activate_entry(path: &Utf8Path, mut conf: BootConf) -> Result<()> {
    rewrite_value(&mut conf, "efi", ACTIVE_SLOT)?;
    write_conf(path, &conf)?;
    rewrite_filename(path, ACTIVE_SLOT)?;
    Ok(())
}

/// Walks the EFI partition tree and applies the per-file decisions.
pub(crate) struct EntryRewriter<'a> {
    root: &'a Utf8Path,
    skip_entries: &'a [String],
}

impl<'a> EntryRewriter<'a> {
    pub(crate) fn new(root: &'a Utf8Path, skip_entries: &'a [String]) -> Self {
        Self { root, skip_entries }
    }

    /// Full recursive traversal. The first classification or execution
    /// error aborts the walk; a half rewritten boot partition must not
    /// look like success.
    #[context("Processing boot entries under {}", self.root)]
    pub(crate) fn walk(&self) -> Result<()> {
        self.walk_dir(self.root)
    }

    fn walk_dir(&self, dir: &Utf8Path) -> Result<()> {
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("Reading {dir}"))?
        {
            let entry = entry.with_context(|| format!("Reading {dir}"))?;
            let path = entry.path();
            if entry
                .file_type()
                .with_context(|| format!("stat {path}"))?
                .is_dir()
            {
                self.walk_dir(path)?;
            } else {
                self.process_file(path)?;
            }
        }
        Ok(())
    }

    fn process_file(&self, path: &Utf8Path) -> Result<()> {
        tracing::trace!("Checking {path}");
        let Some(filename) = path.file_name() else {
            return Ok(());
        };
        if path.extension() == Some("conf") {
            let conf = read_conf(path)?;
            match classify(filename, Some(&conf), self.skip_entries) {
                EntryAction::Remove => self.remove_entry(path, &conf),
                EntryAction::RewriteConfig => activate_entry(path, conf),
                _ => Ok(()),
            }
        } else {
            match classify(filename, None, self.skip_entries) {
                EntryAction::RenameArtifact => {
                    tracing::debug!("Renaming binary {path}");
                    rewrite_filename(path, ACTIVE_SLOT)?;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    /// Remove a skip listed entry and the EFI binary it references: the
    /// binary first, then the entry. Not transactional; a crash in between
    /// leaves a dangling entry pointing at a missing binary.
    fn remove_entry(&self, path: &Utf8Path, conf: &BootConf) -> Result<()> {
        if let Some(efi) = conf.get("efi").filter(|v| !v.is_empty()) {
            // Entry values are paths from the partition root
            let efi_path = self.root.join(efi.trim_start_matches('/'));
            tracing::debug!("Removing binary {efi_path}");
            std::fs::remove_file(&efi_path).with_context(|| format!("Removing {efi_path}"))?;
            tracing::debug!("Removing entry {path}");
            std::fs::remove_file(path).with_context(|| format!("Removing {path}"))?;
        }
        Ok(())
    }
}

/// Point the loader default at the installed slot. The loader config is
/// addressed directly rather than discovered by the walk, and the rewrite
/// is idempotent: once no placeholder remains it is a no-op.
#[context("Rewriting loader default")]
pub(crate) fn rewrite_loader_default(esp_root: &Utf8Path) -> Result<()> {
    let path = esp_root.join(LOADER_CONF);
    let mut conf = read_conf(&path)?;
    rewrite_value(&mut conf, "default", ACTIVE_SLOT)?;
    write_conf(&path, &conf)
}

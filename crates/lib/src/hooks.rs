//! Execution of user provided hook scripts around install stages.
//!
//! Hooks live below a configurable directory, one subdirectory per stage;
//! every executable in a stage directory runs in file name order. Whether a
//! failing hook aborts the install is explicit configuration passed in by
//! the caller, never ambient state.

use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use ukinstall_utils::CommandRunExt;

use crate::spec::InstallConfig;

fn is_executable(path: &Utf8Path) -> Result<bool> {
    let meta = path.metadata().with_context(|| format!("stat {path}"))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

/// Run every executable in the `stage` hook directory, in file name order.
/// A missing stage directory is not an error; a failing script is, and
/// aborts the stage.
#[context("Running stage {stage}")]
pub(crate) fn run_stage(config: &InstallConfig, stage: &str) -> Result<()> {
    let dir = config.hooks_dir.join(stage);
    if !dir.try_exists()? {
        tracing::trace!("No hooks for {stage}");
        return Ok(());
    }
    let mut scripts = Vec::new();
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry.with_context(|| format!("Reading {dir}"))?;
        if entry.file_type()?.is_file() {
            scripts.push(entry.into_path());
        }
    }
    scripts.sort();
    for script in scripts {
        if !is_executable(&script)? {
            tracing::trace!("Skipping non-executable {script}");
            continue;
        }
        tracing::debug!("Running hook {script}");
        Command::new(&script)
            .run()
            .with_context(|| format!("Hook {script}"))?;
    }
    Ok(())
}

/// Best effort run of a single well-known hook script. Failures are logged
/// and never propagated; a missing script is normal.
pub(crate) fn run_hook_script(path: &str) {
    let path = Utf8Path::new(path);
    if !path.exists() {
        return;
    }
    if let Err(err) = Command::new(path).run() {
        tracing::warn!("Hook script {path} failed: {err:#}");
    }
}

/// Run an ordered set of named hook stages. Unlike [`hook`], a failure here
/// is always fatal.
pub(crate) fn run_named_hooks(config: &InstallConfig, names: &[&str]) -> Result<()> {
    for name in names {
        run_stage(config, name)?;
    }
    Ok(())
}

/// [`run_stage`] wrapper that only adds logic to ignore errors when the
/// install is not configured as strict.
pub(crate) fn hook(config: &InstallConfig, stage: &str) -> Result<()> {
    tracing::info!("Running {stage} hook");
    match run_stage(config, stage) {
        Err(err) if !config.strict => {
            tracing::warn!("Ignoring {stage} hook failure: {err:#}");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::os::unix::fs::OpenOptionsExt;

    fn config_at(root: &Utf8Path) -> InstallConfig {
        InstallConfig {
            strict: false,
            hooks_dir: root.to_path_buf(),
        }
    }

    fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
        use std::io::Write;
        let path = dir.join(name);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o755)
            .open(&path)
            .unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        path
    }

    #[test]
    fn test_missing_stage_dir_is_ok() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        assert!(run_stage(&config_at(root), "before-install").is_ok());
    }

    #[test]
    fn test_scripts_run_in_name_order() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let stage = root.join("before-install");
        std::fs::create_dir_all(&stage).unwrap();
        let marker = root.join("marker");
        write_script(&stage, "20-second", &format!("echo second >> {marker}"));
        write_script(&stage, "10-first", &format!("echo first >> {marker}"));
        run_stage(&config_at(root), "before-install").unwrap();
        let seen = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(seen, "first\nsecond\n");
    }

    #[test]
    fn test_non_executable_skipped() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let stage = root.join("before-install");
        std::fs::create_dir_all(&stage).unwrap();
        std::fs::write(stage.join("README"), "not a script").unwrap();
        assert!(run_stage(&config_at(root), "before-install").is_ok());
    }

    #[test]
    fn test_failing_script_fails_stage() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let stage = root.join("after-install");
        std::fs::create_dir_all(&stage).unwrap();
        write_script(&stage, "00-fail", "exit 7");
        assert!(run_stage(&config_at(root), "after-install").is_err());
    }

    #[test]
    fn test_hook_strictness() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let stage = root.join("before-install");
        std::fs::create_dir_all(&stage).unwrap();
        write_script(&stage, "00-fail", "exit 1");

        let mut config = config_at(root);
        assert!(hook(&config, "before-install").is_ok());
        config.strict = true;
        assert!(hook(&config, "before-install").is_err());
    }

    #[test]
    fn test_run_hook_script_best_effort() {
        // Missing and failing scripts are both non-fatal
        run_hook_script("/does/not/exist.hook");
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let script = write_script(root, "fail.hook", "exit 1");
        run_hook_script(script.as_str());
    }
}

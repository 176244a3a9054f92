//! The command line surface.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::install::{self, InstallOpts};

/// Install a Unified Kernel Image based system onto a target disk.
#[derive(Debug, Parser)]
#[clap(name = "ukinstall", version)]
pub struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Partition the target device, apply the install source to its EFI
    /// system partition and activate the shipped boot entries.
    Install(InstallOpts),
}

/// Parse the process arguments and run the selected command to completion.
pub fn run_from_args() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Install(opts) => install::run(opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install() {
        let cli = Cli::try_parse_from([
            "ukinstall",
            "install",
            "--device",
            "/dev/vda",
            "--source",
            "/images/uki",
            "--skip-entry",
            "interactive-install",
            "--skip-entry",
            "rescue",
            "--strict",
        ])
        .unwrap();
        let Command::Install(opts) = cli.command;
        assert_eq!(opts.device.as_deref(), Some(camino::Utf8Path::new("/dev/vda")));
        assert_eq!(opts.skip_entries, ["interactive-install", "rescue"]);
        assert!(opts.strict);
    }
}

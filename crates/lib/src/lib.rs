//! # UKI install finalization
//!
//! This crate implements the last stage of installing a Unified Kernel
//! Image (UKI) based system onto a disk: partition and format the target,
//! dump the install source onto the EFI system partition, then walk the
//! shipped boot loader entries, dropping skip-listed ones and substituting
//! the generic placeholder names with the installed slot.

mod bootentries;
mod cleanup;
pub mod cli;
mod hooks;
mod install;
pub(crate) mod parsers;
pub mod spec;

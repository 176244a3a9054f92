//! Parsers for the on-disk formats we read and write back.

pub(crate) mod bootconf;

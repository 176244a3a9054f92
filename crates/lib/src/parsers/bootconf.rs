//! Parser for boot loader entry files.
//!
//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
//!
//! Entry files are line oriented `key value` pairs. We keep every key
//! verbatim, including ones we don't recognize, and preserve the order keys
//! appear in the file, so a parse/serialize round trip never reorders an
//! entry somebody else wrote. That keeps rewritten entries diffable against
//! what the image shipped.

use std::collections::HashMap;
use std::fmt::Display;

use thiserror::Error;

/// Errors from reading or editing a boot loader entry.
#[derive(Debug, Error)]
pub(crate) enum BootConfError {
    /// A non-empty line that could not be split into `key value`. A
    /// half-readable boot entry is unsafe to keep processing.
    #[error("malformed boot entry line {line}: {content:?}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// The offending line, verbatim.
        content: String,
    },
    /// A key the caller requires is not present.
    #[error("no {key} entry in .conf file")]
    MissingKey {
        /// The missing key.
        key: String,
    },
}

/// One parsed boot loader entry: an ordered key/value mapping.
///
/// Keys are case sensitive and unique; if a file repeats a key the last
/// value wins but the key keeps its first position.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct BootConf {
    /// Keys in the order they first appeared.
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl BootConf {
    pub(crate) fn parse(input: &str) -> Result<Self, BootConfError> {
        let mut conf = Self::default();
        for (idx, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                return Err(BootConfError::Malformed {
                    line: idx + 1,
                    content: raw.to_string(),
                });
            };
            conf.set(key, value.trim());
        }
        Ok(conf)
    }

    /// Value for `key`, if present.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Set `key` to `value`. An existing key keeps its position; a new key
    /// is appended.
    pub(crate) fn set(&mut self, key: &str, value: &str) {
        if !self.values.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.values.insert(key.to_string(), value.to_string());
    }
}

impl Display for BootConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for key in &self.order {
            if let Some(value) = self.values.get(key) {
                writeln!(f, "{key} {value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_round_trip_preserves_order() {
        let input = indoc! { "
            title Demo OS
            efi /EFI/demo/artifact.efi
            cmdline console=tty0 root=LABEL=STATE
            custom1 value1
        " };
        let conf = BootConf::parse(input).unwrap();
        assert_eq!(conf.get("title"), Some("Demo OS"));
        assert_eq!(conf.get("efi"), Some("/EFI/demo/artifact.efi"));
        assert_eq!(conf.get("custom1"), Some("value1"));
        assert_eq!(conf.to_string(), input);
    }

    #[test]
    fn test_whitespace_normalized() {
        // Tabs and extra spaces collapse to a single separator space
        let conf = BootConf::parse("title\t\tDemo OS\ncmdline  quiet\n").unwrap();
        assert_eq!(conf.get("title"), Some("Demo OS"));
        assert_eq!(conf.to_string(), "title Demo OS\ncmdline quiet\n");
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let err = BootConf::parse("title Demo\njustakey\n").unwrap_err();
        match err {
            BootConfError::Malformed { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "justakey");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_lines_skipped() {
        let conf = BootConf::parse("\ntitle Demo\n\n\ncmdline quiet\n").unwrap();
        assert_eq!(conf.to_string(), "title Demo\ncmdline quiet\n");
    }

    #[test]
    fn test_duplicate_key_keeps_first_position() {
        let conf = BootConf::parse("title First\ncmdline quiet\ntitle Second\n").unwrap();
        assert_eq!(conf.get("title"), Some("Second"));
        assert_eq!(conf.to_string(), "title Second\ncmdline quiet\n");
    }

    #[test]
    fn test_set_appends_new_key() {
        let mut conf = BootConf::parse("title Demo\n").unwrap();
        conf.set("efi", "/EFI/demo/active.efi");
        conf.set("title", "Demo OS");
        assert_eq!(conf.to_string(), "title Demo OS\nefi /EFI/demo/active.efi\n");
    }
}

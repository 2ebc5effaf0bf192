// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Comma-separated `key=value` option lists.
//!
//! Most device fields are encoded as an option list whose first entry may be
//! positional (a volume name, a device path, `socket`), followed by
//! `key=value` pairs: `local-lvm:vm-100-disk-0,cache=none,size=32G`.

use std::fmt::Display;
use std::str::FromStr;

use crate::WireError;

/// Assembles an option list. Entries are emitted in the order they are
/// added; absent optional values are skipped.
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    segments: Vec<String>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a keyless entry.
    pub fn positional(&mut self, value: impl Display) -> &mut Self {
        self.segments.push(value.to_string());
        self
    }

    pub fn pair(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.segments.push(format!("{}={}", key, value));
        self
    }

    pub fn optional<T: Display>(
        &mut self,
        key: &str,
        value: Option<T>,
    ) -> &mut Self {
        if let Some(value) = value {
            self.pair(key, value);
        }
        self
    }

    /// Emits `key=1` if `set`, and nothing otherwise.
    pub fn flag(&mut self, key: &str, set: bool) -> &mut Self {
        if set {
            self.pair(key, 1);
        }
        self
    }

    /// Emits `key=0` if `set` is false, and nothing otherwise. Used for
    /// options that default to enabled.
    pub fn unset_flag(&mut self, key: &str, set: bool) -> &mut Self {
        if !set {
            self.pair(key, 0);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn build(&self) -> String {
        self.segments.join(",")
    }
}

/// A parsed option list.
#[derive(Debug, Default)]
pub struct Segments<'a> {
    entries: Vec<(Option<&'a str>, &'a str)>,
}

impl<'a> Segments<'a> {
    pub fn parse(s: &'a str) -> Self {
        let entries = s
            .split(',')
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .map(|piece| match piece.split_once('=') {
                Some((key, value)) => (Some(key.trim()), value.trim()),
                None => (None, piece),
            })
            .collect();
        Self { entries }
    }

    /// The first entry, split into its key (if any) and value.
    pub fn first(&self) -> Option<(Option<&'a str>, &'a str)> {
        self.entries.first().copied()
    }

    /// The first entry if it is positional.
    pub fn leading(&self) -> Option<&'a str> {
        match self.first() {
            Some((None, value)) => Some(value),
            _ => None,
        }
    }

    /// Returns the value of the first entry with the given key.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.entries.iter().find_map(|(k, v)| match k {
            Some(k) if *k == key => Some(*v),
            _ => None,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates over the keyed entries. Unknown keys are simply never asked
    /// for, which keeps decoding tolerant of options added by newer versions.
    pub fn pairs(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.entries.iter().filter_map(|(k, v)| k.map(|k| (k, *v)))
    }

    /// Parses the value of `key` with `FromStr`.
    pub fn parse_opt<T: FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, WireError> {
        self.get(key)
            .map(|value| {
                value.parse::<T>().map_err(|_| WireError::InvalidOption {
                    option: key.to_owned(),
                    value: value.to_owned(),
                })
            })
            .transpose()
    }

    /// Parses the value of `key` as a boolean.
    pub fn flag(&self, key: &str) -> Result<Option<bool>, WireError> {
        self.get(key)
            .map(|value| {
                super::parse_bool(value).ok_or_else(|| {
                    WireError::InvalidOption {
                        option: key.to_owned(),
                        value: value.to_owned(),
                    }
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_skips_absent_values() {
        let mut builder = SegmentBuilder::new();
        builder
            .positional("local-lvm:32")
            .optional::<&str>("cache", None)
            .optional("aio", Some("native"))
            .flag("ssd", false)
            .flag("iothread", true)
            .unset_flag("backup", false)
            .unset_flag("replicate", true);
        assert_eq!(
            builder.build(),
            "local-lvm:32,aio=native,iothread=1,backup=0"
        );
    }

    #[test]
    fn empty_builder() {
        let builder = SegmentBuilder::new();
        assert!(builder.is_empty());
        assert_eq!(builder.build(), "");
    }

    #[test]
    fn parse_positional_and_pairs() {
        let volume = "local:100/vm-100-disk-0.qcow2";
        let value = format!("{volume},cache=none,size=32G");
        let segments = Segments::parse(&value);
        assert_eq!(segments.leading(), Some(volume));
        assert_eq!(segments.get("cache"), Some("none"));
        assert_eq!(segments.get("size"), Some("32G"));
        assert_eq!(segments.get("ssd"), None);
        assert_eq!(segments.pairs().count(), 2);
    }

    #[test]
    fn leading_pair_is_not_positional() {
        let segments = Segments::parse("virtio=BC:24:11:00:00:01,bridge=vmbr0");
        assert_eq!(segments.leading(), None);
        assert_eq!(
            segments.first(),
            Some((Some("virtio"), "BC:24:11:00:00:01"))
        );
    }

    #[test]
    fn values_split_on_first_equals() {
        let segments = Segments::parse("user=local:snippets/a=b.yml");
        assert_eq!(segments.get("user"), Some("local:snippets/a=b.yml"));
    }

    #[test]
    fn typed_accessors() {
        let segments = Segments::parse("queues=4,firewall=1,link_down=x");
        assert_eq!(segments.parse_opt::<u8>("queues").unwrap(), Some(4));
        assert_eq!(segments.flag("firewall").unwrap(), Some(true));
        assert!(segments.flag("link_down").is_err());
        assert!(segments.parse_opt::<u8>("firewall").is_ok());
        let segments = Segments::parse("queues=999");
        assert!(segments.parse_opt::<u8>("queues").is_err());
    }
}

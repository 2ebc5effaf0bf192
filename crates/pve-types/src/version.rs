// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("failed to parse version component {component:?} of {version:?}")]
    Component { version: String, component: String },

    #[error("expected 1 to 3 dot-separated components in version {0:?}")]
    ComponentCount(String),
}

/// The management API's product version (`major.minor.patch`).
///
/// Codecs receive this explicitly to decide whether a version-specific field
/// may be emitted and which spellings of a value are canonical.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, JsonSchema,
)]
pub struct PveVersion {
    major: u8,
    minor: u8,
    patch: u8,
}

impl PveVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    #[inline]
    pub fn major(&self) -> u8 {
        self.major
    }

    #[inline]
    pub fn minor(&self) -> u8 {
        self.minor
    }

    #[inline]
    pub fn patch(&self) -> u8 {
        self.patch
    }

    /// Returns true if this version is `other` or newer.
    #[inline]
    pub fn at_least(&self, other: PveVersion) -> bool {
        *self >= other
    }
}

impl FromStr for PveVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(VersionError::ComponentCount(s.to_owned()));
        }

        let mut fields = [0u8; 3];
        for (field, part) in fields.iter_mut().zip(parts.iter()) {
            *field = u8::from_str(part).map_err(|_| {
                VersionError::Component {
                    version: s.to_owned(),
                    component: (*part).to_owned(),
                }
            })?;
        }

        Ok(Self::new(fields[0], fields[1], fields[2]))
    }
}

impl Display for PveVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for PveVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'d> Deserialize<'d> for PveVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::PveVersion;
    use serde_test::{assert_tokens, Token};
    use std::str::FromStr;

    const TEST_CASES: &[(&str, Result<PveVersion, ()>)] = &[
        ("8.1.4", Ok(PveVersion::new(8, 1, 4))),
        ("7.4", Ok(PveVersion::new(7, 4, 0))),
        ("8", Ok(PveVersion::new(8, 0, 0))),
        ("8.1.4.1", Err(())),
        ("8.x.1", Err(())),
        ("8..1", Err(())),
        ("", Err(())),
        ("300.0.0", Err(())),
    ];

    #[test]
    fn version_from_str() {
        for (input, expected) in TEST_CASES {
            match PveVersion::from_str(input) {
                Ok(v) => assert_eq!(v, expected.unwrap()),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing version {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn version_ordering() {
        let v8 = PveVersion::new(8, 0, 0);
        assert!(PveVersion::new(8, 0, 1).at_least(v8));
        assert!(PveVersion::new(8, 0, 0).at_least(v8));
        assert!(!PveVersion::new(7, 4, 17).at_least(v8));
        assert!(PveVersion::new(10, 0, 0) > PveVersion::new(9, 9, 9));
    }

    #[test]
    fn version_serialization() {
        assert_tokens(&PveVersion::new(8, 2, 0), &[Token::Str("8.2.0")]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const GUEST_ID_MIN: u32 = 100;
const GUEST_ID_MAX: u32 = 999_999_999;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuestIdError {
    #[error(
        "guest ID {0} outside range of {min}-{max}",
        min = GUEST_ID_MIN,
        max = GUEST_ID_MAX
    )]
    OutOfRange(u64),

    #[error("failed to parse guest ID {0:?}")]
    Unparsable(String),
}

/// The cluster-wide numeric identifier of a guest (its "vmid").
///
/// Disk volume names embed the owning guest's ID, so the codecs need it to
/// re-derive the name of an existing volume.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, JsonSchema,
)]
pub struct GuestId(u32);

impl GuestId {
    pub fn new(id: u32) -> Result<Self, GuestIdError> {
        if !(GUEST_ID_MIN..=GUEST_ID_MAX).contains(&id) {
            return Err(GuestIdError::OutOfRange(u64::from(id)));
        }
        Ok(Self(id))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for GuestId {
    type Error = GuestIdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for GuestId {
    type Err = GuestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = u64::from_str(s)
            .map_err(|_| GuestIdError::Unparsable(s.to_owned()))?;
        let id = u32::try_from(id).map_err(|_| GuestIdError::OutOfRange(id))?;
        Self::new(id)
    }
}

impl Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for GuestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'d> Deserialize<'d> for GuestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let id = u32::deserialize(deserializer)?;
        Self::new(id).map_err(de::Error::custom)
    }
}

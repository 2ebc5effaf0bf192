// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded slot identifiers.
//!
//! Every device category attaches devices at numbered slots (`net0`,
//! `scsi12`, `usb4`, ...). Slots are sparse, so collections are keyed by these
//! newtypes rather than indexed by position, and a slot value outside its
//! category's range can't be constructed.

use std::fmt::{self, Display};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while constructing or parsing a slot identifier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("{kind} slot {value} outside range of 0-{max}")]
    OutOfRange { kind: &'static str, value: u64, max: u8 },

    #[error("failed to parse {kind} slot {value:?}")]
    Unparsable { kind: &'static str, value: String },
}

macro_rules! bounded_slot {
    ($(#[$attr:meta])* $name:ident, $kind:literal, $max:literal) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Debug,
            JsonSchema,
        )]
        pub struct $name(u8);

        impl $name {
            /// The highest slot number in this category.
            pub const MAX: u8 = $max;

            /// A short name for this slot category, used in error messages.
            pub const KIND: &'static str = $kind;

            pub fn new(slot: u8) -> Result<Self, SlotError> {
                if slot > Self::MAX {
                    return Err(SlotError::OutOfRange {
                        kind: Self::KIND,
                        value: u64::from(slot),
                        max: Self::MAX,
                    });
                }

                Ok(Self(slot))
            }

            #[inline]
            pub fn get(self) -> u8 {
                self.0
            }

            /// Iterates over every valid slot in ascending order.
            pub fn all() -> impl Iterator<Item = Self> {
                (0..=Self::MAX).map(Self)
            }

            /// Builds the wire key for this slot, e.g. `net3`.
            pub fn key(self, prefix: &str) -> String {
                format!("{}{}", prefix, self.0)
            }

            /// Recovers a slot from a wire key such as `net3`, returning
            /// `None` if `key` doesn't start with `prefix` followed by a
            /// valid slot number.
            pub fn from_key(prefix: &str, key: &str) -> Option<Self> {
                let digits = key.strip_prefix(prefix)?;
                if digits.is_empty()
                    || !digits.bytes().all(|b| b.is_ascii_digit())
                {
                    return None;
                }
                digits.parse().ok()
            }

            fn from_u64(value: u64) -> Result<Self, SlotError> {
                let slot = u8::try_from(value).map_err(|_| {
                    SlotError::OutOfRange {
                        kind: Self::KIND,
                        value,
                        max: Self::MAX,
                    }
                })?;
                Self::new(slot)
            }
        }

        impl TryFrom<u8> for $name {
            type Error = SlotError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for u8 {
            fn from(slot: $name) -> u8 {
                slot.0
            }
        }

        impl FromStr for $name {
            type Err = SlotError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = u64::from_str(s.trim()).map_err(|_| {
                    SlotError::Unparsable {
                        kind: Self::KIND,
                        value: s.to_owned(),
                    }
                })?;
                Self::from_u64(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_u8(self.0)
            }
        }

        impl<'d> Deserialize<'d> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'d>,
            {
                struct SlotVisitor;

                impl<'d> de::Visitor<'d> for SlotVisitor {
                    type Value = $name;

                    fn expecting(
                        &self,
                        f: &mut fmt::Formatter<'_>,
                    ) -> fmt::Result {
                        write!(
                            f,
                            "a {} slot number between 0 and {}",
                            $kind, $max
                        )
                    }

                    fn visit_u64<E: de::Error>(
                        self,
                        v: u64,
                    ) -> Result<$name, E> {
                        $name::from_u64(v).map_err(E::custom)
                    }

                    fn visit_i64<E: de::Error>(
                        self,
                        v: i64,
                    ) -> Result<$name, E> {
                        let v = u64::try_from(v).map_err(|_| {
                            E::custom(SlotError::Unparsable {
                                kind: $kind,
                                value: v.to_string(),
                            })
                        })?;
                        self.visit_u64(v)
                    }

                    fn visit_str<E: de::Error>(
                        self,
                        v: &str,
                    ) -> Result<$name, E> {
                        $name::from_str(v).map_err(E::custom)
                    }
                }

                deserializer.deserialize_any(SlotVisitor)
            }
        }
    };
}

bounded_slot!(
    /// An IDE bus position (`ide0`-`ide3`).
    IdeSlot,
    "ide",
    3
);

impl IdeSlot {
    /// Where the API attaches a guest's installation media (`ide2`).
    pub const MEDIA: IdeSlot = IdeSlot(2);
}
bounded_slot!(
    /// A SATA bus position (`sata0`-`sata5`).
    SataSlot,
    "sata",
    5
);
bounded_slot!(
    /// A SCSI bus position (`scsi0`-`scsi30`).
    ScsiSlot,
    "scsi",
    30
);
bounded_slot!(
    /// A VirtIO block bus position (`virtio0`-`virtio15`).
    VirtioSlot,
    "virtio",
    15
);
bounded_slot!(
    /// A network interface position (`net0`-`net31`). Cloud-init network
    /// settings (`ipconfigN`) share this numbering.
    NetSlot,
    "network",
    31
);
bounded_slot!(
    /// A host PCI passthrough position (`hostpci0`-`hostpci15`).
    PciSlot,
    "pci",
    15
);
bounded_slot!(
    /// A USB passthrough position (`usb0`-`usb4`).
    UsbSlot,
    "usb",
    4
);
bounded_slot!(
    /// A serial port position (`serial0`-`serial3`).
    SerialSlot,
    "serial",
    3
);
